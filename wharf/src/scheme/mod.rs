//! Per-connection state: schemes, brokers and the ID-indexed registry.
//!
//! A scheme groups one logical listener or client session and carries the
//! defaults every broker under it starts from: rate marks, per-operation
//! timeouts and keep-alive parameters. A broker is one live connection. The
//! registry owns broker state keyed by id — components pass `BrokerId` and
//! `SchemeId` around and resolve them here, nobody holds pointers into
//! somebody else's state.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::engine::{arp_lookup, KeepAlive};

pub type SchemeId = u16;
pub type BrokerId = u64;

/// Coalescing thresholds for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    /// Callbacks are suppressed while fewer bytes than this are staged.
    pub min: usize,
    /// Staging never exceeds this; reaching it forces the callback.
    pub max: usize,
}

impl Mark {
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            min: min.max(1),
            max: max.max(min.max(1)),
        }
    }
}

impl Default for Mark {
    fn default() -> Self {
        Self {
            min: 1,
            max: 64 * 1024,
        }
    }
}

/// Read/write rate marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Marks {
    pub read: Mark,
    pub write: Mark,
}

/// Per-operation deadlines in seconds; 0 disables the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    pub read_s: u64,
    pub write_s: u64,
    pub connect_s: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read_s: 30,
            write_s: 30,
            connect_s: 10,
        }
    }
}

/// One logical listener or client session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scheme {
    pub id: SchemeId,
    pub marks: Marks,
    pub timeouts: Timeouts,
    pub keep_alive: KeepAlive,
    /// Upper bound on queued outgoing bytes per broker.
    pub tx_limit: Option<usize>,
}

impl Scheme {
    pub fn new(id: SchemeId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

/// Metadata of one live connection.
#[derive(Debug, Clone)]
pub struct Broker {
    pub id: BrokerId,
    pub scheme_id: SchemeId,
    /// Raw socket descriptor (-1 when the platform has no fd notion).
    pub fd: i32,
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    mac: Option<String>,
}

impl Broker {
    pub fn new(
        id: BrokerId,
        scheme_id: SchemeId,
        fd: i32,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        let mac = peer_addr.and_then(|addr| arp_lookup(&addr.ip()));
        Self {
            id,
            scheme_id,
            fd,
            peer_addr,
            local_addr,
            mac,
        }
    }

    /// Raw socket descriptor.
    pub fn socket(&self) -> i32 {
        self.fd
    }

    /// Peer IP as text; empty when unknown (UNIX sockets).
    pub fn ip(&self) -> String {
        self.peer_addr
            .map(|a| a.ip().to_string())
            .unwrap_or_default()
    }

    /// Best-effort peer MAC for LAN neighbors; empty otherwise.
    pub fn mac(&self) -> String {
        self.mac.clone().unwrap_or_default()
    }

    /// Peer port; 0 when unknown.
    pub fn port(&self) -> u16 {
        self.peer_addr.map(|a| a.port()).unwrap_or(0)
    }
}

/// ID-indexed registry of live broker metadata. Cores resolve ids here;
/// the connection state itself lives with the owning core on the reactor
/// thread.
#[derive(Default)]
pub struct Registry {
    brokers: HashMap<BrokerId, Broker>,
    next_broker: BrokerId,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> BrokerId {
        self.next_broker += 1;
        self.next_broker
    }

    pub fn insert(&mut self, broker: Broker) {
        self.brokers.insert(broker.id, broker);
    }

    pub fn remove(&mut self, id: BrokerId) -> Option<Broker> {
        self.brokers.remove(&id)
    }

    pub fn get(&self, id: BrokerId) -> Option<&Broker> {
        self.brokers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }

    pub fn ids(&self) -> Vec<BrokerId> {
        self.brokers.keys().copied().collect()
    }
}

/// Turns a bandwidth figure into a read/write mark pair.
pub fn marks_for_bandwidth(read_bps: u64, write_bps: u64) -> Marks {
    // A tenth of a second of line rate per callback, clamped to sane bounds.
    let derive = |bps: u64| -> Mark {
        let per_tick = (bps / 8 / 10).clamp(1, 4 * 1024 * 1024) as usize;
        Mark::new(1, per_tick)
    };
    Marks {
        read: derive(read_bps),
        write: derive(write_bps),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_defaults_follow_the_contract() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.read_s, 30);
        assert_eq!(timeouts.write_s, 30);
        assert_eq!(timeouts.connect_s, 10);
    }

    #[test]
    fn marks_never_invert() {
        let mark = Mark::new(100, 10);
        assert!(mark.max >= mark.min);
        let mark = Mark::new(0, 0);
        assert_eq!(mark.min, 1);
    }

    #[test]
    fn registry_hands_out_unique_ids() {
        let mut registry = Registry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert_ne!(a, b);
    }

    #[test]
    fn bandwidth_marks_scale_with_rate() {
        let slow = marks_for_bandwidth(64_000, 64_000);
        let fast = marks_for_bandwidth(1_000_000_000, 1_000_000_000);
        assert!(fast.read.max > slow.read.max);
    }

    #[test]
    fn broker_reports_empty_mac_for_unknown_peers() {
        let broker = Broker::new(1, 1, -1, Some("203.0.113.9:4000".parse().unwrap()), None);
        assert_eq!(broker.mac(), "");
        assert_eq!(broker.ip(), "203.0.113.9");
        assert_eq!(broker.port(), 4000);
    }
}
