//! Asynchronous DNS resolver with explicit nameserver lists.
//!
//! A deliberately small UDP resolver: A and AAAA questions, compressed-name
//! aware answer parsing, per-family nameserver lists, and a cache that lives
//! until the owning scheme flushes it. Resolution picks the first usable
//! address; servers are tried in order with a per-attempt timeout.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::errors::{Error, Result};

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;
const QCLASS_IN: u16 = 1;
const MAX_POINTER_JUMPS: usize = 16;

/// Address family to resolve for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn qtype(self) -> u16 {
        match self {
            Self::V4 => QTYPE_A,
            Self::V6 => QTYPE_AAAA,
        }
    }
}

/// Resolver knobs.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Nameservers asked for A records.
    pub nameservers4: Vec<SocketAddr>,
    /// Nameservers asked for AAAA records.
    pub nameservers6: Vec<SocketAddr>,
    /// Per-server wait before moving on.
    pub attempt_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let defaults: Vec<SocketAddr> = vec![
            SocketAddr::from(([8, 8, 8, 8], 53)),
            SocketAddr::from(([1, 1, 1, 1], 53)),
        ];
        Self {
            nameservers4: defaults.clone(),
            nameservers6: defaults,
            attempt_timeout: Duration::from_secs(3),
        }
    }
}

/// UDP resolver with a scheme-lifetime cache.
pub struct Resolver {
    config: ResolverConfig,
    cache: Mutex<HashMap<(String, Family), IpAddr>>,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the nameserver list for one family.
    pub fn nameservers(&mut self, family: Family, servers: Vec<SocketAddr>) {
        match family {
            Family::V4 => self.config.nameservers4 = servers,
            Family::V6 => self.config.nameservers6 = servers,
        }
    }

    /// Drops every cached answer (scheme teardown).
    pub fn flush(&self) {
        self.cache.lock().expect("dns cache lock poisoned").clear();
    }

    /// Resolves `host` to a single usable address.
    pub async fn resolve(&self, host: &str, family: Family) -> Result<IpAddr> {
        // Literal addresses skip the wire entirely.
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let key = (host.to_ascii_lowercase(), family);
        if let Some(ip) = self
            .cache
            .lock()
            .expect("dns cache lock poisoned")
            .get(&key)
        {
            trace!(host, "dns cache hit");
            return Ok(*ip);
        }

        let servers = match family {
            Family::V4 => &self.config.nameservers4,
            Family::V6 => &self.config.nameservers6,
        };
        if servers.is_empty() {
            return Err(Error::transport("no nameservers configured"));
        }

        let mut last_err = Error::timeout(format!("no answer for {host}"));
        for server in servers {
            match self.query(*server, host, family).await {
                Ok(Some(ip)) => {
                    self.cache
                        .lock()
                        .expect("dns cache lock poisoned")
                        .insert(key, ip);
                    debug!(host, %ip, %server, "dns resolved");
                    return Ok(ip);
                }
                Ok(None) => {
                    last_err = Error::transport(format!("{server} had no usable record"));
                }
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    async fn query(
        &self,
        server: SocketAddr,
        host: &str,
        family: Family,
    ) -> Result<Option<IpAddr>> {
        let bind: SocketAddr = if server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;

        let id: u16 = rand::rng().random();
        let packet = build_query(id, host, family.qtype())?;
        socket.send(&packet).await?;

        let mut answer = [0u8; 1500];
        let read = timeout(self.config.attempt_timeout, socket.recv(&mut answer))
            .await
            .map_err(|_| Error::timeout(format!("nameserver {server} timed out")))??;
        let addresses = parse_response(&answer[..read], id, family.qtype())?;
        Ok(addresses.into_iter().next())
    }
}

/// Builds one question packet.
pub(crate) fn build_query(id: u16, host: &str, qtype: u16) -> Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(32 + host.len());
    packet.extend_from_slice(&id.to_be_bytes());
    // Standard query, recursion desired.
    packet.extend_from_slice(&0x0100u16.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&[0; 6]);
    for label in host.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(Error::protocol(format!("bad hostname label in {host}")));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(packet)
}

fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize> {
    let mut jumps = 0usize;
    loop {
        let len = *packet
            .get(pos)
            .ok_or_else(|| Error::protocol("truncated name"))? as usize;
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            // Compression pointer ends the name in place.
            if pos + 1 >= packet.len() {
                return Err(Error::protocol("truncated name pointer"));
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(Error::protocol("name pointer loop"));
            }
            return Ok(pos + 2);
        }
        pos += 1 + len;
    }
}

/// Extracts every address record of `qtype` from a response packet.
pub(crate) fn parse_response(packet: &[u8], id: u16, qtype: u16) -> Result<Vec<IpAddr>> {
    if packet.len() < 12 {
        return Err(Error::protocol("short dns response"));
    }
    let answer_id = u16::from_be_bytes([packet[0], packet[1]]);
    if answer_id != id {
        return Err(Error::protocol("dns transaction id mismatch"));
    }
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if flags & 0x8000 == 0 {
        return Err(Error::protocol("not a dns response"));
    }
    let rcode = flags & 0x000F;
    if rcode != 0 {
        return Err(Error::protocol(format!("dns error rcode {rcode}")));
    }
    let questions = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    let answers = u16::from_be_bytes([packet[6], packet[7]]) as usize;

    let mut pos = 12;
    for _ in 0..questions {
        pos = skip_name(packet, pos)?;
        pos += 4;
    }

    let mut out = Vec::new();
    for _ in 0..answers {
        pos = skip_name(packet, pos)?;
        if pos + 10 > packet.len() {
            return Err(Error::protocol("truncated answer record"));
        }
        let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let rdlength = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > packet.len() {
            return Err(Error::protocol("truncated rdata"));
        }
        if rtype == qtype {
            match (rtype, rdlength) {
                (QTYPE_A, 4) => {
                    let mut octets = [0u8; 4];
                    octets.copy_from_slice(&packet[pos..pos + 4]);
                    out.push(IpAddr::from(octets));
                }
                (QTYPE_AAAA, 16) => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&packet[pos..pos + 16]);
                    out.push(IpAddr::from(octets));
                }
                _ => {}
            }
        }
        pos += rdlength;
    }
    Ok(out)
}
