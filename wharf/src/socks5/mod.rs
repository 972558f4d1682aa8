//! SOCKS5 (RFC 1928) with username/password auth (RFC 1929).
//!
//! The state machines in this module are sans-io: they consume bytes and
//! hand back bytes to send, so they can be unit tested without sockets and
//! driven by any transport. [`client`] and [`server`] wrap them with async
//! drivers. A tunnel performs exactly one handshake; any `Broken` transition
//! is terminal.

pub mod client;
pub mod server;

pub use client::Client;
pub use server::Server;

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::errors::{Error, Result};

/// Protocol version.
pub const VERSION: u8 = 0x05;
/// Username/password sub-negotiation version.
pub const AUTH_VERSION: u8 = 0x01;

/// Server reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Success = 0x00,
    Failure = 0x01,
    Forbidden = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    Refused = 0x05,
    TtlExpired = 0x06,
    CommandUnsupported = 0x07,
    AddressUnsupported = 0x08,
}

impl Reply {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Success),
            0x01 => Some(Self::Failure),
            0x02 => Some(Self::Forbidden),
            0x03 => Some(Self::NetworkUnreachable),
            0x04 => Some(Self::HostUnreachable),
            0x05 => Some(Self::Refused),
            0x06 => Some(Self::TtlExpired),
            0x07 => Some(Self::CommandUnsupported),
            0x08 => Some(Self::AddressUnsupported),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Success => "succeeded",
            Self::Failure => "general SOCKS server failure",
            Self::Forbidden => "connection not allowed by ruleset",
            Self::NetworkUnreachable => "network unreachable",
            Self::HostUnreachable => "host unreachable",
            Self::Refused => "connection refused",
            Self::TtlExpired => "TTL expired",
            Self::CommandUnsupported => "command not supported",
            Self::AddressUnsupported => "address type not supported",
        }
    }
}

/// Authentication methods this implementation understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    Gssapi = 0x01,
    Password = 0x02,
    NoAcceptable = 0xFF,
}

/// Handshake progression; `Broken` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Method,
    Auth,
    Request,
    Response,
    Handshake,
    Broken,
}

const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Connection target carried in the CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl Destination {
    pub fn port(&self) -> u16 {
        match self {
            Self::Ipv4(_, port) | Self::Ipv6(_, port) | Self::Domain(_, port) => *port,
        }
    }

    /// Serializes the ATYP, address and network-order port.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Ipv4(addr, port) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&addr.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            Self::Ipv6(addr, port) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&addr.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            Self::Domain(name, port) => {
                out.push(ATYP_DOMAIN);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    /// Parses an ATYP + address + port block; `None` while incomplete.
    pub fn decode(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        if buffer.is_empty() {
            return Ok(None);
        }
        match buffer[0] {
            ATYP_IPV4 => {
                if buffer.len() < 7 {
                    return Ok(None);
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buffer[1..5]);
                let port = u16::from_be_bytes([buffer[5], buffer[6]]);
                Ok(Some((Self::Ipv4(Ipv4Addr::from(octets), port), 7)))
            }
            ATYP_IPV6 => {
                if buffer.len() < 19 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buffer[1..17]);
                let port = u16::from_be_bytes([buffer[17], buffer[18]]);
                Ok(Some((Self::Ipv6(Ipv6Addr::from(octets), port), 19)))
            }
            ATYP_DOMAIN => {
                if buffer.len() < 2 {
                    return Ok(None);
                }
                let len = buffer[1] as usize;
                if buffer.len() < 2 + len + 2 {
                    return Ok(None);
                }
                let name = std::str::from_utf8(&buffer[2..2 + len])
                    .map_err(|_| Error::protocol("domain name is not utf-8"))?
                    .to_string();
                let port = u16::from_be_bytes([buffer[2 + len], buffer[2 + len + 1]]);
                Ok(Some((Self::Domain(name, port), 2 + len + 2)))
            }
            other => Err(Error::protocol(format!("unsupported address type {other:#x}"))),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ipv4(addr, port) => write!(f, "{addr}:{port}"),
            Self::Ipv6(addr, port) => write!(f, "[{addr}]:{port}"),
            Self::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_round_trip() {
        let targets = [
            Destination::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 8080),
            Destination::Ipv6(Ipv6Addr::LOCALHOST, 443),
            Destination::Domain("example.com".into(), 443),
        ];
        for target in targets {
            let mut wire = Vec::new();
            target.encode(&mut wire);
            let (parsed, used) = Destination::decode(&wire).unwrap().unwrap();
            assert_eq!(used, wire.len());
            assert_eq!(parsed, target);
        }
    }

    #[test]
    fn ports_travel_in_network_order() {
        let mut wire = Vec::new();
        Destination::Ipv4(Ipv4Addr::LOCALHOST, 0x1F90).encode(&mut wire);
        assert_eq!(&wire[5..], &[0x1F, 0x90]);
    }

    #[test]
    fn partial_domain_asks_for_more() {
        let mut wire = Vec::new();
        Destination::Domain("example.com".into(), 80).encode(&mut wire);
        for cut in 0..wire.len() {
            assert!(Destination::decode(&wire[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn unknown_atyp_is_rejected() {
        assert!(Destination::decode(&[0x05, 0, 0]).is_err());
    }
}
