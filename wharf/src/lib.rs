//! # wharf
//!
//! An event-driven networking framework: a single-threaded reactor with
//! timers, signals and cross-thread wakeups; a unified TLS-capable
//! transport over TCP, UDP, DTLS, SCTP and UNIX sockets; per-connection
//! broker state with rate marks and per-operation timeouts; a fork-based
//! worker cluster speaking a chunked IPC protocol; HTTP/1.1 and HTTP/2
//! codecs; a WebSocket engine with per-message compression and optional
//! encryption; SOCKS5 on both ends; a compression/crypto toolbox; Basic
//! and Digest authentication; and DNS/ICMP facilities.
//!
//! Modules are feature-gated the way the crate is grouped (`hash`, `auth`,
//! `http`, `ws`, `socks5`, `cluster`, `dns`, `ping`); the default `full`
//! feature enables everything. Logging goes through `tracing`; the
//! embedder installs the subscriber.

pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod node;
pub mod scheme;

#[cfg(feature = "auth")]
pub mod auth;
#[cfg(feature = "cluster")]
pub mod cluster;
#[cfg(feature = "dns")]
pub mod dns;
#[cfg(feature = "hash")]
pub mod hash;
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "ping")]
pub mod ping;
#[cfg(feature = "socks5")]
pub mod socks5;
#[cfg(feature = "ws")]
pub mod ws;

pub use dispatch::Dispatch;
pub use engine::{Endpoint, Engine};
pub use errors::{Error, ErrorKind, Result};
pub use scheme::{BrokerId, Scheme, SchemeId};
