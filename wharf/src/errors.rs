//! Crate-wide error taxonomy.
//!
//! Every subsystem surfaces failures through [`Error`], which carries one of
//! the coarse [`ErrorKind`] categories plus a human-readable message and an
//! optional context string (the broker, scheme or stream the failure belongs
//! to). Parser failures never panic; they close the affected stream and bubble
//! an `Error` through the owning callback set.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse failure categories surfaced by the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Socket or syscall failure. Fatal for the owning broker.
    Transport,
    /// TLS/DTLS handshake or record failure. Fatal.
    Tls,
    /// Malformed HTTP/WebSocket/SOCKS5 bytes. Fatal for the stream.
    Protocol,
    /// Read/write/connect deadline expired. Recoverable by reconnecting.
    Timeout,
    /// A size bound was exceeded (header block, frame, chunk). Fatal for the stream.
    Limit,
    /// Credentials rejected. Non-fatal at the transport level.
    Auth,
    /// Fork/spawn/respawn failure in the worker cluster.
    Cluster,
    /// The platform does not support the requested capability; the call is a no-op.
    OsBroken,
    /// The operation was aborted by the caller.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::Tls => "tls",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Limit => "limit",
            Self::Auth => "auth",
            Self::Cluster => "cluster",
            Self::OsBroken => "os-broken",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Concrete error type for all public operations.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    context: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
            source: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Tls, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Limit, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn cluster(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cluster, message)
    }

    pub fn os_broken(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OsBroken, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Attaches the scheme/broker/stream the failure belongs to.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attaches the underlying cause.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::Interrupted => ErrorKind::Cancelled,
            _ => ErrorKind::Transport,
        };
        Self::new(kind, err.to_string()).with_source(err)
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Self::new(ErrorKind::Tls, err.to_string()).with_source(err)
    }
}

impl From<openssl::ssl::Error> for Error {
    fn from(err: openssl::ssl::Error) -> Self {
        Self::new(ErrorKind::Tls, err.to_string()).with_source(err)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::new(ErrorKind::Tls, err.to_string()).with_source(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_carried() {
        let err = Error::protocol("bad start line").with_context("broker=7");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.context(), Some("broker=7"));
        assert_eq!(err.to_string(), "protocol: bad start line");
    }

    #[test]
    fn io_timeout_maps_to_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow peer");
        assert_eq!(Error::from(io).kind(), ErrorKind::Timeout);
    }
}
