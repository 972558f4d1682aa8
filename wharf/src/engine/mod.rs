//! Unified transport endpoints.
//!
//! An [`Endpoint`] hides TCP, TLS, UDP, DTLS, SCTP and UNIX sockets behind
//! one non-blocking read/write/shutdown surface. Endpoints never block and
//! never poll: the reactor watches their descriptor and calls back on
//! readiness, so a stalled operation surfaces as [`IoKind::WouldBlock`] (or
//! the TLS want variants) and is retried on the next wakeup. Security
//! handshakes are driven the same way through [`Endpoint::handshake_step`];
//! no application byte moves before the handshake finished, and after
//! `shutdown` the endpoint is unusable.

pub mod dtls;
pub mod socket;
pub mod tls;

pub use dtls::{DtlsContext, DtlsSession, Handshake};
pub use socket::{arp_lookup, KeepAlive};
pub use tls::{match_hostname, verify_cert_host, TlsConfig, TlsProvider, Verify};

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;

use rustls::{ClientConnection, ServerConnection, StreamOwned};
use tracing::debug;

use crate::errors::{Error, Result};

/// Transport protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Proto {
    Tcp,
    Udp,
    Tls,
    Dtls,
    Sctp,
}

/// Address family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Family {
    V4,
    V6,
    Unix,
}

/// Non-fatal and fatal I/O outcomes mapped from the OS and TLS layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    WouldBlock,
    Interrupted,
    Closed,
    TlsWantRead,
    TlsWantWrite,
    Fatal,
}

impl IoKind {
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock => Self::WouldBlock,
            std::io::ErrorKind::Interrupted => Self::Interrupted,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionAborted => Self::Closed,
            _ => Self::Fatal,
        }
    }
}

type TlsClientStream = StreamOwned<ClientConnection, TcpStream>;
type TlsServerStream = StreamOwned<ServerConnection, TcpStream>;

/// One wrapped connection, always non-blocking.
pub enum Endpoint {
    Tcp(TcpStream),
    TlsClient(Box<TlsClientStream>),
    TlsServer(Box<TlsServerStream>),
    Udp(UdpSocket),
    Dtls(Box<DtlsSession>),
    Sctp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Endpoint {
    pub fn proto(&self) -> Proto {
        match self {
            Self::Tcp(_) => Proto::Tcp,
            #[cfg(unix)]
            Self::Unix(_) => Proto::Tcp,
            Self::TlsClient(_) | Self::TlsServer(_) => Proto::Tls,
            Self::Udp(_) => Proto::Udp,
            Self::Dtls(_) => Proto::Dtls,
            Self::Sctp(_) => Proto::Sctp,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(s) | Self::Sctp(s) => s.peer_addr().ok(),
            Self::TlsClient(s) => s.sock.peer_addr().ok(),
            Self::TlsServer(s) => s.sock.peer_addr().ok(),
            Self::Udp(s) => s.peer_addr().ok(),
            Self::Dtls(s) => s.socket().and_then(|s| s.peer_addr().ok()),
            #[cfg(unix)]
            Self::Unix(_) => None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(s) | Self::Sctp(s) => s.local_addr().ok(),
            Self::TlsClient(s) => s.sock.local_addr().ok(),
            Self::TlsServer(s) => s.sock.local_addr().ok(),
            Self::Udp(s) => s.local_addr().ok(),
            Self::Dtls(s) => s.socket().and_then(|s| s.local_addr().ok()),
            #[cfg(unix)]
            Self::Unix(_) => None,
        }
    }

    /// Whether the security handshake (if any) has completed.
    pub fn is_ready(&self) -> bool {
        match self {
            Self::TlsClient(s) => !s.conn.is_handshaking(),
            Self::TlsServer(s) => !s.conn.is_handshaking(),
            Self::Dtls(s) => s.is_ready(),
            _ => true,
        }
    }

    /// Drives the security handshake one readiness step. Plain transports
    /// are done immediately; a pending step names the readiness it needs.
    pub fn handshake_step(&mut self) -> Result<Handshake> {
        match self {
            Self::TlsClient(stream) => tls_handshake_step(&mut stream.conn, &mut stream.sock),
            Self::TlsServer(stream) => tls_handshake_step(&mut stream.conn, &mut stream.sock),
            Self::Dtls(session) => session.handshake_step(),
            _ => Ok(Handshake::Done),
        }
    }

    /// Reads into `buf`; `Ok(0)` means the peer closed.
    pub fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, IoKind> {
        let attempted = match self {
            Self::Tcp(s) | Self::Sctp(s) => s.read(buf),
            Self::TlsClient(s) => {
                return s.read(buf).map_err(|e| tls_io_kind(&e, &s.conn, true))
            }
            Self::TlsServer(s) => {
                return s.read(buf).map_err(|e| tls_io_kind(&e, &s.conn, true))
            }
            Self::Udp(s) => s.recv(buf),
            Self::Dtls(s) => {
                return s.read(buf).map_err(|e| match e.kind() {
                    std::io::ErrorKind::WouldBlock => IoKind::TlsWantRead,
                    _ => IoKind::from_io(&e),
                })
            }
            #[cfg(unix)]
            Self::Unix(s) => s.read(buf),
        };
        attempted.map_err(|e| IoKind::from_io(&e))
    }

    /// Writes `buf`; the return counts bytes moved, a partial write leaves
    /// the remainder with the caller.
    pub fn write(&mut self, buf: &[u8]) -> std::result::Result<usize, IoKind> {
        let attempted = match self {
            Self::Tcp(s) | Self::Sctp(s) => s.write(buf),
            Self::TlsClient(s) => {
                return s.write(buf).map_err(|e| tls_io_kind(&e, &s.conn, false))
            }
            Self::TlsServer(s) => {
                return s.write(buf).map_err(|e| tls_io_kind(&e, &s.conn, false))
            }
            Self::Udp(s) => s.send(buf),
            Self::Dtls(s) => {
                return s.write(buf).map_err(|e| match e.kind() {
                    std::io::ErrorKind::WouldBlock => IoKind::TlsWantWrite,
                    _ => IoKind::from_io(&e),
                })
            }
            #[cfg(unix)]
            Self::Unix(s) => s.write(buf),
        };
        attempted.map_err(|e| IoKind::from_io(&e))
    }

    /// Flushes and closes; the endpoint is spent afterwards.
    pub fn shutdown(&mut self) -> Result<()> {
        match self {
            Self::Tcp(s) | Self::Sctp(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            Self::TlsClient(s) => {
                s.conn.send_close_notify();
                let _ = s.conn.complete_io(&mut s.sock);
                let _ = s.sock.shutdown(std::net::Shutdown::Both);
            }
            Self::TlsServer(s) => {
                s.conn.send_close_notify();
                let _ = s.conn.complete_io(&mut s.sock);
                let _ = s.sock.shutdown(std::net::Shutdown::Both);
            }
            Self::Dtls(s) => s.shutdown(),
            Self::Udp(_) => {}
            #[cfg(unix)]
            Self::Unix(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
        }
        Ok(())
    }

    /// Raw fd for reactor registration and socket options.
    #[cfg(unix)]
    pub fn socket(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        match self {
            Self::Tcp(s) | Self::Sctp(s) => s.as_raw_fd(),
            Self::TlsClient(s) => s.sock.as_raw_fd(),
            Self::TlsServer(s) => s.sock.as_raw_fd(),
            Self::Udp(s) => s.as_raw_fd(),
            Self::Dtls(s) => s.socket().map(|s| s.as_raw_fd()).unwrap_or(-1),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }

    /// Pending asynchronous-connect error on the underlying socket.
    #[cfg(unix)]
    pub fn take_connect_error(&self) -> Result<Option<std::io::Error>> {
        socket::take_connect_error(self.socket())
    }

    /// Applies receive/send buffer sizes to the underlying socket.
    #[cfg(unix)]
    pub fn buffer_size(&self, read: usize, write: usize) -> Result<()> {
        socket::set_buffer_sizes(self.socket(), read, write)
    }
}

fn tls_handshake_step<D>(
    conn: &mut impl std::ops::DerefMut<Target = rustls::ConnectionCommon<D>>,
    sock: &mut TcpStream,
) -> Result<Handshake> {
    while conn.is_handshaking() {
        match conn.complete_io(sock) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Ok(if conn.wants_write() {
                    Handshake::WantWrite
                } else {
                    Handshake::WantRead
                });
            }
            Err(err) => {
                return Err(Error::tls(format!("handshake failed: {err}")));
            }
        }
    }
    Ok(Handshake::Done)
}

fn tls_io_kind<D>(
    err: &std::io::Error,
    conn: &impl std::ops::Deref<Target = rustls::ConnectionCommon<D>>,
    reading: bool,
) -> IoKind {
    if err.kind() == std::io::ErrorKind::WouldBlock {
        if reading && conn.wants_write() {
            IoKind::TlsWantWrite
        } else if reading {
            IoKind::TlsWantRead
        } else {
            IoKind::TlsWantWrite
        }
    } else {
        IoKind::from_io(err)
    }
}

/// Transport factory: owns the TLS/DTLS contexts and wraps sockets.
pub struct Engine {
    tls: Arc<TlsProvider>,
    dtls: DtlsContext,
}

impl Engine {
    pub fn new(config: TlsConfig) -> Result<Self> {
        let dtls = DtlsContext::new(&config)?;
        let tls = Arc::new(TlsProvider::new(config)?);
        Ok(Self { tls, dtls })
    }

    pub fn tls(&self) -> &TlsProvider {
        &self.tls
    }

    /// Plain endpoint around an established stream.
    pub fn wrap(stream: TcpStream) -> Result<Endpoint> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        Ok(Endpoint::Tcp(stream))
    }

    /// Plain UNIX-domain endpoint.
    #[cfg(unix)]
    pub fn wrap_unix(stream: std::os::unix::net::UnixStream) -> Result<Endpoint> {
        stream.set_nonblocking(true)?;
        Ok(Endpoint::Unix(stream))
    }

    /// Connected-UDP endpoint.
    pub fn wrap_udp(socket: UdpSocket) -> Result<Endpoint> {
        socket.set_nonblocking(true)?;
        Ok(Endpoint::Udp(socket))
    }

    /// Client TLS endpoint; `host` is the SNI name and hostname-check
    /// target. The handshake runs through [`Endpoint::handshake_step`].
    pub fn wrap_client(&self, stream: TcpStream, host: &str) -> Result<Endpoint> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        let name = TlsProvider::server_name(host)?;
        let conn = ClientConnection::new(self.tls.client_config(), name)
            .map_err(|e| Error::tls(format!("client session for {host}: {e}")))?;
        debug!(host, "tls client session prepared");
        Ok(Endpoint::TlsClient(Box::new(StreamOwned::new(conn, stream))))
    }

    /// Server TLS endpoint using the pre-loaded chain and key.
    pub fn wrap_server(&self, stream: TcpStream) -> Result<Endpoint> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        let conn = ServerConnection::new(self.tls.server_config()?)
            .map_err(|e| Error::tls(format!("server session: {e}")))?;
        Ok(Endpoint::TlsServer(Box::new(StreamOwned::new(conn, stream))))
    }

    /// Client DTLS endpoint over a connected UDP socket.
    pub fn wrap_dtls_client(&self, socket: UdpSocket, host: &str) -> Result<Endpoint> {
        Ok(Endpoint::Dtls(Box::new(
            self.dtls.client_session(socket, host)?,
        )))
    }

    /// Server DTLS endpoint over a connected UDP socket.
    pub fn wrap_dtls_server(&self, socket: UdpSocket) -> Result<Endpoint> {
        Ok(Endpoint::Dtls(Box::new(self.dtls.server_session(socket)?)))
    }

    /// Starts a one-to-one SCTP stream connect; the caller watches connect
    /// readiness through the reactor.
    #[cfg(unix)]
    pub fn sctp_connect(addr: SocketAddr) -> Result<Endpoint> {
        use std::os::fd::FromRawFd;
        let fd = socket::stream_connect_fd(&addr, libc::IPPROTO_SCTP)?;
        // SAFETY: the fd was just created by stream_connect_fd and is owned
        // here exclusively.
        let stream = unsafe { TcpStream::from_raw_fd(fd) };
        Ok(Endpoint::Sctp(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    fn read_all(endpoint: &mut Endpoint, want: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        let deadline = Instant::now() + Duration::from_secs(5);
        while out.len() < want {
            match endpoint.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(IoKind::WouldBlock | IoKind::TlsWantRead | IoKind::TlsWantWrite) => {
                    assert!(Instant::now() < deadline, "read stalled");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(kind) => panic!("read failed: {kind:?}"),
            }
        }
        out
    }

    #[test]
    fn plain_endpoints_move_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_sock = TcpStream::connect(addr).unwrap();
        let (server_sock, _) = listener.accept().unwrap();

        let mut client = Engine::wrap(client_sock).unwrap();
        let mut server = Engine::wrap(server_sock).unwrap();
        assert!(client.is_ready());

        assert_eq!(client.write(b"hello").unwrap(), 5);
        let echoed = read_all(&mut server, 5);
        assert_eq!(echoed, b"hello");
        server.write(&echoed).unwrap();
        assert_eq!(read_all(&mut client, 5), b"hello");
    }

    #[test]
    fn udp_endpoints_frame_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.connect(client.local_addr().unwrap()).unwrap();
        client.connect(server.local_addr().unwrap()).unwrap();

        let mut a = Engine::wrap_udp(client).unwrap();
        let mut b = Engine::wrap_udp(server).unwrap();
        a.write(b"datagram").unwrap();
        assert_eq!(read_all(&mut b, 8), b"datagram");
    }

    #[test]
    fn reads_on_idle_sockets_would_block() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_sock = TcpStream::connect(addr).unwrap();
        let _server = listener.accept().unwrap();
        let mut client = Engine::wrap(client_sock).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf), Err(IoKind::WouldBlock));
    }

    #[test]
    fn io_kind_mapping() {
        let would_block = std::io::Error::new(std::io::ErrorKind::WouldBlock, "x");
        assert_eq!(IoKind::from_io(&would_block), IoKind::WouldBlock);
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "x");
        assert_eq!(IoKind::from_io(&reset), IoKind::Closed);
        let other = std::io::Error::new(std::io::ErrorKind::InvalidData, "x");
        assert_eq!(IoKind::from_io(&other), IoKind::Fatal);
    }
}
