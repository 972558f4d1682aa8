//! DTLS sessions over connected, non-blocking UDP sockets.
//!
//! rustls has no DTLS, so this path drives OpenSSL synchronously; the
//! reactor supplies readiness and calls back into the session's handshake
//! stepper. Before a server admits a handshake it runs a stateless,
//! application-level cookie exchange: the first datagram from an unknown
//! peer is answered with an HMAC cookie over the peer address, and only a
//! correct echo is allowed to proceed. That bounds amplification without
//! per-peer state. After a client handshake completes the peer certificate
//! is checked against the dialed host (SAN first, CN fallback).

use std::io::{Read, Write};
use std::net::{SocketAddr, UdpSocket};

use hmac::{Hmac, Mac};
use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslContextBuilder,
    SslFiletype, SslMethod, SslStream, SslVerifyMode,
};
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, trace};

use crate::engine::tls::{verify_cert_host, TlsConfig, Verify};
use crate::errors::{Error, Result};

const COOKIE_MAGIC: &[u8; 4] = b"WHRF";
const KIND_HELLO: u8 = 0x00;
const KIND_COOKIE: u8 = 0x01;
const KIND_ECHO: u8 = 0x02;
const COOKIE_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// What a handshake step is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Done,
    WantRead,
    WantWrite,
}

/// DTLS context shared by every session of one engine.
pub struct DtlsContext {
    context: SslContext,
    verify: Verify,
    cookie_secret: [u8; 32],
}

impl DtlsContext {
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let mut builder = SslContextBuilder::new(SslMethod::dtls())?;
        if let Some(chain) = &config.cert_chain {
            builder.set_certificate_chain_file(chain)?;
        }
        if let Some(key) = &config.private_key {
            builder.set_private_key_file(key, SslFiletype::PEM)?;
        }
        if let Some(ca) = &config.ca_file {
            builder.set_ca_file(ca)?;
        }
        let mode = match config.verify {
            Verify::None => SslVerifyMode::NONE,
            Verify::Peer => SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
            Verify::Optional => SslVerifyMode::PEER,
        };
        builder.set_verify(mode);
        let mut cookie_secret = [0u8; 32];
        rand::rng().fill_bytes(&mut cookie_secret);
        Ok(Self {
            context: builder.build(),
            verify: config.verify,
            cookie_secret,
        })
    }

    fn cookie_for(&self, peer: &SocketAddr) -> [u8; COOKIE_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.cookie_secret)
            .expect("hmac accepts any key length");
        mac.update(peer.to_string().as_bytes());
        let digest = mac.finalize().into_bytes();
        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(&digest);
        cookie
    }

    /// Client session; `host` is checked against the server certificate.
    pub fn client_session(&self, socket: UdpSocket, host: &str) -> Result<DtlsSession> {
        socket
            .peer_addr()
            .map_err(|_| Error::tls("dtls socket must be connected"))?;
        socket.set_nonblocking(true)?;
        let mut ssl = Ssl::new(&self.context)?;
        ssl.set_hostname(host)?;
        Ok(DtlsSession {
            verify: self.verify,
            host: Some(host.to_string()),
            state: State::ClientHello { socket, ssl },
        })
    }

    /// Server session on a connected socket; the cookie exchange runs first.
    pub fn server_session(&self, socket: UdpSocket) -> Result<DtlsSession> {
        let peer = socket
            .peer_addr()
            .map_err(|_| Error::tls("dtls socket must be connected"))?;
        socket.set_nonblocking(true)?;
        let ssl = Ssl::new(&self.context)?;
        Ok(DtlsSession {
            verify: self.verify,
            host: None,
            state: State::ServerCookie {
                socket,
                ssl,
                expected: self.cookie_for(&peer),
            },
        })
    }
}

fn parse_cookie_packet(packet: &[u8], kind: u8) -> Result<[u8; COOKIE_LEN]> {
    if packet.len() < 5 || &packet[..4] != COOKIE_MAGIC || packet[4] != kind {
        return Err(Error::protocol("not the expected cookie packet"));
    }
    let mut cookie = [0u8; COOKIE_LEN];
    if kind != KIND_HELLO {
        if packet.len() < 5 + COOKIE_LEN {
            return Err(Error::protocol("short cookie packet"));
        }
        cookie.copy_from_slice(&packet[5..5 + COOKIE_LEN]);
    }
    Ok(cookie)
}

/// Adapts the connected socket to the byte traits OpenSSL drives; one write
/// is one datagram, one read yields one datagram.
pub struct DatagramIo {
    socket: UdpSocket,
}

impl DatagramIo {
    fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl Read for DatagramIo {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.socket.recv(buf)
    }
}

impl Write for DatagramIo {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.socket.send(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum State {
    /// Client: the hello that opens the cookie exchange is still unsent.
    ClientHello { socket: UdpSocket, ssl: Ssl },
    /// Client: hello sent, waiting for the server's cookie.
    ClientCookie { socket: UdpSocket, ssl: Ssl },
    /// Server: waiting for a hello or a correct cookie echo.
    ServerCookie {
        socket: UdpSocket,
        ssl: Ssl,
        expected: [u8; COOKIE_LEN],
    },
    /// The OpenSSL handshake is mid-flight.
    Handshaking(MidHandshakeSslStream<DatagramIo>),
    /// Application records flow.
    Ready(SslStream<DatagramIo>),
    Failed,
    /// Transitional placeholder while a step runs.
    Poisoned,
}

/// One DTLS endpoint, stepped by reactor readiness callbacks.
pub struct DtlsSession {
    verify: Verify,
    host: Option<String>,
    state: State,
}

impl DtlsSession {
    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    fn socket_of(state: &State) -> Option<&UdpSocket> {
        match state {
            State::ClientHello { socket, .. }
            | State::ClientCookie { socket, .. }
            | State::ServerCookie { socket, .. } => Some(socket),
            State::Handshaking(mid) => Some(mid.get_ref().socket()),
            State::Ready(stream) => Some(stream.get_ref().socket()),
            State::Failed | State::Poisoned => None,
        }
    }

    pub fn socket(&self) -> Option<&UdpSocket> {
        Self::socket_of(&self.state)
    }

    /// Advances the cookie exchange and handshake one readiness step.
    pub fn handshake_step(&mut self) -> Result<Handshake> {
        let state = std::mem::replace(&mut self.state, State::Poisoned);
        let (next, outcome) = self.advance(state);
        self.state = next;
        outcome
    }

    fn advance(&mut self, state: State) -> (State, Result<Handshake>) {
        match state {
            State::ClientHello { socket, ssl } => {
                let mut hello = Vec::with_capacity(5);
                hello.extend_from_slice(COOKIE_MAGIC);
                hello.push(KIND_HELLO);
                match socket.send(&hello) {
                    Ok(_) => (
                        State::ClientCookie { socket, ssl },
                        Ok(Handshake::WantRead),
                    ),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => (
                        State::ClientHello { socket, ssl },
                        Ok(Handshake::WantWrite),
                    ),
                    Err(err) => (State::Failed, Err(Error::from(err))),
                }
            }
            State::ClientCookie { socket, ssl } => {
                let mut packet = [0u8; 64];
                let read = match socket.recv(&mut packet) {
                    Ok(read) => read,
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        return (
                            State::ClientCookie { socket, ssl },
                            Ok(Handshake::WantRead),
                        )
                    }
                    Err(err) => return (State::Failed, Err(Error::from(err))),
                };
                let cookie = match parse_cookie_packet(&packet[..read], KIND_COOKIE) {
                    Ok(cookie) => cookie,
                    Err(err) => return (State::Failed, Err(err)),
                };
                let mut echo = Vec::with_capacity(5 + COOKIE_LEN);
                echo.extend_from_slice(COOKIE_MAGIC);
                echo.push(KIND_ECHO);
                echo.extend_from_slice(&cookie);
                if let Err(err) = socket.send(&echo) {
                    return (State::Failed, Err(Error::from(err)));
                }
                trace!("dtls cookie exchange complete (client)");
                self.start_handshake(ssl, socket, true)
            }
            State::ServerCookie {
                socket,
                ssl,
                expected,
            } => {
                let mut packet = [0u8; 64];
                let read = match socket.recv(&mut packet) {
                    Ok(read) => read,
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        return (
                            State::ServerCookie {
                                socket,
                                ssl,
                                expected,
                            },
                            Ok(Handshake::WantRead),
                        )
                    }
                    Err(err) => return (State::Failed, Err(Error::from(err))),
                };
                if parse_cookie_packet(&packet[..read], KIND_HELLO).is_ok() {
                    let mut answer = Vec::with_capacity(5 + COOKIE_LEN);
                    answer.extend_from_slice(COOKIE_MAGIC);
                    answer.push(KIND_COOKIE);
                    answer.extend_from_slice(&expected);
                    if let Err(err) = socket.send(&answer) {
                        return (State::Failed, Err(Error::from(err)));
                    }
                    return (
                        State::ServerCookie {
                            socket,
                            ssl,
                            expected,
                        },
                        Ok(Handshake::WantRead),
                    );
                }
                match parse_cookie_packet(&packet[..read], KIND_ECHO) {
                    Ok(echoed) if echoed == expected => {
                        trace!("dtls cookie exchange complete (server)");
                        self.start_handshake(ssl, socket, false)
                    }
                    Ok(_) => (State::Failed, Err(Error::tls("bad dtls cookie"))),
                    Err(err) => (State::Failed, Err(err)),
                }
            }
            State::Handshaking(mid) => match mid.handshake() {
                Ok(stream) => self.finish_handshake(stream),
                Err(HandshakeError::WouldBlock(mid)) => {
                    let wants = if mid.error().code() == ErrorCode::WANT_WRITE {
                        Handshake::WantWrite
                    } else {
                        Handshake::WantRead
                    };
                    (State::Handshaking(mid), Ok(wants))
                }
                Err(HandshakeError::Failure(mid)) => (
                    State::Failed,
                    Err(Error::tls(format!("dtls handshake failed: {}", mid.error()))),
                ),
                Err(HandshakeError::SetupFailure(err)) => {
                    (State::Failed, Err(Error::from(err)))
                }
            },
            State::Ready(stream) => (State::Ready(stream), Ok(Handshake::Done)),
            State::Failed | State::Poisoned => {
                (State::Failed, Err(Error::tls("dtls session is spent")))
            }
        }
    }

    fn start_handshake(
        &mut self,
        ssl: Ssl,
        socket: UdpSocket,
        connect: bool,
    ) -> (State, Result<Handshake>) {
        let io = DatagramIo::new(socket);
        let attempt = if connect { ssl.connect(io) } else { ssl.accept(io) };
        match attempt {
            Ok(stream) => self.finish_handshake(stream),
            Err(HandshakeError::WouldBlock(mid)) => {
                let wants = if mid.error().code() == ErrorCode::WANT_WRITE {
                    Handshake::WantWrite
                } else {
                    Handshake::WantRead
                };
                (State::Handshaking(mid), Ok(wants))
            }
            Err(HandshakeError::Failure(mid)) => (
                State::Failed,
                Err(Error::tls(format!("dtls handshake failed: {}", mid.error()))),
            ),
            Err(HandshakeError::SetupFailure(err)) => (State::Failed, Err(Error::from(err))),
        }
    }

    fn finish_handshake(&mut self, stream: SslStream<DatagramIo>) -> (State, Result<Handshake>) {
        if self.verify != Verify::None {
            if let Some(host) = &self.host {
                let Some(cert) = stream.ssl().peer_certificate() else {
                    return (
                        State::Failed,
                        Err(Error::tls("server presented no certificate")),
                    );
                };
                if let Err(err) = verify_cert_host(&cert, host) {
                    return (State::Failed, Err(err));
                }
            }
        }
        debug!("dtls session established");
        (State::Ready(stream), Ok(Handshake::Done))
    }

    /// Reads one decrypted datagram; only valid once ready.
    pub fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.state {
            State::Ready(stream) => stream.read(buf),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "dtls handshake incomplete",
            )),
        }
    }

    /// Writes one datagram; only valid once ready.
    pub fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.state {
            State::Ready(stream) => stream.write(buf),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "dtls handshake incomplete",
            )),
        }
    }

    /// Sends the close alert, best effort.
    pub fn shutdown(&mut self) {
        if let State::Ready(stream) = &mut self.state {
            let _ = stream.shutdown();
        }
        self.state = State::Failed;
    }
}
