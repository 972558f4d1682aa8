//! SOCKS5 server: sans-io machine plus an async acceptor.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::socks5::{
    AuthMethod, Destination, Reply, State, AUTH_VERSION, CMD_CONNECT, VERSION,
};

/// Credential validator for the password method.
pub type Validator = Box<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Write these bytes to the client.
    Send(Vec<u8>),
    /// Wait for more client bytes.
    Pending,
    /// The client asked to CONNECT; the driver resolves and connects, then
    /// calls [`Server::reply`].
    Connect(Destination),
    /// Tunnel established; leftover bytes are application data.
    Established(Vec<u8>),
}

/// Server-side handshake state machine.
pub struct Server {
    state: State,
    validator: Option<Validator>,
    buffer: Vec<u8>,
    authenticated: bool,
}

impl Server {
    /// Without a validator the server selects NOAUTH; with one it requires
    /// the username/password method.
    pub fn new(validator: Option<Validator>) -> Self {
        Self {
            state: State::Method,
            validator,
            buffer: Vec::new(),
            authenticated: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn broken(&mut self, message: impl Into<String>) -> Error {
        self.state = State::Broken;
        Error::protocol(message)
    }

    /// Feeds client bytes into the machine.
    pub fn feed(&mut self, data: &[u8]) -> Result<Step> {
        if self.state == State::Broken {
            return Err(Error::protocol("handshake already failed"));
        }
        if self.state == State::Handshake {
            return Ok(Step::Established(data.to_vec()));
        }
        self.buffer.extend_from_slice(data);
        match self.state {
            State::Method => {
                if self.buffer.len() < 2 {
                    return Ok(Step::Pending);
                }
                let (ver, count) = (self.buffer[0], self.buffer[1] as usize);
                if ver != VERSION {
                    return Err(self.broken(format!("client version {ver}")));
                }
                if count == 0 {
                    return Err(self.broken("empty method list"));
                }
                if self.buffer.len() < 2 + count {
                    return Ok(Step::Pending);
                }
                let methods = self.buffer[2..2 + count].to_vec();
                self.buffer.drain(..2 + count);
                let wanted = if self.validator.is_some() {
                    AuthMethod::Password
                } else {
                    AuthMethod::NoAuth
                };
                if !methods.contains(&(wanted as u8)) {
                    self.state = State::Broken;
                    return Ok(Step::Send(vec![VERSION, AuthMethod::NoAcceptable as u8]));
                }
                self.state = if wanted == AuthMethod::Password {
                    State::Auth
                } else {
                    State::Request
                };
                Ok(Step::Send(vec![VERSION, wanted as u8]))
            }
            State::Auth => {
                if self.buffer.len() < 2 {
                    return Ok(Step::Pending);
                }
                let ver = self.buffer[0];
                if ver != AUTH_VERSION {
                    return Err(self.broken(format!("auth sub-negotiation version {ver}")));
                }
                let ulen = self.buffer[1] as usize;
                if self.buffer.len() < 2 + ulen + 1 {
                    return Ok(Step::Pending);
                }
                let plen = self.buffer[2 + ulen] as usize;
                if self.buffer.len() < 2 + ulen + 1 + plen {
                    return Ok(Step::Pending);
                }
                let user = String::from_utf8_lossy(&self.buffer[2..2 + ulen]).into_owned();
                let pass =
                    String::from_utf8_lossy(&self.buffer[3 + ulen..3 + ulen + plen]).into_owned();
                self.buffer.drain(..3 + ulen + plen);
                let validator = self
                    .validator
                    .as_ref()
                    .ok_or_else(|| Error::protocol("auth bytes without validator"))?;
                if validator(&user, &pass) {
                    self.authenticated = true;
                    self.state = State::Request;
                    Ok(Step::Send(vec![AUTH_VERSION, 0x00]))
                } else {
                    self.state = State::Broken;
                    debug!(user, "socks5 credentials rejected");
                    Ok(Step::Send(vec![AUTH_VERSION, 0x01]))
                }
            }
            State::Request => {
                if self.buffer.len() < 4 {
                    return Ok(Step::Pending);
                }
                let (ver, cmd, _rsv) = (self.buffer[0], self.buffer[1], self.buffer[2]);
                if ver != VERSION {
                    return Err(self.broken(format!("request version {ver}")));
                }
                let parsed = match Destination::decode(&self.buffer[3..]) {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        // Unknown ATYP: answer per the taxonomy, then break.
                        return Ok(Step::Send(self.reply(Reply::AddressUnsupported, None)));
                    }
                };
                let Some((destination, used)) = parsed else {
                    return Ok(Step::Pending);
                };
                self.buffer.drain(..3 + used);
                self.state = State::Response;
                if cmd != CMD_CONNECT {
                    return Ok(Step::Send(self.reply(Reply::CommandUnsupported, None)));
                }
                Ok(Step::Connect(destination))
            }
            _ => Ok(Step::Pending),
        }
    }

    /// Builds the reply frame; on success the machine enters `Handshake`.
    pub fn reply(&mut self, reply: Reply, bound: Option<SocketAddr>) -> Vec<u8> {
        let mut out = vec![VERSION, reply as u8, 0x00];
        let bound = bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        match bound {
            SocketAddr::V4(addr) => {
                Destination::Ipv4(*addr.ip(), addr.port()).encode(&mut out)
            }
            SocketAddr::V6(addr) => {
                Destination::Ipv6(*addr.ip(), addr.port()).encode(&mut out)
            }
        }
        self.state = if reply == Reply::Success {
            State::Handshake
        } else {
            State::Broken
        };
        out
    }
}

fn reply_for_error(err: &std::io::Error) -> Reply {
    match err.kind() {
        std::io::ErrorKind::ConnectionRefused => Reply::Refused,
        std::io::ErrorKind::TimedOut => Reply::TtlExpired,
        std::io::ErrorKind::HostUnreachable => Reply::HostUnreachable,
        std::io::ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
        _ => Reply::Failure,
    }
}

/// Serves one client connection up to an established tunnel.
///
/// Returns the connected target stream and the destination the client asked
/// for; the caller owns the byte shuffling from here (see
/// [`tunnel`]).
pub async fn serve<S>(stream: &mut S, validator: Option<Validator>) -> Result<(TcpStream, Destination)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut machine = Server::new(validator);
    let mut chunk = [0u8; 512];
    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(Error::transport("client closed during handshake"));
        }
        match machine.feed(&chunk[..read])? {
            Step::Send(bytes) => {
                stream.write_all(&bytes).await?;
                if machine.state() == State::Broken {
                    return Err(Error::protocol("handshake refused"));
                }
            }
            Step::Pending => {}
            Step::Connect(destination) => {
                let target = match &destination {
                    Destination::Ipv4(addr, port) => {
                        TcpStream::connect((*addr, *port)).await
                    }
                    Destination::Ipv6(addr, port) => {
                        TcpStream::connect((*addr, *port)).await
                    }
                    Destination::Domain(name, port) => {
                        TcpStream::connect((name.as_str(), *port)).await
                    }
                };
                match target {
                    Ok(target) => {
                        let bound = target.local_addr().ok();
                        let bytes = machine.reply(Reply::Success, bound);
                        stream.write_all(&bytes).await?;
                        debug!(%destination, "socks5 tunnel established");
                        return Ok((target, destination));
                    }
                    Err(err) => {
                        let bytes = machine.reply(reply_for_error(&err), None);
                        stream.write_all(&bytes).await?;
                        return Err(Error::transport(format!(
                            "target unreachable: {err}"
                        )));
                    }
                }
            }
            Step::Established(_) => {
                return Err(Error::protocol("bytes before the tunnel was built"));
            }
        }
    }
}

/// Shuffles bytes between the client and the target until either side closes.
pub async fn tunnel<A, B>(client: &mut A, target: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let copied = tokio::io::copy_bidirectional(client, target).await?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn no_auth_handshake_reaches_connect() {
        let mut server = Server::new(None);
        let step = server.feed(&[0x05, 0x01, 0x00]).unwrap();
        assert_eq!(step, Step::Send(vec![0x05, 0x00]));

        let mut request = vec![0x05, 0x01, 0x00];
        Destination::Domain("example.com".into(), 443).encode(&mut request);
        let step = server.feed(&request).unwrap();
        assert_eq!(
            step,
            Step::Connect(Destination::Domain("example.com".into(), 443))
        );

        let reply = server.reply(Reply::Success, Some(SocketAddr::from(([127, 0, 0, 1], 9))));
        assert_eq!(reply[1], 0x00);
        assert_eq!(server.state(), State::Handshake);
    }

    #[test]
    fn password_is_required_when_validator_present() {
        let mut server = Server::new(Some(Box::new(|u, p| u == "u" && p == "p")));
        let step = server.feed(&[0x05, 0x01, 0x00]).unwrap();
        // Client only offered NOAUTH: no acceptable method.
        assert_eq!(step, Step::Send(vec![0x05, 0xFF]));
        assert_eq!(server.state(), State::Broken);
    }

    #[test]
    fn password_flow_validates_credentials() {
        let mut server = Server::new(Some(Box::new(|u, p| u == "u" && p == "p")));
        let step = server.feed(&[0x05, 0x02, 0x00, 0x02]).unwrap();
        assert_eq!(step, Step::Send(vec![0x05, 0x02]));

        let step = server.feed(&[0x01, 0x01, b'u', 0x01, b'p']).unwrap();
        assert_eq!(step, Step::Send(vec![0x01, 0x00]));
        assert_eq!(server.state(), State::Request);
    }

    #[test]
    fn bad_credentials_break_terminally() {
        let mut server = Server::new(Some(Box::new(|_, _| false)));
        server.feed(&[0x05, 0x01, 0x02]).unwrap();
        let step = server.feed(&[0x01, 0x01, b'u', 0x01, b'x']).unwrap();
        assert_eq!(step, Step::Send(vec![0x01, 0x01]));
        assert_eq!(server.state(), State::Broken);
        assert!(server.feed(&[0x05]).is_err());
    }

    #[test]
    fn unsupported_command_is_answered() {
        let mut server = Server::new(None);
        server.feed(&[0x05, 0x01, 0x00]).unwrap();
        // BIND request.
        let mut request = vec![0x05, 0x02, 0x00];
        Destination::Ipv4(Ipv4Addr::LOCALHOST, 80).encode(&mut request);
        let step = server.feed(&request).unwrap();
        let Step::Send(reply) = step else { panic!("expected reply") };
        assert_eq!(reply[1], Reply::CommandUnsupported as u8);
    }

    #[test]
    fn split_arrival_is_buffered() {
        let mut server = Server::new(None);
        assert_eq!(server.feed(&[0x05]).unwrap(), Step::Pending);
        assert_eq!(
            server.feed(&[0x01, 0x00]).unwrap(),
            Step::Send(vec![0x05, 0x00])
        );
    }
}
