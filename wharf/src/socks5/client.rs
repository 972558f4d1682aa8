//! SOCKS5 client: sans-io machine plus an async driver.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{Error, Result};
use crate::socks5::{
    AuthMethod, Destination, Reply, State, AUTH_VERSION, CMD_CONNECT, VERSION,
};

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Write these bytes to the proxy.
    Send(Vec<u8>),
    /// Wait for more proxy bytes.
    Pending,
    /// Tunnel established; any leftover bytes are application data.
    Established(Vec<u8>),
}

/// Client-side handshake state machine.
pub struct Client {
    state: State,
    destination: Destination,
    credentials: Option<(String, String)>,
    buffer: Vec<u8>,
}

impl Client {
    pub fn new(destination: Destination, credentials: Option<(String, String)>) -> Self {
        Self {
            state: State::Method,
            destination,
            credentials,
            buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// First bytes to send: version plus the offered methods.
    pub fn start(&self) -> Vec<u8> {
        match &self.credentials {
            Some(_) => vec![
                VERSION,
                2,
                AuthMethod::NoAuth as u8,
                AuthMethod::Password as u8,
            ],
            None => vec![VERSION, 1, AuthMethod::NoAuth as u8],
        }
    }

    fn broken(&mut self, message: impl Into<String>) -> Error {
        self.state = State::Broken;
        Error::protocol(message)
    }

    /// Feeds proxy bytes into the machine.
    pub fn feed(&mut self, data: &[u8]) -> Result<Step> {
        if self.state == State::Broken {
            return Err(Error::protocol("handshake already failed"));
        }
        if self.state == State::Handshake {
            // One handshake per tunnel; everything after it is payload.
            return Ok(Step::Established(data.to_vec()));
        }
        self.buffer.extend_from_slice(data);
        loop {
            match self.state {
                State::Method => {
                    if self.buffer.len() < 2 {
                        return Ok(Step::Pending);
                    }
                    let (ver, method) = (self.buffer[0], self.buffer[1]);
                    self.buffer.drain(..2);
                    if ver != VERSION {
                        return Err(self.broken(format!("proxy answered version {ver}")));
                    }
                    match method {
                        m if m == AuthMethod::NoAuth as u8 => {
                            self.state = State::Response;
                            return Ok(Step::Send(self.connect_request()));
                        }
                        m if m == AuthMethod::Password as u8 => {
                            let Some((user, pass)) = self.credentials.clone() else {
                                return Err(self.broken("proxy demands credentials we lack"));
                            };
                            self.state = State::Auth;
                            return Ok(Step::Send(auth_request(&user, &pass)?));
                        }
                        _ => return Err(self.broken("no acceptable authentication method")),
                    }
                }
                State::Auth => {
                    if self.buffer.len() < 2 {
                        return Ok(Step::Pending);
                    }
                    let (ver, status) = (self.buffer[0], self.buffer[1]);
                    self.buffer.drain(..2);
                    if ver != AUTH_VERSION {
                        return Err(self.broken(format!("auth sub-negotiation version {ver}")));
                    }
                    if status != 0 {
                        self.state = State::Broken;
                        return Err(Error::auth("proxy rejected the credentials"));
                    }
                    self.state = State::Response;
                    return Ok(Step::Send(self.connect_request()));
                }
                State::Response => {
                    if self.buffer.len() < 3 {
                        return Ok(Step::Pending);
                    }
                    let (ver, rep) = (self.buffer[0], self.buffer[1]);
                    if ver != VERSION {
                        return Err(self.broken(format!("reply version {ver}")));
                    }
                    let Some(reply) = Reply::from_byte(rep) else {
                        return Err(self.broken(format!("unknown reply code {rep:#x}")));
                    };
                    // Bound address follows the RSV byte.
                    let Some((_bound, used)) = Destination::decode(&self.buffer[3..])? else {
                        return Ok(Step::Pending);
                    };
                    self.buffer.drain(..3 + used);
                    if reply != Reply::Success {
                        self.state = State::Broken;
                        return Err(Error::protocol(format!(
                            "proxy refused: {}",
                            reply.describe()
                        )));
                    }
                    self.state = State::Handshake;
                    return Ok(Step::Established(std::mem::take(&mut self.buffer)));
                }
                _ => return Ok(Step::Pending),
            }
        }
    }

    fn connect_request(&self) -> Vec<u8> {
        let mut out = vec![VERSION, CMD_CONNECT, 0x00];
        self.destination.encode(&mut out);
        out
    }
}

fn auth_request(user: &str, pass: &str) -> Result<Vec<u8>> {
    if user.len() > 255 || pass.len() > 255 {
        return Err(Error::protocol("credentials longer than 255 bytes"));
    }
    let mut out = vec![AUTH_VERSION, user.len() as u8];
    out.extend_from_slice(user.as_bytes());
    out.push(pass.len() as u8);
    out.extend_from_slice(pass.as_bytes());
    Ok(out)
}

/// Performs the full handshake over `stream`, leaving it tunneled.
///
/// Returns application bytes the target may already have sent behind the
/// proxy's reply; the caller consumes them before reading the stream again.
pub async fn connect<S>(
    stream: &mut S,
    destination: Destination,
    credentials: Option<(String, String)>,
) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut machine = Client::new(destination, credentials);
    stream.write_all(&machine.start()).await?;
    let mut chunk = [0u8; 512];
    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(Error::transport("proxy closed during handshake"));
        }
        match machine.feed(&chunk[..read])? {
            Step::Send(bytes) => stream.write_all(&bytes).await?,
            Step::Pending => {}
            Step::Established(leftover) => return Ok(leftover),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn dest() -> Destination {
        Destination::Domain("example.com".into(), 443)
    }

    #[test]
    fn no_auth_flow() {
        let mut client = Client::new(dest(), None);
        assert_eq!(client.start(), vec![0x05, 0x01, 0x00]);

        let step = client.feed(&[0x05, 0x00]).unwrap();
        let Step::Send(request) = step else { panic!("expected request") };
        assert_eq!(&request[..3], &[0x05, 0x01, 0x00]);
        assert_eq!(request[3], 0x03);
        assert_eq!(request[4] as usize, "example.com".len());

        // Success reply with a zero IPv4 bind address.
        let mut reply = vec![0x05, 0x00, 0x00];
        Destination::Ipv4(Ipv4Addr::UNSPECIFIED, 0).encode(&mut reply);
        let step = client.feed(&reply).unwrap();
        assert_eq!(step, Step::Established(Vec::new()));
        assert_eq!(client.state(), State::Handshake);
    }

    #[test]
    fn password_flow() {
        let mut client = Client::new(dest(), Some(("u".into(), "p".into())));
        assert_eq!(client.start(), vec![0x05, 0x02, 0x00, 0x02]);

        let Step::Send(auth) = client.feed(&[0x05, 0x02]).unwrap() else {
            panic!("expected auth bytes")
        };
        assert_eq!(auth, vec![0x01, 0x01, b'u', 0x01, b'p']);

        let Step::Send(request) = client.feed(&[0x01, 0x00]).unwrap() else {
            panic!("expected connect request")
        };
        assert_eq!(request[1], 0x01);
    }

    #[test]
    fn rejected_credentials_break_the_machine() {
        let mut client = Client::new(dest(), Some(("u".into(), "bad".into())));
        client.feed(&[0x05, 0x02]).unwrap();
        assert!(client.feed(&[0x01, 0x01]).is_err());
        assert_eq!(client.state(), State::Broken);
        // Terminal: further bytes are refused.
        assert!(client.feed(&[0x05, 0x00]).is_err());
    }

    #[test]
    fn refused_reply_surfaces_the_taxonomy() {
        let mut client = Client::new(dest(), None);
        client.feed(&[0x05, 0x00]).unwrap();
        let mut reply = vec![0x05, 0x05, 0x00];
        Destination::Ipv4(Ipv4Addr::UNSPECIFIED, 0).encode(&mut reply);
        let err = client.feed(&reply).unwrap_err();
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn tunneled_bytes_pass_after_success() {
        let mut client = Client::new(dest(), None);
        client.feed(&[0x05, 0x00]).unwrap();
        let mut reply = vec![0x05, 0x00, 0x00];
        Destination::Ipv4(Ipv4Addr::UNSPECIFIED, 0).encode(&mut reply);
        reply.extend_from_slice(b"early");
        let Step::Established(leftover) = client.feed(&reply).unwrap() else {
            panic!("expected establishment")
        };
        assert_eq!(leftover, b"early");
        // Post-handshake feeds pass through verbatim.
        let Step::Established(data) = client.feed(b"hello").unwrap() else {
            panic!("expected passthrough")
        };
        assert_eq!(data, b"hello");
    }
}
