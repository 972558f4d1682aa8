//! WebSocket engine: RFC 6455 framing, extension negotiation and the
//! Upgrade handshake.
//!
//! [`Session`] ties the pieces together for one peer: it builds outgoing
//! frames (masked on the client side), reassembles fragmented messages,
//! applies the negotiated per-message transforms and tracks the close
//! protocol — after a peer CLOSE, further frames from that peer are ignored.

mod extension;
mod frame;
mod handshake;

pub use extension::{
    accept, finish, offer, EncryptionConfig, ExtensionsConfig, MessageCodec, Negotiated, Role,
};
pub use frame::{
    decode, encode, encode_close, parse_close, CloseReason, Frame, Header, Opcode,
};
pub use handshake::{
    accept_key, check_upgrade_response, client_key, upgrade_request, upgrade_response,
};

use crate::errors::{Error, Result};

/// Default per-frame payload ceiling (64 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Messages surfaced to the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(CloseReason),
}

/// Frame-level session state for one connection.
pub struct Session {
    codec: MessageCodec,
    buffer: Vec<u8>,
    fragment: Option<(Opcode, Vec<u8>, bool, bool)>,
    peer_closed: bool,
    max_payload: usize,
}

impl Session {
    pub fn new(codec: MessageCodec) -> Self {
        Self {
            codec,
            buffer: Vec::new(),
            fragment: None,
            peer_closed: false,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Creates a session with no negotiated extensions.
    pub fn plain(role: Role) -> Self {
        let config = ExtensionsConfig::default();
        let codec = MessageCodec::new(role, &config, Negotiated::default())
            .expect("plain codec has no failing configuration");
        Self::new(codec)
    }

    pub fn max_payload(&mut self, limit: usize) {
        self.max_payload = limit;
    }

    fn masked(&self) -> bool {
        // Clients mask every outgoing frame; servers never do.
        self.codec.role() == Role::Client
    }

    /// Builds a TEXT frame from `text`.
    pub fn text(&mut self, text: &str) -> Result<Vec<u8>> {
        self.data_frame(Opcode::Text, text.as_bytes())
    }

    /// Builds a BINARY frame from `data`.
    pub fn binary(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.data_frame(Opcode::Binary, data)
    }

    fn data_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>> {
        let (payload, rsv1, rsv2) = self.codec.encode_message(payload)?;
        let header = Header {
            fin: true,
            rsv1,
            rsv2,
            rsv3: false,
            opcode,
            masked: self.masked(),
        };
        Ok(encode(&header, &payload))
    }

    /// Builds a PING frame.
    pub fn ping(&self, payload: &[u8]) -> Vec<u8> {
        encode(&Header::data(Opcode::Ping, self.masked()), payload)
    }

    /// Builds a PONG frame.
    pub fn pong(&self, payload: &[u8]) -> Vec<u8> {
        encode(&Header::data(Opcode::Pong, self.masked()), payload)
    }

    /// Builds a CLOSE frame.
    pub fn close(&self, code: u16, reason: &str) -> Vec<u8> {
        encode(
            &Header::data(Opcode::Close, self.masked()),
            &encode_close(code, reason),
        )
    }

    /// Feeds incoming bytes; returns completed messages.
    ///
    /// Frames that arrive after the peer's CLOSE are dropped silently.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();
        loop {
            let parsed = decode(&self.buffer, self.max_payload)?;
            let Some((frame, used)) = parsed else { break };
            self.buffer.drain(..used);
            if self.peer_closed {
                continue;
            }
            if let Some(message) = self.on_frame(frame)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    fn on_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        let header = frame.header;
        match header.opcode {
            Opcode::Ping => Ok(Some(Message::Ping(frame.payload))),
            Opcode::Pong => Ok(Some(Message::Pong(frame.payload))),
            Opcode::Close => {
                self.peer_closed = true;
                Ok(Some(Message::Close(parse_close(&frame.payload))))
            }
            Opcode::Text | Opcode::Binary => {
                if self.fragment.is_some() {
                    return Err(Error::protocol("data frame interleaved with fragments"));
                }
                if header.fin {
                    let payload =
                        self.codec
                            .decode_message(&frame.payload, header.rsv1, header.rsv2)?;
                    Ok(Some(self.finish_message(header.opcode, payload)?))
                } else {
                    self.fragment =
                        Some((header.opcode, frame.payload, header.rsv1, header.rsv2));
                    Ok(None)
                }
            }
            Opcode::Continuation => {
                let Some((opcode, mut partial, rsv1, rsv2)) = self.fragment.take() else {
                    return Err(Error::protocol("continuation without a first fragment"));
                };
                partial.extend_from_slice(&frame.payload);
                if partial.len() > self.max_payload {
                    return Err(Error::limit("fragmented message above limit"));
                }
                if header.fin {
                    let payload = self.codec.decode_message(&partial, rsv1, rsv2)?;
                    Ok(Some(self.finish_message(opcode, payload)?))
                } else {
                    self.fragment = Some((opcode, partial, rsv1, rsv2));
                    Ok(None)
                }
            }
        }
    }

    fn finish_message(&mut self, opcode: Opcode, payload: Vec<u8>) -> Result<Message> {
        match opcode {
            Opcode::Text => {
                let text = String::from_utf8(payload)
                    .map_err(|_| Error::protocol("text message is not utf-8"))?;
                Ok(Message::Text(text))
            }
            _ => Ok(Message::Binary(payload)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Method;

    fn negotiated_pair(config: &ExtensionsConfig) -> (Session, Session) {
        let offer_header = offer(config);
        let (negotiated, _answer) = accept(config, offer_header.as_deref().unwrap_or(""));
        let client = Session::new(
            MessageCodec::new(Role::Client, config, negotiated.clone()).unwrap(),
        );
        let server = Session::new(MessageCodec::new(Role::Server, config, negotiated).unwrap());
        (client, server)
    }

    #[test]
    fn text_echo_between_client_and_server() {
        let mut client = Session::plain(Role::Client);
        let mut server = Session::plain(Role::Server);

        let wire = client.text("hi").unwrap();
        // Client frames are masked on the wire.
        assert_eq!(wire[1] & 0x80, 0x80);
        let received = server.feed(&wire).unwrap();
        assert_eq!(received, vec![Message::Text("hi".into())]);

        let back = server.text("hi").unwrap();
        assert_eq!(back[1] & 0x80, 0);
        let echoed = client.feed(&back).unwrap();
        assert_eq!(echoed, vec![Message::Text("hi".into())]);
    }

    #[test]
    fn frames_after_close_are_ignored() {
        let mut client = Session::plain(Role::Client);
        let mut server = Session::plain(Role::Server);

        let close = client.close(1001, "bye");
        let text = client.text("late").unwrap();
        let mut wire = close;
        wire.extend(text);

        let messages = server.feed(&wire).unwrap();
        assert_eq!(
            messages,
            vec![Message::Close(CloseReason {
                code: 1001,
                reason: "bye".into()
            })]
        );
    }

    #[test]
    fn fragmented_messages_reassemble() {
        let mut server = Session::plain(Role::Server);
        let first = encode(
            &Header {
                fin: false,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode: Opcode::Text,
                masked: true,
            },
            b"hel",
        );
        let last = encode(
            &Header {
                fin: true,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode: Opcode::Continuation,
                masked: true,
            },
            b"lo",
        );
        assert!(server.feed(&first).unwrap().is_empty());
        assert_eq!(
            server.feed(&last).unwrap(),
            vec![Message::Text("hello".into())]
        );
    }

    #[test]
    fn compressed_messages_round_trip_with_takeover() {
        let config = ExtensionsConfig {
            compression: Some(Method::Deflate),
            ..Default::default()
        };
        let (mut client, mut server) = negotiated_pair(&config);
        for _ in 0..3 {
            let text = "repetitive payload repetitive payload repetitive payload";
            let wire = client.text(text).unwrap();
            let got = server.feed(&wire).unwrap();
            assert_eq!(got, vec![Message::Text(text.into())]);
        }
    }

    #[test]
    fn split_delivery_is_reassembled() {
        let mut client = Session::plain(Role::Client);
        let mut server = Session::plain(Role::Server);
        let wire = client.text("chunked arrival").unwrap();
        let (a, b) = wire.split_at(wire.len() / 2);
        assert!(server.feed(a).unwrap().is_empty());
        assert_eq!(
            server.feed(b).unwrap(),
            vec![Message::Text("chunked arrival".into())]
        );
    }
}
