//! `Sec-WebSocket-Extensions` negotiation and per-message transforms.
//!
//! Compression is negotiated as `permessage-deflate`, `permessage-gzip` or
//! `permessage-br` with the usual takeover/window parameters. The
//! non-standard `permessage-encrypt=<bits>` adds AES-CBC on top; it is never
//! offered or accepted unless the embedder configured a passphrase. On the
//! wire rsv1 marks a compressed message and rsv2 an encrypted one.

use crate::errors::{Error, Result};
use crate::hash::{Cipher, Compressor, KeySize, Level, Method, SYNC_TAIL};

/// Extension parameters offered (client) or permitted (server).
#[derive(Debug, Clone, Default)]
pub struct ExtensionsConfig {
    /// Compression method to offer/accept; `None` disables PMCE.
    pub compression: Option<Method>,
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: Option<u8>,
    pub server_max_window_bits: Option<u8>,
    /// Passphrase, salt and key width for `permessage-encrypt`.
    pub encryption: Option<EncryptionConfig>,
    /// Compression effort for outgoing messages.
    pub level: Level,
}

#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    pub pass: String,
    pub salt: Vec<u8>,
    pub key_size: KeySize,
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiated {
    pub compression: Option<Method>,
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub encryption: Option<KeySize>,
}

fn method_token(method: Method) -> Option<&'static str> {
    match method {
        Method::Deflate => Some("permessage-deflate"),
        Method::Gzip => Some("permessage-gzip"),
        Method::Brotli => Some("permessage-br"),
        _ => None,
    }
}

fn token_method(token: &str) -> Option<Method> {
    match token {
        "permessage-deflate" => Some(Method::Deflate),
        "permessage-gzip" => Some(Method::Gzip),
        "permessage-br" => Some(Method::Brotli),
        _ => None,
    }
}

/// Formats the client offer for `Sec-WebSocket-Extensions`.
pub fn offer(config: &ExtensionsConfig) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(method) = config.compression {
        let token = method_token(method)?;
        let mut item = token.to_string();
        if config.client_no_context_takeover {
            item.push_str("; client_no_context_takeover");
        }
        if config.server_no_context_takeover {
            item.push_str("; server_no_context_takeover");
        }
        if let Some(bits) = config.client_max_window_bits {
            item.push_str(&format!("; client_max_window_bits={bits}"));
        }
        if let Some(bits) = config.server_max_window_bits {
            item.push_str(&format!("; server_max_window_bits={bits}"));
        }
        parts.push(item);
    }
    if let Some(enc) = &config.encryption {
        parts.push(format!("permessage-encrypt={}", enc.key_size.bits()));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

struct OfferItem {
    name: String,
    /// Value attached to the extension token itself (`permessage-encrypt=256`).
    value: Option<String>,
    params: Vec<(String, Option<String>)>,
}

fn parse_offer_items(header: &str) -> Vec<OfferItem> {
    header
        .split(',')
        .filter_map(|item| {
            let mut pieces = item.split(';');
            let head = pieces.next()?.trim();
            if head.is_empty() {
                return None;
            }
            let (name, value) = match head.split_once('=') {
                Some((n, v)) => (
                    n.trim().to_ascii_lowercase(),
                    Some(v.trim().trim_matches('"').to_string()),
                ),
                None => (head.to_ascii_lowercase(), None),
            };
            let params = pieces
                .filter_map(|p| {
                    let p = p.trim();
                    if p.is_empty() {
                        return None;
                    }
                    match p.split_once('=') {
                        Some((k, v)) => Some((
                            k.trim().to_ascii_lowercase(),
                            Some(v.trim().trim_matches('"').to_string()),
                        )),
                        None => Some((p.to_ascii_lowercase(), None)),
                    }
                })
                .collect();
            Some(OfferItem { name, value, params })
        })
        .collect()
}

/// Server side: picks from the client offer what the local config permits
/// and returns the negotiated state plus the response header value.
pub fn accept(config: &ExtensionsConfig, header: &str) -> (Negotiated, Option<String>) {
    let mut negotiated = Negotiated::default();
    let mut response = Vec::new();
    for item in parse_offer_items(header) {
        if let Some(method) = token_method(&item.name) {
            if negotiated.compression.is_some() || config.compression != Some(method) {
                continue;
            }
            negotiated.compression = Some(method);
            let mut answer = item.name.clone();
            for (key, _value) in &item.params {
                match key.as_str() {
                    "client_no_context_takeover" => negotiated.client_no_context_takeover = true,
                    "server_no_context_takeover" => negotiated.server_no_context_takeover = true,
                    // Window hints are acknowledged but not renegotiated.
                    "client_max_window_bits" | "server_max_window_bits" => {}
                    _ => {}
                }
            }
            if config.client_no_context_takeover {
                negotiated.client_no_context_takeover = true;
            }
            if config.server_no_context_takeover {
                negotiated.server_no_context_takeover = true;
            }
            if negotiated.client_no_context_takeover {
                answer.push_str("; client_no_context_takeover");
            }
            if negotiated.server_no_context_takeover {
                answer.push_str("; server_no_context_takeover");
            }
            response.push(answer);
        } else if item.name == "permessage-encrypt" {
            let Some(enc) = &config.encryption else {
                // Encryption was not configured locally; refuse silently.
                continue;
            };
            let offered = item.value.as_deref().and_then(|v| v.parse::<u16>().ok());
            if let Some(size) = offered.and_then(KeySize::from_bits) {
                if size == enc.key_size {
                    negotiated.encryption = Some(size);
                    response.push(format!("permessage-encrypt={}", size.bits()));
                }
            }
        }
    }
    let header = if response.is_empty() {
        None
    } else {
        Some(response.join(", "))
    };
    (negotiated, header)
}

/// Client side: validates the server response against what was offered.
pub fn finish(config: &ExtensionsConfig, header: &str) -> Result<Negotiated> {
    let mut negotiated = Negotiated::default();
    for item in parse_offer_items(header) {
        if let Some(method) = token_method(&item.name) {
            if config.compression != Some(method) {
                return Err(Error::protocol(format!(
                    "server selected unoffered extension {}",
                    item.name
                )));
            }
            negotiated.compression = Some(method);
            for (key, _) in &item.params {
                match key.as_str() {
                    "client_no_context_takeover" => negotiated.client_no_context_takeover = true,
                    "server_no_context_takeover" => negotiated.server_no_context_takeover = true,
                    _ => {}
                }
            }
        } else if item.name == "permessage-encrypt" {
            let Some(enc) = &config.encryption else {
                return Err(Error::protocol("server enabled unoffered encryption"));
            };
            let bits = item.value.as_deref().and_then(|v| v.parse::<u16>().ok());
            match bits.and_then(KeySize::from_bits) {
                Some(size) if size == enc.key_size => negotiated.encryption = Some(size),
                _ => return Err(Error::protocol("server answered with a foreign key width")),
            }
        }
    }
    Ok(negotiated)
}

/// Message direction relative to this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Applies the negotiated transforms to whole messages.
pub struct MessageCodec {
    role: Role,
    negotiated: Negotiated,
    compressor: Compressor,
    cipher: Option<Cipher>,
}

impl MessageCodec {
    pub fn new(
        role: Role,
        config: &ExtensionsConfig,
        negotiated: Negotiated,
    ) -> Result<Self> {
        let mut compressor = Compressor::new(config.level);
        // Takeover applies per direction: this endpoint's outgoing context is
        // the client context on a client and the server context on a server.
        let (out_no_takeover, in_no_takeover) = match role {
            Role::Client => (
                negotiated.client_no_context_takeover,
                negotiated.server_no_context_takeover,
            ),
            Role::Server => (
                negotiated.server_no_context_takeover,
                negotiated.client_no_context_takeover,
            ),
        };
        compressor.takeover_compress(!out_no_takeover);
        compressor.takeover_decompress(!in_no_takeover);
        let cipher = match (&negotiated.encryption, &config.encryption) {
            (Some(size), Some(enc)) => {
                Some(Cipher::new(&enc.pass, &enc.salt, 5, *size)?)
            }
            (Some(_), None) => {
                return Err(Error::protocol("encryption negotiated without a passphrase"))
            }
            _ => None,
        };
        Ok(Self {
            role,
            negotiated,
            compressor,
            cipher,
        })
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Transforms an outgoing message; returns the payload plus rsv1/rsv2.
    pub fn encode_message(&mut self, payload: &[u8]) -> Result<(Vec<u8>, bool, bool)> {
        let mut rsv1 = false;
        let mut data = payload.to_vec();
        if let Some(method) = self.negotiated.compression {
            data = match method {
                Method::Deflate => {
                    let mut block = self.compressor.deflate_stream(&data)?;
                    // The sync tail is implicit at message boundaries.
                    if block.ends_with(&SYNC_TAIL) {
                        block.truncate(block.len() - SYNC_TAIL.len());
                    }
                    block
                }
                other => self.compressor.compress(&data, other)?,
            };
            rsv1 = true;
        }
        let mut rsv2 = false;
        if let Some(cipher) = &self.cipher {
            data = cipher.encrypt(&data);
            rsv2 = true;
        }
        Ok((data, rsv1, rsv2))
    }

    /// Reverses [`MessageCodec::encode_message`] based on the rsv bits.
    pub fn decode_message(&mut self, payload: &[u8], rsv1: bool, rsv2: bool) -> Result<Vec<u8>> {
        let mut data = payload.to_vec();
        if rsv2 {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or_else(|| Error::protocol("encrypted message without negotiation"))?;
            data = cipher.decrypt(&data)?;
        }
        if rsv1 {
            let method = self
                .negotiated
                .compression
                .ok_or_else(|| Error::protocol("compressed message without negotiation"))?;
            data = match method {
                Method::Deflate => {
                    data.extend_from_slice(&SYNC_TAIL);
                    self.compressor.inflate_stream(&data)?
                }
                other => self.compressor.decompress(&data, other)?,
            };
        }
        Ok(data)
    }
}
