//! Digest authentication per RFC 2617/7616.
//!
//! The client parses a `WWW-Authenticate: Digest ...` challenge, computes the
//! response hash with the negotiated algorithm and keeps a strictly
//! increasing `nc` counter. The server issues challenges and validates
//! responses against a password lookup, rejecting replayed `nc` values.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use md5::Md5;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest as _, Sha256, Sha512};

use crate::errors::{Error, Result};

/// Hash algorithm negotiated for the Digest exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn token(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA-256",
            Self::Sha512 => "SHA-512",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "SHA1" | "SHA-1" => Some(Self::Sha1),
            "SHA-256" | "SHA256" => Some(Self::Sha256),
            "SHA-512" | "SHA512" => Some(Self::Sha512),
            _ => None,
        }
    }

    fn hex(self, input: &str) -> String {
        match self {
            Self::Md5 => hex::encode(Md5::digest(input.as_bytes())),
            Self::Sha1 => hex::encode(Sha1::digest(input.as_bytes())),
            Self::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
            Self::Sha512 => hex::encode(Sha512::digest(input.as_bytes())),
        }
    }
}

/// Parsed server challenge parameters.
#[derive(Debug, Clone, Default)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: String,
    pub qop: String,
    pub algorithm: Algorithm,
}

/// Splits a comma-separated `k=v` parameter list, honoring quoted values.
pub fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();
        let value;
        if let Some(tail) = rest.strip_prefix('"') {
            let Some(end) = tail.find('"') else { break };
            value = tail[..end].to_string();
            rest = tail[end + 1..].trim_start().trim_start_matches(',').trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest[end..].trim_start_matches(',').trim_start();
        }
        if !key.is_empty() {
            params.insert(key, value);
        }
    }
    params
}

fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn compute_response(
    algorithm: Algorithm,
    username: &str,
    password: &str,
    realm: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: &str,
) -> String {
    let ha1 = algorithm.hex(&format!("{username}:{realm}:{password}"));
    let ha2 = algorithm.hex(&format!("{method}:{uri}"));
    if qop.is_empty() {
        algorithm.hex(&format!("{ha1}:{nonce}:{ha2}"))
    } else {
        algorithm.hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}"))
    }
}

/// Client-side Digest state for one server.
pub struct DigestClient {
    username: String,
    password: String,
    challenge: Challenge,
    nc: u32,
}

impl DigestClient {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            challenge: Challenge::default(),
            nc: 0,
        }
    }

    /// Absorbs a `WWW-Authenticate` header value; resets `nc` on a new nonce.
    pub fn challenge(&mut self, header: &str) -> Result<()> {
        let tail = header
            .trim()
            .strip_prefix("Digest ")
            .ok_or_else(|| Error::auth("not a Digest challenge"))?;
        let params = parse_params(tail);
        let nonce = params
            .get("nonce")
            .cloned()
            .ok_or_else(|| Error::auth("challenge without nonce"))?;
        if nonce != self.challenge.nonce {
            self.nc = 0;
        }
        self.challenge = Challenge {
            realm: params.get("realm").cloned().unwrap_or_default(),
            nonce,
            opaque: params.get("opaque").cloned().unwrap_or_default(),
            qop: params
                .get("qop")
                .map(|q| q.split(',').next().unwrap_or("").trim().to_string())
                .unwrap_or_default(),
            algorithm: params
                .get("algorithm")
                .and_then(|a| Algorithm::from_token(a))
                .unwrap_or_default(),
        };
        Ok(())
    }

    /// Current `nc` counter (the value the next request will NOT reuse).
    pub fn nc(&self) -> u32 {
        self.nc
    }

    /// Builds an `Authorization` header value for the request, incrementing `nc`.
    pub fn header(&mut self, method: &str, uri: &str) -> Result<String> {
        if self.challenge.nonce.is_empty() {
            return Err(Error::auth("no challenge received yet"));
        }
        self.nc += 1;
        let nc = format!("{:08x}", self.nc);
        let cnonce = random_token();
        let response = compute_response(
            self.challenge.algorithm,
            &self.username,
            &self.password,
            &self.challenge.realm,
            method,
            uri,
            &self.challenge.nonce,
            &nc,
            &cnonce,
            &self.challenge.qop,
        );
        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
            self.username,
            self.challenge.realm,
            self.challenge.nonce,
            uri,
            response,
            self.challenge.algorithm.token(),
        );
        if !self.challenge.qop.is_empty() {
            header.push_str(&format!(
                ", qop={}, nc={}, cnonce=\"{}\"",
                self.challenge.qop, nc, cnonce
            ));
        }
        if !self.challenge.opaque.is_empty() {
            header.push_str(&format!(", opaque=\"{}\"", self.challenge.opaque));
        }
        Ok(header)
    }
}

struct NonceState {
    last_nc: u32,
    created: u64,
}

/// Server-side Digest state: issued nonces and their replay counters.
pub struct DigestServer {
    realm: String,
    algorithm: Algorithm,
    nonces: HashMap<String, NonceState>,
}

impl DigestServer {
    pub fn new(realm: impl Into<String>, algorithm: Algorithm) -> Self {
        Self {
            realm: realm.into(),
            algorithm,
            nonces: HashMap::new(),
        }
    }

    /// Issues a fresh challenge header value and registers its nonce.
    pub fn challenge(&mut self) -> String {
        let nonce = random_token();
        let opaque = random_token();
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.nonces.insert(
            nonce.clone(),
            NonceState {
                last_nc: 0,
                created,
            },
        );
        format!(
            "Digest realm=\"{}\", qop=\"auth\", nonce=\"{}\", opaque=\"{}\", algorithm={}",
            self.realm,
            nonce,
            opaque,
            self.algorithm.token(),
        )
    }

    /// Validates an `Authorization` header value against a password lookup.
    ///
    /// Replays are rejected: the `nc` value must be strictly greater than the
    /// last accepted one for the same nonce.
    pub fn verify<F>(&mut self, header: &str, method: &str, lookup: F) -> Result<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let tail = header
            .trim()
            .strip_prefix("Digest ")
            .ok_or_else(|| Error::auth("not a Digest authorization"))?;
        let params = parse_params(tail);
        let get = |key: &str| -> Result<&str> {
            params
                .get(key)
                .map(String::as_str)
                .ok_or_else(|| Error::auth(format!("missing digest parameter {key}")))
        };
        let username = get("username")?;
        let nonce = get("nonce")?;
        let uri = get("uri")?;
        let response = get("response")?;
        let qop = params.get("qop").map(String::as_str).unwrap_or("");
        let nc = params.get("nc").map(String::as_str).unwrap_or("");
        let cnonce = params.get("cnonce").map(String::as_str).unwrap_or("");

        let state = self
            .nonces
            .get_mut(nonce)
            .ok_or_else(|| Error::auth("unknown or expired nonce"))?;

        let nc_value = if qop.is_empty() {
            0
        } else {
            u32::from_str_radix(nc, 16).map_err(|_| Error::auth("malformed nc counter"))?
        };
        if !qop.is_empty() && nc_value <= state.last_nc {
            return Err(Error::auth(format!(
                "replayed nc {nc} (last accepted {:08x})",
                state.last_nc
            )));
        }

        let password =
            lookup(username).ok_or_else(|| Error::auth(format!("unknown user {username}")))?;
        let algorithm = params
            .get("algorithm")
            .and_then(|a| Algorithm::from_token(a))
            .unwrap_or(self.algorithm);
        let expected = compute_response(
            algorithm,
            username,
            &password,
            &self.realm,
            method,
            uri,
            nonce,
            nc,
            cnonce,
            qop,
        );
        if expected != response {
            return Err(Error::auth(format!("bad digest response for {username}")));
        }
        state.last_nc = nc_value;
        Ok(username.to_string())
    }

    /// Drops nonces older than `max_age_s`.
    pub fn expire(&mut self, max_age_s: u64) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.nonces
            .retain(|_, state| now.saturating_sub(state.created) <= max_age_s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(user: &str) -> Option<String> {
        (user == "mufasa").then(|| "circle of life".to_string())
    }

    #[test]
    fn parse_params_handles_quoting() {
        let params = parse_params(
            "realm=\"testrealm@host.com\", qop=\"auth,auth-int\", nonce=\"abc,def\", algorithm=MD5",
        );
        assert_eq!(params["realm"], "testrealm@host.com");
        assert_eq!(params["nonce"], "abc,def");
        assert_eq!(params["algorithm"], "MD5");
    }

    #[test]
    fn full_exchange_per_algorithm() {
        for algorithm in [
            Algorithm::Md5,
            Algorithm::Sha1,
            Algorithm::Sha256,
            Algorithm::Sha512,
        ] {
            let mut server = DigestServer::new("wharf", algorithm);
            let challenge = server.challenge();

            let mut client = DigestClient::new("mufasa", "circle of life");
            client.challenge(&challenge).unwrap();
            let auth = client.header("GET", "/dir/index.html").unwrap();
            assert!(server.verify(&auth, "GET", lookup).is_ok(), "{algorithm:?}");
        }
    }

    #[test]
    fn nc_is_strictly_increasing() {
        let mut client = DigestClient::new("mufasa", "circle of life");
        let mut server = DigestServer::new("wharf", Algorithm::Md5);
        client.challenge(&server.challenge()).unwrap();
        let mut last = 0;
        for _ in 0..3 {
            client.header("GET", "/").unwrap();
            assert!(client.nc() > last);
            last = client.nc();
        }
    }

    #[test]
    fn replayed_nc_is_rejected() {
        let mut server = DigestServer::new("wharf", Algorithm::Md5);
        let mut client = DigestClient::new("mufasa", "circle of life");
        client.challenge(&server.challenge()).unwrap();

        let first = client.header("GET", "/res").unwrap();
        assert!(server.verify(&first, "GET", lookup).is_ok());
        // Same header again: same nc, same response, must be refused.
        assert!(server.verify(&first, "GET", lookup).is_err());
        // A fresh request with nc=2 passes.
        let second = client.header("GET", "/res").unwrap();
        assert!(server.verify(&second, "GET", lookup).is_ok());
    }

    #[test]
    fn wrong_password_is_rejected() {
        let mut server = DigestServer::new("wharf", Algorithm::Sha256);
        let mut client = DigestClient::new("mufasa", "hakuna matata");
        client.challenge(&server.challenge()).unwrap();
        let auth = client.header("GET", "/").unwrap();
        assert!(server.verify(&auth, "GET", lookup).is_err());
    }
}
