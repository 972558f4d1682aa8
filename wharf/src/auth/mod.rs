//! HTTP authentication: Basic and Digest.
//!
//! The server side validates credentials through embedder-supplied callbacks
//! (a user/password check for Basic, a password lookup for Digest) and never
//! stores plaintext credential tables of its own. The client side produces
//! `Authorization` header values, auto-incrementing the Digest `nc` counter.

mod digest;

pub use digest::{Algorithm, Challenge, DigestClient, DigestServer};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::errors::{Error, Result};

/// Authentication flavor attached to a scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Kind {
    #[default]
    None,
    Basic,
    Digest,
}

/// Builds a `Authorization: Basic ...` header value.
pub fn basic_header(username: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
}

/// Decodes a Basic credential pair from an `Authorization` header value.
pub fn basic_credentials(header: &str) -> Result<(String, String)> {
    let encoded = header
        .trim()
        .strip_prefix("Basic ")
        .or_else(|| header.trim().strip_prefix("basic "))
        .ok_or_else(|| Error::auth("not a Basic authorization header"))?;
    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::auth(format!("invalid base64 credentials: {e}")))?;
    let decoded =
        String::from_utf8(decoded).map_err(|_| Error::auth("credentials are not utf-8"))?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or_else(|| Error::auth("missing ':' separator in credentials"))?;
    Ok((user.to_string(), pass.to_string()))
}

/// Server-side Basic validation through a user-supplied check.
pub fn basic_check<F>(header: &str, validate: F) -> Result<String>
where
    F: Fn(&str, &str) -> bool,
{
    let (user, pass) = basic_credentials(header)?;
    if validate(&user, &pass) {
        Ok(user)
    } else {
        Err(Error::auth(format!("credentials rejected for {user}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_round_trip() {
        let header = basic_header("aladdin", "open sesame");
        assert_eq!(header, "Basic YWxhZGRpbjpvcGVuIHNlc2FtZQ==");
        let (user, pass) = basic_credentials(&header).unwrap();
        assert_eq!(user, "aladdin");
        assert_eq!(pass, "open sesame");
    }

    #[test]
    fn basic_check_invokes_validator() {
        let header = basic_header("u", "p");
        assert!(basic_check(&header, |u, p| u == "u" && p == "p").is_ok());
        assert!(basic_check(&header, |_, _| false).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(basic_credentials("Bearer abc").is_err());
        assert!(basic_credentials("Basic ???").is_err());
    }
}
