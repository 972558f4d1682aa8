//! HTTP Upgrade handshake for WebSocket.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha1::{Digest as _, Sha1};

use crate::errors::{Error, Result};
use crate::http::{Request, Response};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Generates a random `Sec-WebSocket-Key` value.
pub fn client_key() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill_bytes(&mut raw);
    BASE64.encode(raw)
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let digest = Sha1::digest(format!("{key}{GUID}").as_bytes());
    BASE64.encode(digest)
}

/// Builds the client Upgrade request.
pub fn upgrade_request(
    host: &str,
    path: &str,
    key: &str,
    extensions: Option<&str>,
    protocols: &[&str],
) -> Request {
    let mut request = Request::new("GET", path);
    request.headers.insert("Host", host);
    request.headers.insert("Upgrade", "websocket");
    request.headers.insert("Connection", "Upgrade");
    request.headers.insert("Sec-WebSocket-Key", key);
    request.headers.insert("Sec-WebSocket-Version", "13");
    if let Some(offer) = extensions {
        request.headers.insert("Sec-WebSocket-Extensions", offer);
    }
    if !protocols.is_empty() {
        request
            .headers
            .insert("Sec-WebSocket-Protocol", protocols.join(", "));
    }
    request
}

/// Validates a client Upgrade request and builds the `101` response.
///
/// The negotiated extensions header (if any) is the caller's to add, since
/// the extension choice depends on the scheme configuration.
pub fn upgrade_response(request: &Request, extensions: Option<&str>) -> Result<Response> {
    if !request.method.eq_ignore_ascii_case("GET") {
        return Err(Error::protocol("upgrade must be a GET"));
    }
    let upgrade_ok = request
        .headers
        .get("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_ok = request
        .headers
        .get("connection")
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    if !upgrade_ok || !connection_ok {
        return Err(Error::protocol("missing upgrade/connection headers"));
    }
    if request.headers.get("sec-websocket-version") != Some("13") {
        return Err(Error::protocol("unsupported websocket version"));
    }
    let key = request
        .headers
        .get("sec-websocket-key")
        .ok_or_else(|| Error::protocol("missing Sec-WebSocket-Key"))?;

    let mut response = Response::new(101, "Switching Protocols");
    response.headers.insert("Upgrade", "websocket");
    response.headers.insert("Connection", "Upgrade");
    response
        .headers
        .insert("Sec-WebSocket-Accept", accept_key(key));
    if let Some(negotiated) = extensions {
        response
            .headers
            .insert("Sec-WebSocket-Extensions", negotiated);
    }
    Ok(response)
}

/// Validates the server's `101` answer against the key the client sent.
pub fn check_upgrade_response(response: &Response, key: &str) -> Result<()> {
    if response.status != 101 {
        return Err(Error::protocol(format!(
            "upgrade refused with status {}",
            response.status
        )));
    }
    let accept = response
        .headers
        .get("sec-websocket-accept")
        .ok_or_else(|| Error::protocol("missing Sec-WebSocket-Accept"))?;
    if accept != accept_key(key) {
        return Err(Error::protocol("Sec-WebSocket-Accept mismatch"));
    }
    Ok(())
}
