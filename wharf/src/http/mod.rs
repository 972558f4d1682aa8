//! HTTP/1.1 codec core and the HTTP/2 session adapter.
//!
//! The HTTP/1 side is a hand-rolled incremental parser plus a serializer for
//! requests and responses (start line, headers, sized or chunked bodies).
//! Header names are normalized to lower-case on the way in; values are
//! trimmed. The HTTP/2 side lives in [`h2`] and bridges the `h2` session
//! library to broker byte streams.

pub mod h2;
mod parser;

pub use parser::{Event, Kind, Parser};

use crate::errors::{Error, Result};

/// Header block with lower-cased names, preserving insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .push((name.as_ref().to_ascii_lowercase(), value.into()));
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.0
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        let name = name.to_ascii_lowercase();
        self.0
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.0.retain(|(n, _)| *n != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// HTTP/1 protocol versions handled by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn token(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim() {
            "HTTP/1.0" => Some(Self::Http10),
            "HTTP/1.1" => Some(Self::Http11),
            _ => None,
        }
    }
}

/// An HTTP/1 request.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            ..Default::default()
        }
    }
}

/// An HTTP/1 response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            version: Version::Http11,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }
}

fn write_headers(out: &mut Vec<u8>, headers: &Headers, body_len: usize, chunked: bool) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if chunked {
        if headers.get("transfer-encoding").is_none() {
            out.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
    } else if body_len > 0 && headers.get("content-length").is_none() {
        out.extend_from_slice(format!("content-length: {body_len}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
}

/// Serializes a request with a sized body.
pub fn request_bytes(request: &Request) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + request.body.len());
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            request.method,
            request.target,
            request.version.token()
        )
        .as_bytes(),
    );
    write_headers(&mut out, &request.headers, request.body.len(), false);
    out.extend_from_slice(&request.body);
    out
}

/// Serializes a response with a sized body.
pub fn response_bytes(response: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + response.body.len());
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            response.version.token(),
            response.status,
            response.reason
        )
        .as_bytes(),
    );
    write_headers(&mut out, &response.headers, response.body.len(), false);
    out.extend_from_slice(&response.body);
    out
}

/// Encodes one chunk of a chunked transfer; an empty slice terminates.
pub fn chunk_bytes(chunk: &[u8]) -> Vec<u8> {
    if chunk.is_empty() {
        return b"0\r\n\r\n".to_vec();
    }
    let mut out = Vec::with_capacity(chunk.len() + 16);
    out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
    out.extend_from_slice(chunk);
    out.extend_from_slice(b"\r\n");
    out
}

/// Parses a status line such as `HTTP/1.1 200 OK`.
pub(crate) fn parse_status_line(line: &str) -> Result<(Version, u16, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .and_then(Version::from_token)
        .ok_or_else(|| Error::protocol(format!("malformed status line: {line}")))?;
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::protocol(format!("malformed status code: {line}")))?;
    let reason = parts.next().unwrap_or("").trim().to_string();
    Ok((version, status, reason))
}

/// Parses a request line such as `GET /path HTTP/1.1`.
pub(crate) fn parse_request_line(line: &str) -> Result<(String, String, Version)> {
    let mut parts = line.split(' ').filter(|p| !p.is_empty());
    let method = parts
        .next()
        .filter(|m| m.chars().all(|c| c.is_ascii_uppercase() || c == '-'))
        .ok_or_else(|| Error::protocol(format!("malformed request line: {line}")))?;
    let target = parts
        .next()
        .ok_or_else(|| Error::protocol(format!("malformed request line: {line}")))?;
    let version = parts
        .next()
        .and_then(Version::from_token)
        .ok_or_else(|| Error::protocol(format!("malformed request line: {line}")))?;
    if parts.next().is_some() {
        return Err(Error::protocol(format!("malformed request line: {line}")));
    }
    Ok((method.to_string(), target.to_string(), version))
}
