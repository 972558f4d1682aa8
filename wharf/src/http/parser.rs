//! Incremental HTTP/1 message parser.
//!
//! The machine runs `Query → Headers → Body → End`, with the chunked body
//! sub-machine `Size → EndSize → Body → EndBody → StopBody`. Bodies carried
//! with a recognized `Content-Encoding` are buffered and handed to the chunk
//! event decompressed; everything else streams through raw.

use crate::errors::{Error, ErrorKind, Result};
use crate::hash::{Compressor, Method};
use crate::http::{parse_request_line, parse_status_line, Headers, Version};

/// Maximum accumulated size of the start line plus header block.
const MAX_HEADER_BLOCK: usize = 8 * 1024;

/// Whether the parser consumes requests or responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Query,
    Headers,
    Body,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    SizeExt,
    EndSize,
    Body,
    EndBody,
    StopBody,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Parser output events, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Request line: method, target, version.
    Request(String, String, Version),
    /// Status line: version, status, reason.
    Status(Version, u16, String),
    /// One normalized header.
    Header(String, String),
    /// The header block is complete.
    HeadersDone,
    /// A body chunk, decompressed when the encoding is recognized.
    Chunk(Vec<u8>),
    /// The message is complete.
    End,
}

/// Incremental HTTP/1 parser for one message at a time.
pub struct Parser {
    kind: Kind,
    state: State,
    chunk_state: ChunkState,
    headers: Headers,
    version: Version,
    status: u16,
    method: String,
    body_mode: BodyMode,
    encoding: Option<Method>,
    encoded: Vec<u8>,
    line: Vec<u8>,
    header_bytes: usize,
    chunk_remaining: u64,
    remaining: u64,
}

impl Parser {
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            state: State::Query,
            chunk_state: ChunkState::Size,
            headers: Headers::new(),
            version: Version::Http11,
            status: 0,
            method: String::new(),
            body_mode: BodyMode::None,
            encoding: None,
            encoded: Vec::new(),
            line: Vec::new(),
            header_bytes: 0,
            chunk_remaining: 0,
            remaining: 0,
        }
    }

    /// Resets the machine for the next message on a keep-alive connection.
    pub fn reset(&mut self) {
        *self = Self::new(self.kind);
    }

    pub fn is_done(&self) -> bool {
        self.state == State::End
    }

    /// Headers seen so far (complete once `Event::HeadersDone` was emitted).
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Keep-alive decision from version plus the `connection` header.
    pub fn keep_alive(&self) -> bool {
        let connection = self
            .headers
            .get("connection")
            .map(|v| v.to_ascii_lowercase());
        match self.version {
            Version::Http10 => connection.as_deref() == Some("keep-alive"),
            Version::Http11 => connection.as_deref() != Some("close"),
        }
    }

    /// Feeds bytes into the machine.
    ///
    /// Returns the number of bytes consumed (less than `data.len()` once the
    /// message ended, leaving pipelined bytes untouched) and the events
    /// produced. Errors carry `Protocol` for malformed bytes and `Limit` for
    /// an oversized header block.
    pub fn feed(&mut self, data: &[u8]) -> Result<(usize, Vec<Event>)> {
        let mut events = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() && self.state != State::End {
            match self.state {
                State::Query | State::Headers => {
                    let byte = data[pos];
                    pos += 1;
                    self.header_bytes += 1;
                    if self.header_bytes > MAX_HEADER_BLOCK {
                        return Err(Error::limit("header block above 8 KiB"));
                    }
                    if byte != b'\n' {
                        self.line.push(byte);
                        continue;
                    }
                    if self.line.last() == Some(&b'\r') {
                        self.line.pop();
                    }
                    let line = std::mem::take(&mut self.line);
                    let line = String::from_utf8(line)
                        .map_err(|_| Error::protocol("header bytes are not utf-8"))?;
                    if self.state == State::Query {
                        self.start_line(&line, &mut events)?;
                    } else {
                        self.header_line(&line, &mut events)?;
                    }
                }
                State::Body => {
                    let used = self.body_bytes(&data[pos..], &mut events)?;
                    pos += used;
                }
                State::End => {}
            }
        }
        Ok((pos, events))
    }

    /// Signals end of stream; finishes an until-close body.
    pub fn eof(&mut self) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        if self.state == State::Body && self.body_mode == BodyMode::UntilClose {
            self.finish_body(&mut events)?;
            self.state = State::End;
            events.push(Event::End);
        } else if self.state != State::End {
            return Err(Error::protocol("connection closed mid-message"));
        }
        Ok(events)
    }

    fn start_line(&mut self, line: &str, events: &mut Vec<Event>) -> Result<()> {
        if line.is_empty() {
            // Tolerate a stray CRLF before the start line.
            return Ok(());
        }
        match self.kind {
            Kind::Request => {
                let (method, target, version) = parse_request_line(line)?;
                self.method = method.clone();
                self.version = version;
                events.push(Event::Request(method, target, version));
            }
            Kind::Response => {
                let (version, status, reason) = parse_status_line(line)?;
                self.version = version;
                self.status = status;
                events.push(Event::Status(version, status, reason));
            }
        }
        self.state = State::Headers;
        Ok(())
    }

    fn header_line(&mut self, line: &str, events: &mut Vec<Event>) -> Result<()> {
        if !line.is_empty() {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::protocol(format!("malformed header: {line}")))?;
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            if name.is_empty() {
                return Err(Error::protocol("empty header name"));
            }
            self.headers.insert(&name, value.clone());
            events.push(Event::Header(name, value));
            return Ok(());
        }

        // Blank line: the header block is complete, pick the body mode.
        self.encoding = self
            .headers
            .get("content-encoding")
            .and_then(Method::from_token);
        let chunked = self
            .headers
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        self.body_mode = if chunked {
            BodyMode::Chunked
        } else if let Some(length) = self.headers.get("content-length") {
            let length = length
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::protocol("malformed content-length"))?;
            if length == 0 {
                BodyMode::None
            } else {
                self.remaining = length;
                BodyMode::Length(length)
            }
        } else if self.kind == Kind::Response && self.response_may_have_body() {
            BodyMode::UntilClose
        } else {
            BodyMode::None
        };

        events.push(Event::HeadersDone);
        if self.body_mode == BodyMode::None {
            self.state = State::End;
            events.push(Event::End);
        } else {
            self.state = State::Body;
            self.chunk_state = ChunkState::Size;
        }
        Ok(())
    }

    fn response_may_have_body(&self) -> bool {
        !(self.status < 200 || self.status == 204 || self.status == 304 || self.method == "HEAD")
    }

    fn body_bytes(&mut self, data: &[u8], events: &mut Vec<Event>) -> Result<usize> {
        match self.body_mode {
            BodyMode::Length(_) => {
                let take = (self.remaining as usize).min(data.len());
                self.emit_chunk(&data[..take], events)?;
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.finish_body(events)?;
                    self.state = State::End;
                    events.push(Event::End);
                }
                Ok(take)
            }
            BodyMode::UntilClose => {
                self.emit_chunk(data, events)?;
                Ok(data.len())
            }
            BodyMode::Chunked => self.chunked_bytes(data, events),
            BodyMode::None => Ok(0),
        }
    }

    fn chunked_bytes(&mut self, data: &[u8], events: &mut Vec<Event>) -> Result<usize> {
        let mut pos = 0usize;
        while pos < data.len() {
            let byte = data[pos];
            match self.chunk_state {
                ChunkState::Size => {
                    pos += 1;
                    match byte {
                        b'\r' => self.chunk_state = ChunkState::EndSize,
                        b';' | b' ' => self.chunk_state = ChunkState::SizeExt,
                        _ => {
                            let digit = (byte as char)
                                .to_digit(16)
                                .ok_or_else(|| Error::protocol("chunk size is not hex"))?;
                            self.chunk_remaining = self
                                .chunk_remaining
                                .checked_mul(16)
                                .and_then(|v| v.checked_add(digit as u64))
                                .ok_or_else(|| Error::limit("chunk size overflow"))?;
                        }
                    }
                }
                ChunkState::SizeExt => {
                    // Chunk extensions are skipped up to the CR.
                    pos += 1;
                    if byte == b'\r' {
                        self.chunk_state = ChunkState::EndSize;
                    }
                }
                ChunkState::EndSize => {
                    pos += 1;
                    if byte != b'\n' {
                        return Err(Error::protocol("chunk size line not terminated"));
                    }
                    if self.chunk_remaining == 0 {
                        self.chunk_state = ChunkState::Trailers;
                        self.line.clear();
                    } else {
                        self.chunk_state = ChunkState::Body;
                    }
                }
                ChunkState::Body => {
                    let take = (self.chunk_remaining as usize).min(data.len() - pos);
                    self.emit_chunk(&data[pos..pos + take], events)?;
                    self.chunk_remaining -= take as u64;
                    pos += take;
                    if self.chunk_remaining == 0 {
                        self.chunk_state = ChunkState::EndBody;
                    }
                }
                ChunkState::EndBody => {
                    pos += 1;
                    if byte != b'\r' {
                        return Err(Error::protocol("chunk body not terminated"));
                    }
                    self.chunk_state = ChunkState::StopBody;
                }
                ChunkState::StopBody => {
                    pos += 1;
                    if byte != b'\n' {
                        return Err(Error::protocol("chunk body not terminated"));
                    }
                    self.chunk_state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    // Trailer lines are read and ignored; a blank line ends the message.
                    pos += 1;
                    if byte != b'\n' {
                        self.line.push(byte);
                        continue;
                    }
                    if self.line.last() == Some(&b'\r') {
                        self.line.pop();
                    }
                    let empty = self.line.is_empty();
                    self.line.clear();
                    if empty {
                        self.finish_body(events)?;
                        self.state = State::End;
                        events.push(Event::End);
                        return Ok(pos);
                    }
                }
            }
        }
        Ok(pos)
    }

    fn emit_chunk(&mut self, data: &[u8], events: &mut Vec<Event>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.encoding.is_some() {
            self.encoded.extend_from_slice(data);
        } else {
            events.push(Event::Chunk(data.to_vec()));
        }
        Ok(())
    }

    fn finish_body(&mut self, events: &mut Vec<Event>) -> Result<()> {
        if let Some(method) = self.encoding {
            let encoded = std::mem::take(&mut self.encoded);
            match Compressor::default().decompress(&encoded, method) {
                Ok(plain) => events.push(Event::Chunk(plain)),
                Err(err) if err.kind() == ErrorKind::Protocol => {
                    // Unknown or corrupt encoding: hand the raw bytes through.
                    events.push(Event::Chunk(encoded));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(parser: &mut Parser, bytes: &[u8]) -> (usize, Vec<Event>) {
        parser.feed(bytes).unwrap()
    }

    #[test]
    fn parses_a_request_with_content_length() {
        let mut parser = Parser::new(Kind::Request);
        let wire = b"POST /api HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello";
        let (used, events) = collect(&mut parser, wire);
        assert_eq!(used, wire.len());
        assert!(matches!(
            &events[0],
            Event::Request(m, t, Version::Http11) if m == "POST" && t == "/api"
        ));
        assert!(events.contains(&Event::Header("host".into(), "example.com".into())));
        assert!(events.contains(&Event::Chunk(b"hello".to_vec())));
        assert_eq!(events.last(), Some(&Event::End));
        assert!(parser.is_done());
    }

    #[test]
    fn parses_chunked_transfer_across_feeds() {
        let mut parser = Parser::new(Kind::Response);
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let (_, events) = collect(&mut parser, head);
        assert_eq!(events.last(), Some(&Event::HeadersDone));

        let mut chunks = Vec::new();
        for part in [
            &b"4\r\nwi"[..],
            &b"ki\r\n5\r\npedia\r\n"[..],
            &b"0\r\n\r\n"[..],
        ] {
            let (used, events) = collect(&mut parser, part);
            assert_eq!(used, part.len());
            for event in events {
                if let Event::Chunk(data) = event {
                    chunks.extend(data);
                }
            }
        }
        assert_eq!(chunks, b"wikipedia");
        assert!(parser.is_done());
    }

    #[test]
    fn pipelined_bytes_are_left_unconsumed() {
        let mut parser = Parser::new(Kind::Request);
        let wire = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let (used, events) = collect(&mut parser, wire);
        assert_eq!(used, b"GET /a HTTP/1.1\r\n\r\n".len());
        assert_eq!(events.last(), Some(&Event::End));

        parser.reset();
        let (used2, events2) = collect(&mut parser, &wire[used..]);
        assert_eq!(used2, wire.len() - used);
        assert!(matches!(&events2[0], Event::Request(_, t, _) if t == "/b"));
    }

    #[test]
    fn malformed_start_line_is_a_protocol_error() {
        let mut parser = Parser::new(Kind::Request);
        let err = parser.feed(b"NOT A REQUEST\r\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn non_hex_chunk_size_is_a_protocol_error() {
        let mut parser = Parser::new(Kind::Response);
        parser
            .feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap();
        let err = parser.feed(b"zz\r\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn oversized_header_block_is_a_limit_error() {
        let mut parser = Parser::new(Kind::Request);
        let mut wire = b"GET / HTTP/1.1\r\n".to_vec();
        wire.extend(std::iter::repeat(b'a').take(9 * 1024));
        let err = parser.feed(&wire).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Limit);
    }

    #[test]
    fn gzip_body_is_decompressed_before_the_chunk_event() {
        let body = b"a compressible body a compressible body";
        let packed = Compressor::default()
            .compress(body, Method::Gzip)
            .unwrap();
        let mut wire = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            packed.len()
        )
        .into_bytes();
        wire.extend_from_slice(&packed);

        let mut parser = Parser::new(Kind::Response);
        let (_, events) = collect(&mut parser, &wire);
        assert!(events.contains(&Event::Chunk(body.to_vec())));
        assert!(parser.is_done());
    }

    #[test]
    fn headers_are_normalized() {
        let mut parser = Parser::new(Kind::Request);
        parser
            .feed(b"GET / HTTP/1.1\r\nX-Custom-Header:   padded value  \r\n\r\n")
            .unwrap();
        assert_eq!(parser.headers().get("x-custom-header"), Some("padded value"));
    }

    #[test]
    fn until_close_bodies_finish_on_eof() {
        let mut parser = Parser::new(Kind::Response);
        parser.feed(b"HTTP/1.1 200 OK\r\n\r\npartial").unwrap();
        assert!(!parser.is_done());
        let events = parser.eof().unwrap();
        assert_eq!(events.last(), Some(&Event::End));
        assert!(parser.is_done());
    }
}
