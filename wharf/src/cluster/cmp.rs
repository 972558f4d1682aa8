//! Chunked message protocol for master/worker IPC.
//!
//! Every application record is split into chunks of at most `CHUNK_SIZE`
//! bytes, each carried behind a packed little-endian header. Reassembly is
//! keyed by `(sender pid, record index)`; BEGIN opens (or resets) an
//! in-flight buffer, CONTINUE extends it, END commits exactly one delivery.
//! A record that fits one chunk travels as a lone END frame.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{Error, Result};

/// Default chunk payload ceiling.
pub const CHUNK_SIZE: usize = 0x1000;

/// Packed header length on the wire.
pub const HEADER_LEN: usize = 4 + 1 + 8 + 8 + 8;

/// Transfer mode of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    None = 0x00,
    End = 0x01,
    Begin = 0x02,
    Continue = 0x03,
}

impl Mode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::None),
            0x01 => Some(Self::End),
            0x02 => Some(Self::Begin),
            0x03 => Some(Self::Continue),
            _ => None,
        }
    }
}

/// Chunk header, fixed little-endian layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sender process id.
    pub pid: u32,
    pub mode: Mode,
    /// Size of the whole record.
    pub size: u64,
    /// Bytes carried by this chunk.
    pub bytes: u64,
    /// Sender-scoped monotonic record index.
    pub index: u64,
}

impl Header {
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(HEADER_LEN);
        out.put_u32_le(self.pid);
        out.put_u8(self.mode as u8);
        out.put_u64_le(self.size);
        out.put_u64_le(self.bytes);
        out.put_u64_le(self.index);
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < HEADER_LEN {
            return Err(Error::protocol("short CMP header"));
        }
        let pid = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        let mode = Mode::from_byte(buffer[4])
            .ok_or_else(|| Error::protocol(format!("unknown CMP mode {:#x}", buffer[4])))?;
        let mut qword = [0u8; 8];
        qword.copy_from_slice(&buffer[5..13]);
        let size = u64::from_le_bytes(qword);
        qword.copy_from_slice(&buffer[13..21]);
        let bytes = u64::from_le_bytes(qword);
        qword.copy_from_slice(&buffer[21..29]);
        let index = u64::from_le_bytes(qword);
        Ok(Self {
            pid,
            mode,
            size,
            bytes,
            index,
        })
    }
}

/// One chunk: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Splits records into chunk frames with a monotonically increasing index.
pub struct Splitter {
    pid: u32,
    index: u64,
    chunk_size: usize,
}

impl Splitter {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            index: 0,
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn chunk_size(&mut self, size: usize) {
        self.chunk_size = size.max(1);
    }

    pub fn split(&mut self, record: &[u8]) -> Vec<Frame> {
        let index = self.index;
        self.index += 1;
        let size = record.len() as u64;
        if record.len() <= self.chunk_size {
            return vec![Frame {
                header: Header {
                    pid: self.pid,
                    mode: Mode::End,
                    size,
                    bytes: size,
                    index,
                },
                payload: record.to_vec(),
            }];
        }
        let chunks: Vec<&[u8]> = record.chunks(self.chunk_size).collect();
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| Frame {
                header: Header {
                    pid: self.pid,
                    mode: if i == 0 {
                        Mode::Begin
                    } else if i == last {
                        Mode::End
                    } else {
                        Mode::Continue
                    },
                    size,
                    bytes: chunk.len() as u64,
                    index,
                },
                payload: chunk.to_vec(),
            })
            .collect()
    }
}

/// A committed record delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub pid: u32,
    pub index: u64,
    pub data: Vec<u8>,
}

/// Reassembles chunk frames into records.
#[derive(Default)]
pub struct Assembler {
    inflight: HashMap<(u32, u64), Vec<u8>>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorbs one frame; returns a delivery when an END commits a record.
    ///
    /// A chunk carrying more bytes than its header declares is trimmed to
    /// the declared count; CONTINUE without a matching BEGIN is dropped; a
    /// duplicate BEGIN resets the in-flight buffer.
    pub fn push(&mut self, frame: Frame) -> Option<Delivery> {
        let key = (frame.header.pid, frame.header.index);
        let declared = frame.header.bytes as usize;
        let mut payload = frame.payload;
        if payload.len() > declared {
            payload.truncate(declared);
        }
        match frame.header.mode {
            Mode::Begin => {
                let mut buffer = Vec::with_capacity(frame.header.size as usize);
                buffer.extend_from_slice(&payload);
                // A duplicate BEGIN for the same key resets the buffer.
                self.inflight.insert(key, buffer);
                None
            }
            Mode::Continue => {
                if let Some(buffer) = self.inflight.get_mut(&key) {
                    buffer.extend_from_slice(&payload);
                } else {
                    tracing::trace!(pid = key.0, index = key.1, "CONTINUE without BEGIN dropped");
                }
                None
            }
            Mode::End => {
                let data = match self.inflight.remove(&key) {
                    Some(mut buffer) => {
                        buffer.extend_from_slice(&payload);
                        buffer
                    }
                    // Single-chunk record.
                    None => payload,
                };
                Some(Delivery {
                    pid: key.0,
                    index: key.1,
                    data,
                })
            }
            Mode::None => None,
        }
    }

    /// Count of partially assembled records.
    pub fn pending(&self) -> usize {
        self.inflight.len()
    }
}

/// Frame-level codec for `tokio_util::codec::Framed` transports.
pub struct CmpCodec;

impl Decoder for CmpCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = Header::decode(&src[..HEADER_LEN])?;
        let payload_len = header.bytes as usize;
        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(payload_len).to_vec();
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for CmpCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.header.encode(dst);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
