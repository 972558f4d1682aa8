//! Compression backends.
//!
//! One-shot `compress`/`decompress` cover every supported method. The raw
//! deflate path additionally exposes a streaming pair (`deflate_stream` /
//! `inflate_stream`) whose zlib contexts survive across calls when context
//! takeover is enabled, producing sync-flushed blocks terminated by
//! [`SYNC_TAIL`].

use std::io::Read;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::errors::{Error, Result};

/// Trailing bytes of a sync-flushed deflate block. The WebSocket codec strips
/// this tail at message boundaries and restores it before inflating.
pub const SYNC_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Supported compression methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Lz4,
    Lzma,
    Zstd,
    Gzip,
    Bzip2,
    Brotli,
    Deflate,
}

impl Method {
    /// Canonical `Content-Encoding` token.
    pub fn token(self) -> &'static str {
        match self {
            Self::Lz4 => "lz4",
            Self::Lzma => "xz",
            Self::Zstd => "zstd",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Brotli => "br",
            Self::Deflate => "deflate",
        }
    }

    /// Resolves a `Content-Encoding` token, case-insensitive.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "lz4" => Some(Self::Lz4),
            "xz" | "lzma" => Some(Self::Lzma),
            "zstd" => Some(Self::Zstd),
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "bzip2" => Some(Self::Bzip2),
            "br" => Some(Self::Brotli),
            "deflate" => Some(Self::Deflate),
            _ => None,
        }
    }
}

/// Compression effort presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Level {
    Best,
    Speed,
    #[default]
    Normal,
}

impl Level {
    fn flate2(self) -> Compression {
        match self {
            Self::Best => Compression::best(),
            Self::Speed => Compression::fast(),
            Self::Normal => Compression::default(),
        }
    }

    fn brotli(self) -> u32 {
        match self {
            Self::Best => 11,
            Self::Speed => 1,
            Self::Normal => 6,
        }
    }

    fn zstd(self) -> i32 {
        match self {
            Self::Best => 19,
            Self::Speed => 1,
            Self::Normal => 3,
        }
    }

    fn bzip2(self) -> u32 {
        match self {
            Self::Best => 9,
            Self::Speed => 1,
            Self::Normal => 6,
        }
    }

    fn xz(self) -> u32 {
        match self {
            Self::Best => 9,
            Self::Speed => 0,
            Self::Normal => 6,
        }
    }
}

/// Compression engine with optional context takeover for raw deflate.
pub struct Compressor {
    level: Level,
    takeover_compress: bool,
    takeover_decompress: bool,
    deflate_ctx: Option<Compress>,
    inflate_ctx: Option<Decompress>,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(Level::Normal)
    }
}

impl Compressor {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            takeover_compress: false,
            takeover_decompress: false,
            deflate_ctx: None,
            inflate_ctx: None,
        }
    }

    pub fn level(&mut self, level: Level) {
        self.level = level;
        // A level change invalidates any live deflate context.
        self.deflate_ctx = None;
    }

    /// Keeps the deflate context alive between `deflate_stream` calls.
    pub fn takeover_compress(&mut self, flag: bool) {
        self.takeover_compress = flag;
    }

    /// Keeps the inflate context alive between `inflate_stream` calls.
    pub fn takeover_decompress(&mut self, flag: bool) {
        self.takeover_decompress = flag;
    }

    /// One-shot compression with the selected method.
    pub fn compress(&self, buffer: &[u8], method: Method) -> Result<Vec<u8>> {
        if buffer.is_empty() {
            return Ok(Vec::new());
        }
        match method {
            Method::Deflate => {
                let mut ctx = Compress::new(self.level.flate2(), false);
                let mut out = Vec::with_capacity(buffer.len() / 2 + 64);
                run_deflate(&mut ctx, buffer, FlushCompress::Finish, &mut out)?;
                Ok(out)
            }
            Method::Gzip => {
                let mut out = Vec::with_capacity(buffer.len() / 2 + 64);
                flate2::read::GzEncoder::new(buffer, self.level.flate2())
                    .read_to_end(&mut out)
                    .map_err(|e| Error::protocol(format!("gzip compress: {e}")))?;
                Ok(out)
            }
            Method::Brotli => {
                let mut out = Vec::with_capacity(buffer.len() / 2 + 64);
                brotli::CompressorReader::new(buffer, 4096, self.level.brotli(), 22)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::protocol(format!("brotli compress: {e}")))?;
                Ok(out)
            }
            Method::Zstd => zstd::stream::encode_all(buffer, self.level.zstd())
                .map_err(|e| Error::protocol(format!("zstd compress: {e}"))),
            Method::Bzip2 => {
                let mut out = Vec::with_capacity(buffer.len() / 2 + 64);
                bzip2::read::BzEncoder::new(buffer, bzip2::Compression::new(self.level.bzip2()))
                    .read_to_end(&mut out)
                    .map_err(|e| Error::protocol(format!("bzip2 compress: {e}")))?;
                Ok(out)
            }
            Method::Lzma => {
                let mut out = Vec::with_capacity(buffer.len() / 2 + 64);
                xz2::read::XzEncoder::new(buffer, self.level.xz())
                    .read_to_end(&mut out)
                    .map_err(|e| Error::protocol(format!("lzma compress: {e}")))?;
                Ok(out)
            }
            Method::Lz4 => {
                let mode = match self.level {
                    Level::Best => Some(lz4::block::CompressionMode::HIGHCOMPRESSION(12)),
                    Level::Speed => Some(lz4::block::CompressionMode::FAST(1)),
                    Level::Normal => None,
                };
                lz4::block::compress(buffer, mode, true)
                    .map_err(|e| Error::protocol(format!("lz4 compress: {e}")))
            }
        }
    }

    /// One-shot decompression with the selected method.
    pub fn decompress(&self, buffer: &[u8], method: Method) -> Result<Vec<u8>> {
        if buffer.is_empty() {
            return Ok(Vec::new());
        }
        match method {
            Method::Deflate => {
                let mut ctx = Decompress::new(false);
                let mut out = Vec::with_capacity(buffer.len() * 3 + 64);
                run_inflate(&mut ctx, buffer, &mut out)?;
                Ok(out)
            }
            Method::Gzip => {
                let mut out = Vec::with_capacity(buffer.len() * 3 + 64);
                flate2::read::GzDecoder::new(buffer)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::protocol(format!("gzip decompress: {e}")))?;
                Ok(out)
            }
            Method::Brotli => {
                let mut out = Vec::with_capacity(buffer.len() * 3 + 64);
                brotli::Decompressor::new(buffer, 4096)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::protocol(format!("brotli decompress: {e}")))?;
                Ok(out)
            }
            Method::Zstd => zstd::stream::decode_all(buffer)
                .map_err(|e| Error::protocol(format!("zstd decompress: {e}"))),
            Method::Bzip2 => {
                let mut out = Vec::with_capacity(buffer.len() * 3 + 64);
                bzip2::read::BzDecoder::new(buffer)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::protocol(format!("bzip2 decompress: {e}")))?;
                Ok(out)
            }
            Method::Lzma => {
                let mut out = Vec::with_capacity(buffer.len() * 3 + 64);
                xz2::read::XzDecoder::new(buffer)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::protocol(format!("lzma decompress: {e}")))?;
                Ok(out)
            }
            Method::Lz4 => lz4::block::decompress(buffer, None)
                .map_err(|e| Error::protocol(format!("lz4 decompress: {e}"))),
        }
    }

    /// Compresses one message with the stream context. The output is a
    /// sync-flushed raw deflate block ending in [`SYNC_TAIL`]; without
    /// takeover the context is reset afterwards.
    pub fn deflate_stream(&mut self, buffer: &[u8]) -> Result<Vec<u8>> {
        let level = self.level.flate2();
        let ctx = self
            .deflate_ctx
            .get_or_insert_with(|| Compress::new(level, false));
        let mut out = Vec::with_capacity(buffer.len() / 2 + 64);
        run_deflate(ctx, buffer, FlushCompress::Sync, &mut out)?;
        if !self.takeover_compress {
            ctx.reset();
        }
        Ok(out)
    }

    /// Inflates one sync-flushed message with the stream context.
    pub fn inflate_stream(&mut self, buffer: &[u8]) -> Result<Vec<u8>> {
        let ctx = self.inflate_ctx.get_or_insert_with(|| Decompress::new(false));
        let mut out = Vec::with_capacity(buffer.len() * 3 + 64);
        run_inflate(ctx, buffer, &mut out)?;
        if !self.takeover_decompress {
            ctx.reset(false);
        }
        Ok(out)
    }
}

fn run_deflate(
    ctx: &mut Compress,
    input: &[u8],
    flush: FlushCompress,
    out: &mut Vec<u8>,
) -> Result<()> {
    let mut consumed = 0usize;
    loop {
        if out.len() == out.capacity() {
            out.reserve((input.len() / 2).max(1024));
        }
        let before = ctx.total_in();
        let status = ctx
            .compress_vec(&input[consumed..], out, flush)
            .map_err(|e| Error::protocol(format!("deflate: {e}")))?;
        consumed += (ctx.total_in() - before) as usize;
        match status {
            Status::StreamEnd => return Ok(()),
            Status::Ok | Status::BufError => {
                // Flush is complete once all input is consumed and deflate
                // stopped short of the output capacity.
                if consumed == input.len() && out.len() < out.capacity() {
                    return Ok(());
                }
            }
        }
    }
}

fn run_inflate(ctx: &mut Decompress, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let mut consumed = 0usize;
    loop {
        if out.len() == out.capacity() {
            out.reserve((input.len() * 2).max(1024));
        }
        let before = ctx.total_in();
        let status = ctx
            .decompress_vec(&input[consumed..], out, FlushDecompress::Sync)
            .map_err(|e| Error::protocol(format!("inflate: {e}")))?;
        consumed += (ctx.total_in() - before) as usize;
        match status {
            Status::StreamEnd => return Ok(()),
            Status::Ok | Status::BufError => {
                if consumed == input.len() && out.len() < out.capacity() {
                    return Ok(());
                }
                if status == Status::BufError && consumed == input.len() {
                    // Inflate wants more input; the sync tail already ended
                    // the block, so everything produced so far is the message.
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"the quick brown fox jumps over the lazy dog, \
        the quick brown fox jumps over the lazy dog";

    #[test]
    fn one_shot_round_trips_every_method() {
        let hash = Compressor::default();
        for method in [
            Method::Lz4,
            Method::Lzma,
            Method::Zstd,
            Method::Gzip,
            Method::Bzip2,
            Method::Brotli,
            Method::Deflate,
        ] {
            let packed = hash.compress(SAMPLE, method).unwrap();
            assert!(!packed.is_empty(), "{method:?} produced no output");
            let plain = hash.decompress(&packed, method).unwrap();
            assert_eq!(plain, SAMPLE, "{method:?} round trip");
        }
    }

    #[test]
    fn stream_deflate_ends_with_sync_tail() {
        let mut hash = Compressor::default();
        let block = hash.deflate_stream(SAMPLE).unwrap();
        assert!(block.len() >= 4);
        assert_eq!(&block[block.len() - 4..], &SYNC_TAIL);
        let plain = hash.inflate_stream(&block).unwrap();
        assert_eq!(plain, SAMPLE);
    }

    #[test]
    fn takeover_keeps_the_dictionary_between_messages() {
        let mut fresh = Compressor::default();
        let first = fresh.deflate_stream(SAMPLE).unwrap();

        let mut reused = Compressor::default();
        reused.takeover_compress(true);
        reused.takeover_decompress(true);
        let one = reused.deflate_stream(SAMPLE).unwrap();
        let two = reused.deflate_stream(SAMPLE).unwrap();
        // The second message references the retained window and shrinks.
        assert!(two.len() < one.len());
        assert_eq!(one, first);
        assert_eq!(reused.inflate_stream(&one).unwrap(), SAMPLE);
        assert_eq!(reused.inflate_stream(&two).unwrap(), SAMPLE);
    }

    #[test]
    fn without_takeover_messages_stay_independent() {
        let mut hash = Compressor::default();
        let one = hash.deflate_stream(SAMPLE).unwrap();
        let two = hash.deflate_stream(SAMPLE).unwrap();
        assert_eq!(one, two);
        assert_eq!(hash.inflate_stream(&one).unwrap(), SAMPLE);
        assert_eq!(hash.inflate_stream(&two).unwrap(), SAMPLE);
    }

    #[test]
    fn content_encoding_tokens_resolve() {
        assert_eq!(Method::from_token("GZIP"), Some(Method::Gzip));
        assert_eq!(Method::from_token(" br "), Some(Method::Brotli));
        assert_eq!(Method::from_token("identity"), None);
    }
}
