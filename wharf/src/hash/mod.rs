//! Payload compression and symmetric encryption.
//!
//! [`Compressor`] wraps the seven supported compression backends behind one
//! method/level surface and keeps reusable raw-deflate contexts for
//! stream-style usage (WebSocket per-message compression with context
//! takeover). [`Cipher`] implements AES-CBC with PBKDF2-derived keys, the
//! payload encryption used by the non-standard WebSocket encrypt extension.

mod cipher;
mod compress;

pub use cipher::{Cipher, KeySize};
pub use compress::{Compressor, Level, Method, SYNC_TAIL};
