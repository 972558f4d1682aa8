//! AES-CBC payload encryption.
//!
//! Keys are derived with PBKDF2-HMAC-SHA256 from a passphrase and salt. The
//! initialization vector starts as a zero block and is chained across chunks,
//! so a sequence of `encrypt_chunk` calls forms one continuous CBC stream.

use aes::{Aes128, Aes192, Aes256};
use cbc::{Decryptor, Encryptor};
use cipher::block_padding::{NoPadding, Pkcs7};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::errors::{Error, Result};

const BLOCK: usize = 16;

/// AES key width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeySize {
    #[default]
    Aes128,
    Aes192,
    Aes256,
}

impl KeySize {
    pub fn bytes(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// Resolves the `permessage-encrypt` bit-width parameter.
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            128 => Some(Self::Aes128),
            192 => Some(Self::Aes192),
            256 => Some(Self::Aes256),
            _ => None,
        }
    }

    pub fn bits(self) -> u16 {
        (self.bytes() * 8) as u16
    }
}

#[derive(Clone)]
enum Key {
    K128([u8; 16]),
    K192([u8; 24]),
    K256([u8; 32]),
}

/// AES-CBC cipher context.
pub struct Cipher {
    key: Key,
    chain_enc: [u8; BLOCK],
    chain_dec: [u8; BLOCK],
}

impl Cipher {
    /// Derives key material and resets both chain vectors to the zero block.
    pub fn new(pass: &str, salt: &[u8], rounds: u32, size: KeySize) -> Result<Self> {
        if rounds == 0 {
            return Err(Error::protocol("pbkdf2 rounds must be at least 1"));
        }
        if pass.is_empty() {
            return Err(Error::protocol("empty cipher passphrase"));
        }
        let key = match size {
            KeySize::Aes128 => {
                let mut key = [0u8; 16];
                pbkdf2_hmac::<Sha256>(pass.as_bytes(), salt, rounds, &mut key);
                Key::K128(key)
            }
            KeySize::Aes192 => {
                let mut key = [0u8; 24];
                pbkdf2_hmac::<Sha256>(pass.as_bytes(), salt, rounds, &mut key);
                Key::K192(key)
            }
            KeySize::Aes256 => {
                let mut key = [0u8; 32];
                pbkdf2_hmac::<Sha256>(pass.as_bytes(), salt, rounds, &mut key);
                Key::K256(key)
            }
        };
        Ok(Self {
            key,
            chain_enc: [0u8; BLOCK],
            chain_dec: [0u8; BLOCK],
        })
    }

    pub fn key_size(&self) -> KeySize {
        match self.key {
            Key::K128(_) => KeySize::Aes128,
            Key::K192(_) => KeySize::Aes192,
            Key::K256(_) => KeySize::Aes256,
        }
    }

    /// Rewinds both CBC chains to the zero block.
    pub fn reset(&mut self) {
        self.chain_enc = [0u8; BLOCK];
        self.chain_dec = [0u8; BLOCK];
    }

    /// One-shot PKCS7-padded encryption starting from the zero IV.
    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        let iv = [0u8; BLOCK];
        match &self.key {
            Key::K128(key) => Encryptor::<Aes128>::new(&(*key).into(), &iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(plain),
            Key::K192(key) => Encryptor::<Aes192>::new(&(*key).into(), &iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(plain),
            Key::K256(key) => Encryptor::<Aes256>::new(&(*key).into(), &iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(plain),
        }
    }

    /// One-shot decryption matching [`Cipher::encrypt`].
    pub fn decrypt(&self, packed: &[u8]) -> Result<Vec<u8>> {
        if packed.is_empty() || packed.len() % BLOCK != 0 {
            return Err(Error::protocol("ciphertext is not block aligned"));
        }
        let iv = [0u8; BLOCK];
        let out = match &self.key {
            Key::K128(key) => Decryptor::<Aes128>::new(&(*key).into(), &iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(packed),
            Key::K192(key) => Decryptor::<Aes192>::new(&(*key).into(), &iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(packed),
            Key::K256(key) => Decryptor::<Aes256>::new(&(*key).into(), &iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(packed),
        };
        out.map_err(|_| Error::protocol("invalid padding"))
    }

    /// Encrypts one block-aligned chunk, chaining the IV for the next call.
    pub fn encrypt_chunk(&mut self, plain: &[u8]) -> Result<Vec<u8>> {
        if plain.is_empty() || plain.len() % BLOCK != 0 {
            return Err(Error::protocol("chunk is not block aligned"));
        }
        let iv = self.chain_enc;
        let out = match &self.key {
            Key::K128(key) => Encryptor::<Aes128>::new(&(*key).into(), &iv.into())
                .encrypt_padded_vec_mut::<NoPadding>(plain),
            Key::K192(key) => Encryptor::<Aes192>::new(&(*key).into(), &iv.into())
                .encrypt_padded_vec_mut::<NoPadding>(plain),
            Key::K256(key) => Encryptor::<Aes256>::new(&(*key).into(), &iv.into())
                .encrypt_padded_vec_mut::<NoPadding>(plain),
        };
        self.chain_enc.copy_from_slice(&out[out.len() - BLOCK..]);
        Ok(out)
    }

    /// Decrypts one block-aligned chunk, chaining the IV for the next call.
    pub fn decrypt_chunk(&mut self, packed: &[u8]) -> Result<Vec<u8>> {
        if packed.is_empty() || packed.len() % BLOCK != 0 {
            return Err(Error::protocol("chunk is not block aligned"));
        }
        let iv = self.chain_dec;
        self.chain_dec.copy_from_slice(&packed[packed.len() - BLOCK..]);
        let out = match &self.key {
            Key::K128(key) => Decryptor::<Aes128>::new(&(*key).into(), &iv.into())
                .decrypt_padded_vec_mut::<NoPadding>(packed),
            Key::K192(key) => Decryptor::<Aes192>::new(&(*key).into(), &iv.into())
                .decrypt_padded_vec_mut::<NoPadding>(packed),
            Key::K256(key) => Decryptor::<Aes256>::new(&(*key).into(), &iv.into())
                .decrypt_padded_vec_mut::<NoPadding>(packed),
        };
        out.map_err(|_| Error::protocol("invalid chunk"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(size: KeySize) -> Cipher {
        Cipher::new("correct horse battery staple", b"pepper", 5, size).unwrap()
    }

    #[test]
    fn round_trips_every_key_size() {
        for size in [KeySize::Aes128, KeySize::Aes192, KeySize::Aes256] {
            let c = cipher(size);
            let packed = c.encrypt(b"attack at dawn");
            assert_eq!(packed.len() % 16, 0);
            assert_eq!(c.decrypt(&packed).unwrap(), b"attack at dawn");
        }
    }

    #[test]
    fn chunked_stream_equals_one_continuous_pass() {
        let plain = [7u8; 64];

        let mut chunked = cipher(KeySize::Aes256);
        let mut stream = chunked.encrypt_chunk(&plain[..32]).unwrap();
        stream.extend(chunked.encrypt_chunk(&plain[32..]).unwrap());

        let mut whole = cipher(KeySize::Aes256);
        let reference = whole.encrypt_chunk(&plain).unwrap();
        assert_eq!(stream, reference);

        let mut dec = cipher(KeySize::Aes256);
        let mut plain_again = dec.decrypt_chunk(&stream[..32]).unwrap();
        plain_again.extend(dec.decrypt_chunk(&stream[32..]).unwrap());
        assert_eq!(plain_again, plain);
    }

    #[test]
    fn wrong_rounds_are_rejected() {
        assert!(Cipher::new("x", b"s", 0, KeySize::Aes128).is_err());
    }

    #[test]
    fn tampered_padding_fails() {
        let c = cipher(KeySize::Aes128);
        let mut packed = c.encrypt(b"payload");
        let last = packed.len() - 1;
        packed[last] ^= 0xFF;
        assert!(c.decrypt(&packed).is_err());
    }
}
