//! Pluggable per-packet ciphers for the UDP relay
//!
//! A cipher rewrites a datagram in place: encryption prepends a random
//! per-packet nonce and appends the authentication tag, decryption
//! strips both. The relay never looks inside the envelope; key and
//! nonce policy are entirely the cipher's business.

use chacha20poly1305::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha3::{Digest, Sha3_256};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes an encrypted packet grows by
pub const CIPHER_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("packet too short")]
    TooShort,

    #[error("packet authentication failed")]
    Authentication,

    #[error("encrypted packet would exceed buffer capacity")]
    Capacity,

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// In-place datagram transform. Implementations may grow `buf` up to
/// `capacity` and must be usable from any task.
pub trait PacketCipher: Send + Sync {
    fn encrypt_all(&self, buf: &mut Vec<u8>, capacity: usize) -> Result<(), CipherError>;
    fn decrypt_all(&self, buf: &mut Vec<u8>, capacity: usize) -> Result<(), CipherError>;
}

/// ChaCha20-Poly1305 with a random nonce in front of every packet
pub struct ChaChaPacketCipher {
    cipher: ChaCha20Poly1305,
}

impl ChaChaPacketCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { cipher: ChaCha20Poly1305::new(Key::from_slice(&key)) }
    }

    /// 64 hex digits -> 32-byte key
    pub fn from_hex(key: &str) -> Result<Self, CipherError> {
        let bytes = hex::decode(key).map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CipherError::InvalidKey("key must be 32 bytes".into()))?;
        Ok(Self::new(key))
    }

    /// Derive the key from a shared password.
    pub fn from_password(password: &str) -> Self {
        let key: [u8; 32] = Sha3_256::digest(password.as_bytes()).into();
        Self::new(key)
    }
}

impl PacketCipher for ChaChaPacketCipher {
    fn encrypt_all(&self, buf: &mut Vec<u8>, capacity: usize) -> Result<(), CipherError> {
        if buf.len() + CIPHER_OVERHEAD > capacity {
            return Err(CipherError::Capacity);
        }

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        self.cipher
            .encrypt_in_place(&nonce, b"", buf)
            .map_err(|_| CipherError::Capacity)?;
        buf.splice(0..0, nonce.iter().copied());
        Ok(())
    }

    fn decrypt_all(&self, buf: &mut Vec<u8>, _capacity: usize) -> Result<(), CipherError> {
        if buf.len() < CIPHER_OVERHEAD {
            return Err(CipherError::TooShort);
        }

        let nonce = Nonce::clone_from_slice(&buf[..NONCE_LEN]);
        buf.drain(..NONCE_LEN);
        self.cipher
            .decrypt_in_place(&nonce, b"", buf)
            .map_err(|_| CipherError::Authentication)
    }
}

/// Identity transform, for links that are already protected
pub struct PlainCipher;

impl PacketCipher for PlainCipher {
    fn encrypt_all(&self, buf: &mut Vec<u8>, capacity: usize) -> Result<(), CipherError> {
        if buf.len() > capacity {
            return Err(CipherError::Capacity);
        }
        Ok(())
    }

    fn decrypt_all(&self, _buf: &mut Vec<u8>, _capacity: usize) -> Result<(), CipherError> {
        Ok(())
    }
}
