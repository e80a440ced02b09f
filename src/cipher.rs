//! Optional payload cipher: AES-256-CTR with a fresh 16-byte nonce per message.
//!
//! Sealed payloads travel as `base64(nonce || ciphertext)` inside the frame.
//! With no key configured both directions are the identity function.
//!
//! # Example
//!
//! ```
//! use homewire::cipher::Cipher;
//!
//! let cipher = Cipher::new([7u8; 32]);
//! let sealed = cipher.seal(b"{\"type\":\"PING\"}").unwrap();
//! assert_eq!(cipher.open(&sealed).unwrap(), b"{\"type\":\"PING\"}");
//! ```

use std::fmt;

use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CipherError;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// CTR nonce (initial counter block) length in bytes.
pub const NONCE_LEN: usize = 16;

/// Shared-key payload cipher. The key is fixed for the process lifetime.
#[derive(Clone, Default)]
pub struct Cipher {
    key: Option<[u8; KEY_LEN]>,
}

impl Cipher {
    /// Pass-through cipher (no key configured).
    pub fn disabled() -> Self {
        Self { key: None }
    }

    /// Cipher using the given 256-bit key.
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key: Some(key) }
    }

    /// Parse a 64-character hex key.
    pub fn from_hex(key: &str) -> Result<Self, CipherError> {
        let bytes = hex::decode(key.trim()).map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            CipherError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, bytes.len()))
        })?;
        Ok(Self::new(key))
    }

    /// Whether payloads are actually encrypted.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Encrypt `plaintext` into `base64(nonce || ciphertext)`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_vec());
        };

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut combined = Vec::with_capacity(NONCE_LEN + plaintext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(plaintext);

        let mut stream = Aes256Ctr::new(key.into(), (&nonce).into());
        stream.apply_keystream(&mut combined[NONCE_LEN..]);

        Ok(STANDARD.encode(&combined).into_bytes())
    }

    /// Decode and decrypt a sealed payload.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        let Some(key) = &self.key else {
            return Ok(sealed.to_vec());
        };

        let mut combined = STANDARD
            .decode(sealed)
            .map_err(|_| CipherError::InvalidEncoding)?;

        if combined.len() < NONCE_LEN {
            return Err(CipherError::Truncated(combined.len()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&combined[..NONCE_LEN]);

        let mut stream = Aes256Ctr::new(key.into(), (&nonce).into());
        stream.apply_keystream(&mut combined[NONCE_LEN..]);

        Ok(combined.split_off(NONCE_LEN))
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
