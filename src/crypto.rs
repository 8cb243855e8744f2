//! Crypto Transport
//!
//! Symmetric encryption of message payloads with a key shared by the server
//! and its clients.
//!
//! ## Wire format
//!
//! ```text
//! base64( nonce (12 bytes) || ciphertext || tag (16 bytes) )
//! ```
//!
//! AES-256-GCM with a fresh random nonce per call, so encrypting the same
//! text twice yields different ciphertexts. The nonce is the IV; decryption
//! splits it back off the front of the decoded bytes.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::engine::{general_purpose::STANDARD, Engine};
use thiserror::Error;

/// Nonce (IV) length for AES-GCM
pub const NONCE_LEN: usize = 12;

/// Authentication tag length appended by AES-GCM
pub const TAG_LEN: usize = 16;

/// Required key length (AES-256)
pub const KEY_LEN: usize = 32;

/// Crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Ciphertext is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Ciphertext too short: {len} bytes")]
    Truncated { len: usize },

    #[error("Decryption failed (wrong key or tampered ciphertext)")]
    Decryption,

    #[error("Decrypted payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Encryption failed")]
    Encryption,
}

/// Encrypt/decrypt capability shared by the hub and its clients
#[derive(Clone)]
pub struct CryptoTransport {
    cipher: Aes256Gcm,
}

impl CryptoTransport {
    /// Create from raw key bytes (must be 32 bytes)
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Create from a base64-encoded 32-byte key
    pub fn from_base64(key_base64: &str) -> Result<Self, CryptoError> {
        let key = STANDARD
            .decode(key_base64.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("key is not valid base64: {}", e)))?;
        Self::new(&key)
    }

    /// Generate a fresh random key, base64-encoded
    pub fn generate_key() -> String {
        STANDARD.encode(Aes256Gcm::generate_key(&mut OsRng))
    }

    /// Encrypt text into the transport form
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(out))
    }

    /// Decrypt the transport form back into text
    ///
    /// Malformed, truncated or foreign-key input is reported as an error;
    /// this never panics.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let bytes = STANDARD.decode(ciphertext.trim())?;
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated { len: bytes.len() });
        }

        let (nonce, body) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CryptoError::Decryption)?;

        Ok(String::from_utf8(plaintext)?)
    }
}

impl std::fmt::Debug for CryptoTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoTransport")
            .field("cipher", &"AES-256-GCM")
            .finish_non_exhaustive()
    }
}
