//! AES-256-GCM payload cipher.
//!
//! Wire format of an encrypted payload (standard base64 of the bytes below):
//!
//! ```text
//! ┌────────────┬──────────────────────────────┐
//! │ nonce (12) │ ciphertext ‖ GCM tag (16)    │
//! └────────────┴──────────────────────────────┘
//! ```
//!
//! A fresh random nonce is drawn for every payload.  The session key is the
//! base64 encoding of 32 raw key bytes, exchanged at pairing time.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use pairlink_core::SessionKey;

use crate::application::ports::{CipherError, PayloadCipher};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Production [`PayloadCipher`].  Stateless; the key travels with each call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesGcmCipher;

impl AesGcmCipher {
    fn cipher_for(key: &SessionKey) -> Result<Aes256Gcm, CipherError> {
        let bytes = STANDARD
            .decode(key.expose().trim())
            .map_err(|_| CipherError::InvalidKey)?;
        if bytes.len() != KEY_LEN {
            return Err(CipherError::InvalidKey);
        }
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes)))
    }
}

impl PayloadCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str, key: Option<&SessionKey>) -> Result<String, CipherError> {
        let Some(key) = key else {
            return Ok(plaintext.to_string());
        };
        let cipher = Self::cipher_for(key)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;
        Ok(STANDARD.encode([nonce.as_slice(), &ciphertext].concat()))
    }

    fn decrypt(&self, ciphertext: &str, key: Option<&SessionKey>) -> Result<String, CipherError> {
        let Some(key) = key else {
            return Ok(ciphertext.to_string());
        };
        let cipher = Self::cipher_for(key)?;
        let bytes = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| CipherError::InvalidCiphertext(e.to_string()))?;
        if bytes.len() < NONCE_LEN {
            return Err(CipherError::InvalidCiphertext(
                "shorter than the nonce".to_string(),
            ));
        }
        let (nonce, body) = bytes.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CipherError::InvalidCiphertext("authentication failed".to_string()))?;
        String::from_utf8(plaintext).map_err(|e| CipherError::InvalidCiphertext(e.to_string()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
