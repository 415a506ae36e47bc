//! Per-segment authenticated encryption.
//!
//! AES-256-GCM with a fresh random 96-bit nonce per encryption. Redundant
//! copies of the same plaintext are independent encryptions, so each copy
//! carries its own nonce and ciphertext hash.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::{CryptoError, Result};
use crate::keys::KEY_SIZE;

/// AES-GCM nonce length (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Stateless segment cipher around one 256-bit key.
pub struct SegmentCipher {
    cipher: Aes256Gcm,
}

impl SegmentCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key.len(),
            });
        }
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        })
    }

    /// Encrypt with a fresh random nonce. Returns (nonce, ciphertext);
    /// the ciphertext includes the authentication tag.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>)> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        Ok((nonce, ciphertext))
    }

    /// Re-encrypt under a previously recorded nonce, reproducing the exact
    /// ciphertext of an earlier [`encrypt`] call byte for byte. Only valid
    /// for the same (key, nonce, plaintext) triple that produced the
    /// recorded copy.
    pub fn encrypt_with_nonce(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: nonce.len(),
            });
        }
        self.cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt and authenticate. A failed tag is an integrity error, never
    /// a generic failure.
    pub fn decrypt(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: nonce.len(),
            });
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Integrity)
    }
}
