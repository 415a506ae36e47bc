//! Cryptographic primitives for the share pipeline.
//!
//! - AES-256-GCM over each segment body ([`aead`])
//! - key generation, wrapping and passphrase derivation ([`keys`])
//! - per-folder Ed25519 signing ([`signing`])
//! - SHA-256 content hashing helpers
//!
//! Verification failure on any decrypt path surfaces as a distinct
//! integrity error; wrong-passphrase and wrong-member-key are collapsed
//! into one observable response above this crate, so no oracle exists.

pub mod aead;
pub mod error;
pub mod keys;
pub mod signing;

pub use aead::{SegmentCipher, NONCE_SIZE};
pub use error::{CryptoError, Result};
pub use keys::{
    derive_member_wrapping_key, derive_passphrase_key, generate_salt, passphrase_verifier,
    unwrap_key, verify_passphrase, wrap_key, MasterKey, DEFAULT_PBKDF2_ITERATIONS,
    DEFAULT_SCRYPT_N, DEFAULT_SCRYPT_P, DEFAULT_SCRYPT_R, KEY_SIZE, SALT_SIZE,
};
pub use signing::{verify_signature, FolderSigner, SIGNATURE_SIZE};

use sha2::{Digest, Sha256};

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 rendered lowercase hex, the canonical content-hash form.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Incremental hasher for streamed file reads.
pub struct StreamingHasher {
    inner: Sha256,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data = vec![0xA5u8; 200_000];
        let mut hasher = StreamingHasher::new();
        for chunk in data.chunks(65_536) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize_hex(), sha256_hex(&data));
    }
}
