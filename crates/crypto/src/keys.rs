//! Key material: share master keys, key wrapping, passphrase derivation.
//!
//! Wrapping is AEAD of the raw key under a wrapping key, rendered base64
//! of nonce‖ciphertext. The passphrase path derives the wrapping key with
//! scrypt; a separate PBKDF2 hash (different salt) exists only to answer
//! "wrong passphrase" without touching the wrapping material.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use scrypt::Params as ScryptParams;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead::{SegmentCipher, NONCE_SIZE};
use crate::error::{CryptoError, Result};

/// 256-bit keys everywhere.
pub const KEY_SIZE: usize = 32;

/// Salt length for both derivation paths.
pub const SALT_SIZE: usize = 16;

pub const DEFAULT_SCRYPT_N: u32 = 16_384;
pub const DEFAULT_SCRYPT_R: u32 = 8;
pub const DEFAULT_SCRYPT_P: u32 = 1;
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;

type HmacSha256 = Hmac<Sha256>;

/// A 32-byte symmetric key, zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = raw
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: raw.len(),
            })?;
        Ok(Self(bytes))
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded)
            .map_err(|_| CryptoError::InvalidWrappedKey)?;
        Self::from_slice(&raw)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MasterKey").field(&"[REDACTED]").finish()
    }
}

pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// wrap(key, wrapping_key) = AEAD(key, wrapping_key, random nonce),
/// stored base64 of nonce‖ciphertext.
pub fn wrap_key(key: &MasterKey, wrapping_key: &MasterKey) -> Result<String> {
    let cipher = SegmentCipher::new(wrapping_key.as_bytes())?;
    let (nonce, ciphertext) = cipher.encrypt(key.as_bytes())?;
    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(blob))
}

/// Inverse of [`wrap_key`]. A wrong wrapping key fails the tag and comes
/// back as `Integrity`; the access layer collapses that into its single
/// "access denied" response.
pub fn unwrap_key(wrapped: &str, wrapping_key: &MasterKey) -> Result<MasterKey> {
    let blob = BASE64
        .decode(wrapped)
        .map_err(|_| CryptoError::InvalidWrappedKey)?;
    if blob.len() <= NONCE_SIZE {
        return Err(CryptoError::InvalidWrappedKey);
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
    let cipher = SegmentCipher::new(wrapping_key.as_bytes())?;
    let raw = cipher.decrypt(nonce, ciphertext)?;
    MasterKey::from_slice(&raw)
}

/// scrypt-derive a wrapping key from a passphrase. `n` must be a power of
/// two; defaults are N=16384, r=8, p=1.
pub fn derive_passphrase_key(
    passphrase: &str,
    salt: &[u8],
    n: u32,
    r: u32,
    p: u32,
) -> Result<MasterKey> {
    if n < 2 || !n.is_power_of_two() {
        return Err(CryptoError::KeyDerivation(format!(
            "scrypt n must be a power of two, got {n}"
        )));
    }
    let log_n = n.trailing_zeros() as u8;
    let params = ScryptParams::new(log_n, r, p, KEY_SIZE)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let mut out = [0u8; KEY_SIZE];
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(MasterKey::from_bytes(out))
}

/// PBKDF2-SHA256 digest of the passphrase, stored solely to answer the
/// "wrong passphrase" probe. The wrapping key is never derived from this.
pub fn passphrase_verifier(passphrase: &str, salt: &[u8], iterations: u32) -> [u8; KEY_SIZE] {
    let mut out = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut out);
    out
}

/// Constant-time comparison against a stored verifier.
pub fn verify_passphrase(
    passphrase: &str,
    salt: &[u8],
    iterations: u32,
    expected: &[u8],
) -> bool {
    let computed = passphrase_verifier(passphrase, salt, iterations);
    if expected.len() != computed.len() {
        return false;
    }
    bool::from(computed.ct_eq(expected))
}

/// Wrapping key for one member of a member-gated share: keyed by the
/// member's public key so only the holder of that key material unwraps.
pub fn derive_member_wrapping_key(user_id: &str, user_public_key: &[u8]) -> Result<MasterKey> {
    let mut mac = HmacSha256::new_from_slice(user_public_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(b"member-key-wrap:");
    mac.update(user_id.as_bytes());
    let digest: [u8; KEY_SIZE] = mac.finalize().into_bytes().into();
    Ok(MasterKey::from_bytes(digest))
}
