//! Per-folder Ed25519 signing.
//!
//! Each folder gets one keypair on first use, persisted hex in its row.
//! The public half is published with the first share and pinned by
//! recipients; the share manifest root is signed so a token holder can
//! verify authenticity before trusting the index.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::{CryptoError, Result};

pub const SIGNATURE_SIZE: usize = 64;

pub struct FolderSigner {
    key: SigningKey,
}

impl FolderSigner {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let raw = hex::decode(secret_hex).map_err(|_| CryptoError::InvalidSigningKey)?;
        let bytes: [u8; 32] = raw.try_into().map_err(|_| CryptoError::InvalidSigningKey)?;
        Ok(Self {
            key: SigningKey::from_bytes(&bytes),
        })
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    pub fn verifying_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// Raw secret bytes, used as the HMAC key for subject obfuscation.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.key.sign(message).to_bytes()
    }
}

pub fn verify_signature(
    verifying_key_hex: &str,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let raw = hex::decode(verifying_key_hex).map_err(|_| CryptoError::InvalidSigningKey)?;
    let key_bytes: [u8; 32] = raw.try_into().map_err(|_| CryptoError::InvalidSigningKey)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidSigningKey)?;
    let sig_bytes: [u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| CryptoError::BadSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);
    key.verify(message, &signature)
        .map_err(|_| CryptoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let signer = FolderSigner::generate();
        let signature = signer.sign(b"manifest root");
        verify_signature(&signer.verifying_key_hex(), b"manifest root", &signature).unwrap();
    }

    #[test]
    fn persisted_key_signs_identically() {
        let signer = FolderSigner::generate();
        let restored = FolderSigner::from_hex(&signer.secret_hex()).unwrap();
        assert_eq!(signer.sign(b"m"), restored.sign(b"m"));
        assert_eq!(signer.verifying_key_hex(), restored.verifying_key_hex());
    }

    #[test]
    fn tampered_message_fails() {
        let signer = FolderSigner::generate();
        let signature = signer.sign(b"original");
        let err =
            verify_signature(&signer.verifying_key_hex(), b"tampered", &signature).unwrap_err();
        assert!(matches!(err, CryptoError::BadSignature));
    }

    #[test]
    fn wrong_verifying_key_fails() {
        let signer = FolderSigner::generate();
        let other = FolderSigner::generate();
        let signature = signer.sign(b"m");
        assert!(verify_signature(&other.verifying_key_hex(), b"m", &signature).is_err());
    }

    #[test]
    fn malformed_key_material_is_rejected() {
        assert!(FolderSigner::from_hex("zzzz").is_err());
        assert!(FolderSigner::from_hex("00ff").is_err());
        assert!(verify_signature("not-hex", b"m", &[0u8; 64]).is_err());
    }
}
