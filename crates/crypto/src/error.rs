use common::{Classify, ErrorClass};
use thiserror::Error;

/// Crypto-layer errors.
///
/// Verification failures surface as the distinct `Integrity` variant and
/// are never folded into a generic failure; downstream retry logic keys
/// off that distinction.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("integrity verification failed")]
    Integrity,

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid wrapped key encoding")]
    InvalidWrappedKey,

    #[error("invalid signing key material")]
    InvalidSigningKey,

    #[error("signature verification failed")]
    BadSignature,

    #[error("encryption failed")]
    EncryptionFailed,
}

impl Classify for CryptoError {
    fn class(&self) -> ErrorClass {
        match self {
            CryptoError::Integrity | CryptoError::BadSignature => ErrorClass::Integrity,
            CryptoError::InvalidKeyLength { .. }
            | CryptoError::InvalidNonceLength { .. }
            | CryptoError::InvalidWrappedKey
            | CryptoError::InvalidSigningKey => ErrorClass::Validation,
            CryptoError::KeyDerivation(_) | CryptoError::EncryptionFailed => ErrorClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;
