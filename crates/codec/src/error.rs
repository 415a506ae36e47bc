use common::{Classify, ErrorClass};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("yEnc framing error: {0}")]
    Framing(String),

    #[error("yEnc size mismatch: header says {expected}, decoded {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("yEnc crc32 mismatch")]
    CrcMismatch,

    #[error("article header malformed: {0}")]
    HeaderMalformed(String),

    #[error("article header does not match body ciphertext")]
    HeaderMismatch,

    #[error("compression failed: {0}")]
    Compression(std::io::Error),

    #[error("decompression failed: {0}")]
    Decompression(std::io::Error),
}

impl Classify for CodecError {
    fn class(&self) -> ErrorClass {
        match self {
            // A checksum or size that disagrees with the payload means this
            // copy is damaged; the caller should try another redundancy copy.
            CodecError::CrcMismatch
            | CodecError::SizeMismatch { .. }
            | CodecError::HeaderMismatch => ErrorClass::Integrity,
            CodecError::Decompression(_) => ErrorClass::Integrity,
            CodecError::Framing(_) | CodecError::HeaderMalformed(_) => ErrorClass::Validation,
            CodecError::Compression(_) => ErrorClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
