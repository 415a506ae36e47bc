use common::{Classify, ErrorClass};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetrieverError {
    #[error("store: {0}")]
    Store(#[from] store::StoreError),

    #[error("net: {0}")]
    Net(#[from] net::NetError),

    #[error("crypto: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("codec: {0}")]
    Codec(#[from] codec::CodecError),

    #[error("manifest could not be encoded: {0}")]
    ManifestEncode(serde_json::Error),

    #[error("manifest is malformed")]
    ManifestMalformed,

    #[error("manifest signature verification failed")]
    ManifestSignature,

    #[error("share has no index articles recorded")]
    NoIndex,

    #[error("segment {index} of {path}: every redundancy copy failed ({last})")]
    SegmentExhausted {
        path: String,
        index: u32,
        last: String,
    },

    #[error("{path}: reassembled content hash does not match the record")]
    FileIntegrity { path: String },

    #[error("io at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl Classify for RetrieverError {
    fn class(&self) -> ErrorClass {
        match self {
            RetrieverError::Store(e) => e.class(),
            RetrieverError::Net(e) => e.class(),
            RetrieverError::Crypto(e) => e.class(),
            RetrieverError::Codec(e) => e.class(),
            RetrieverError::ManifestEncode(_) => ErrorClass::Fatal,
            RetrieverError::ManifestMalformed
            | RetrieverError::ManifestSignature
            | RetrieverError::FileIntegrity { .. }
            | RetrieverError::SegmentExhausted { .. } => ErrorClass::Integrity,
            RetrieverError::NoIndex => ErrorClass::Validation,
            RetrieverError::Io { .. } => ErrorClass::Transient,
        }
    }
}

pub type Result<T> = std::result::Result<T, RetrieverError>;
