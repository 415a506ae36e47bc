use common::{Classify, ErrorClass};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("tls: {0}")]
    Tls(String),

    #[error("server rejected authentication ({code}): {message}")]
    AuthRejected { code: u16, message: String },

    #[error("posting not allowed on this server")]
    PostingNotAllowed,

    #[error("no such article: {0}")]
    NoSuchArticle(String),

    #[error("article rejected as malformed ({code}): {message}")]
    ArticleRejected { code: u16, message: String },

    #[error("server busy, try again later ({code})")]
    TryAgainLater { code: u16 },

    #[error("unexpected response ({code}): {message}")]
    Protocol { code: u16, message: String },

    #[error("no connection available within the acquire window")]
    AcquireTimeout,

    #[error("rate limited; retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("every configured server failed: {0}")]
    AllServersFailed(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl NetError {
    /// Whether the operation layer may retry this failure (with backoff).
    /// Auth rejections, missing articles and malformed-article rejections
    /// are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetError::Io(_)
                | NetError::Timeout
                | NetError::Tls(_)
                | NetError::TryAgainLater { .. }
                | NetError::RateLimited { .. }
                | NetError::AcquireTimeout
        )
    }
}

impl Classify for NetError {
    fn class(&self) -> ErrorClass {
        match self {
            NetError::Io(_) | NetError::Timeout | NetError::Tls(_) | NetError::TryAgainLater { .. } => {
                ErrorClass::Transient
            }
            NetError::AuthRejected { .. } | NetError::PostingNotAllowed => ErrorClass::Auth,
            // A missing copy routes exactly like a damaged one: skip to the
            // next redundancy copy, never re-fetch the same article.
            NetError::NoSuchArticle(_) => ErrorClass::Integrity,
            NetError::ArticleRejected { .. } => ErrorClass::Validation,
            NetError::AcquireTimeout | NetError::RateLimited { .. } => ErrorClass::Capacity,
            NetError::Protocol { .. } | NetError::RetriesExhausted { .. } => ErrorClass::Transient,
            NetError::AllServersFailed(_) => ErrorClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_matrix_matches_the_policy() {
        assert!(NetError::Timeout.is_retryable());
        assert!(NetError::TryAgainLater { code: 400 }.is_retryable());
        assert!(NetError::RateLimited { retry_after_ms: 10 }.is_retryable());

        assert!(!NetError::AuthRejected {
            code: 481,
            message: "bad creds".into()
        }
        .is_retryable());
        assert!(!NetError::NoSuchArticle("<x@y>".into()).is_retryable());
        assert!(!NetError::ArticleRejected {
            code: 441,
            message: "malformed".into()
        }
        .is_retryable());
    }

    #[test]
    fn classification() {
        assert_eq!(NetError::Timeout.class(), ErrorClass::Transient);
        assert_eq!(
            NetError::PostingNotAllowed.class(),
            ErrorClass::Auth
        );
        assert_eq!(
            NetError::NoSuchArticle("<x>".into()).class(),
            ErrorClass::Integrity
        );
        assert_eq!(NetError::AcquireTimeout.class(), ErrorClass::Capacity);
        assert_eq!(
            NetError::AllServersFailed("down".into()).class(),
            ErrorClass::Fatal
        );
    }
}
