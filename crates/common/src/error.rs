use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse error classification shared by every component.
///
/// Components keep their own error enums; this is the cross-cutting axis
/// that decides routing: what is retried, what falls back to another
/// redundancy copy, and what stops a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input or missing required field; never retried.
    Validation,
    /// Hash mismatch, failed authentication tag, bad token checksum.
    /// Retries must target a different redundancy copy.
    Integrity,
    /// Login refused, wrong passphrase, missing commitment. Callers see a
    /// single "access denied"; the log records the specific cause.
    Auth,
    /// Timeout, reset, temporary busy. Retried with backoff.
    Transient,
    /// Queue full, disk full, rate-limit refusal. Carries a retry-after hint.
    Capacity,
    /// Schema incompatibility, cluster-wide unreachability, corrupt state.
    /// The observing worker stops leasing new items.
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Capacity)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Integrity => "integrity",
            ErrorClass::Auth => "auth",
            ErrorClass::Transient => "transient",
            ErrorClass::Capacity => "capacity",
            ErrorClass::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Implemented by every component error so routing never needs to know
/// the concrete enum.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}
