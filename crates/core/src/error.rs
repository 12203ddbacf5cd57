//! Base error model.

use thiserror::Error;

/// Result type used by the core layer.
pub type CoreResult<T> = Result<T, CoreError>;

/// Deterministic, value-level failures.
///
/// Infrastructure concerns (storage, crypto, transport) carry their own error
/// enums in their own crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier failed to parse (wrong length, bad hex).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
