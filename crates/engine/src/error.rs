//! Engine error taxonomy.
//!
//! Policy: transport and crypto failures drop the envelope; dependency gaps
//! park it in `blocked`; validation failures are terminal for the envelope;
//! busy storage retries with bounded backoff and surfaces as `Contended`;
//! projector failures abort the transaction and dead-letter the envelope.

use thiserror::Error;

use quiet_crypto::CryptoError;
use quiet_protocol::ProtocolError;
use quiet_store::StorageError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed datagram or framing failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Protocol(ProtocolError),

    #[error(transparent)]
    Storage(StorageError),

    /// Busy past the retry budget.
    #[error("contended: {0}")]
    Contended(String),

    /// A projector failed mid-transaction. Treated as a bug: the
    /// transaction aborts so no partial projection survives, and the caller
    /// dead-letters the carried envelope in a fresh transaction.
    #[error("projector failure in {kind}: {message}")]
    Projector {
        kind: String,
        message: String,
        envelope: String,
    },

    /// A command could not be built (bad params, missing local context).
    #[error("command rejected: {0}")]
    CommandRejected(String),

    /// An unknown named query.
    #[error("unknown query: {0}")]
    UnknownQuery(String),
}

impl From<StorageError> for EngineError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Busy(msg) => EngineError::Contended(msg),
            other => EngineError::Storage(other),
        }
    }
}

impl From<ProtocolError> for EngineError {
    fn from(value: ProtocolError) -> Self {
        match value {
            ProtocolError::Storage(e) => EngineError::from(e),
            ProtocolError::Crypto(e) => EngineError::Crypto(e),
            ProtocolError::BadParams(msg) => EngineError::CommandRejected(msg),
            ProtocolError::MissingContext(msg) => EngineError::CommandRejected(msg),
            other => EngineError::Protocol(other),
        }
    }
}

impl EngineError {
    /// Coarse category for command receipts.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Transport(_) => "transport",
            EngineError::Crypto(_) => "crypto",
            EngineError::Protocol(_) => "protocol",
            EngineError::Storage(_) => "storage",
            EngineError::Contended(_) => "contended",
            EngineError::Projector { .. } => "projector",
            EngineError::CommandRejected(_) => "rejected",
            EngineError::UnknownQuery(_) => "query",
        }
    }
}
