//! Protocol data model and the event-kind registry.
//!
//! An [`Event`] is an immutable, signed, content-addressed record. An
//! [`Envelope`] is the mutable wrapper one event wears on its way through the
//! pipeline. Each event kind registers four operations (command, validate,
//! project, reflect) plus its projection DDL; the registry is a static table
//! populated at process init and dispatched by name.

pub mod ctx;
pub mod envelope;
pub mod event;
pub mod kinds;
pub mod registry;
pub mod wire;

use thiserror::Error;

pub use ctx::{CommandCtx, Ctx, ReadCtx};
pub use envelope::{
    placeholder, resolve_placeholders, BlockKind, BlockReason, DropReason, Envelope,
    EnvelopeOrigin, EnvelopeState, SignerSpec, Validation,
};
pub use event::Event;
pub use registry::{registry, EventKind, Registry};

/// Result type for the protocol layer.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// `submit_command` named a kind that exists but takes no command.
    #[error("event kind {0} has no command")]
    NoCommand(&'static str),

    /// A name that is not in the registry.
    #[error("unknown event kind: {0}")]
    UnknownKind(String),

    /// Command parameters failed to parse or validate.
    #[error("invalid parameters: {0}")]
    BadParams(String),

    /// The local store lacks something the operation needs (identity, key,
    /// referenced row). Deterministic, not a blocking condition.
    #[error("missing context: {0}")]
    MissingContext(String),

    /// An event or wire structure failed to parse.
    #[error("malformed: {0}")]
    Malformed(String),

    #[error(transparent)]
    Crypto(#[from] quiet_crypto::CryptoError),

    #[error(transparent)]
    Storage(#[from] quiet_store::StorageError),
}

impl ProtocolError {
    pub fn bad_params(msg: impl Into<String>) -> Self {
        Self::BadParams(msg.into())
    }

    pub fn missing(msg: impl Into<String>) -> Self {
        Self::MissingContext(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

/// Map an sqlx error raised inside kind SQL into the protocol error space.
pub(crate) fn db_err(operation: &'static str) -> impl Fn(sqlx::Error) -> ProtocolError {
    move |e| ProtocolError::Storage(quiet_store::map_sqlx_error(operation, e))
}
