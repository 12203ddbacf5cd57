//! Helpers shared by kind implementations.

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use quiet_core::EventId;
use quiet_crypto::PublicKey;

use crate::ctx::ReadCtx;
use crate::envelope::{BlockReason, Validation};
use crate::event::Event;
use crate::{ProtocolError, ProtocolResult};

/// Parse a typed payload out of an event. Failures are malformed, not
/// blockable: the bytes are signed, so a bad shape never improves.
pub fn parse_payload<T: DeserializeOwned>(event: &Event) -> ProtocolResult<T> {
    serde_json::from_value(event.payload.clone())
        .map_err(|e| ProtocolError::malformed(format!("{} payload: {e}", event.event_type)))
}

/// Parse command parameters.
pub fn parse_params<T: DeserializeOwned>(params: JsonValue) -> ProtocolResult<T> {
    serde_json::from_value(params).map_err(|e| ProtocolError::bad_params(e.to_string()))
}

/// The uniform membership predicate: the signer must have a user row in the
/// network. Unknown signers park until the user (or network) event arrives.
pub async fn require_member(
    ctx: &mut ReadCtx<'_>,
    network_id: EventId,
    signer: &PublicKey,
) -> ProtocolResult<Validation> {
    if ctx.signer_is_member(network_id, signer).await? {
        Ok(Validation::Valid)
    } else {
        Ok(Validation::Blocked(BlockReason::unknown_signer(signer)))
    }
}

