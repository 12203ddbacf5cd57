//! The event-kind registry.
//!
//! One entry per event type: command, validate, project, reflect, plus the
//! projection DDL and dispatch flags. The table is static, built once at
//! process init with indexed dispatch, replacing any notion of
//! runtime registration.

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::SqliteConnection;

use quiet_core::EventId;

use crate::ctx::{CommandCtx, ReadCtx};
use crate::envelope::{BlockReason, Envelope, Validation};
use crate::event::Event;
use crate::kinds;
use crate::{ProtocolError, ProtocolResult};

/// One event type's operations and metadata.
#[async_trait]
pub trait EventKind: Send + Sync {
    /// Discriminator stored in `events.event_type`.
    fn name(&self) -> &'static str;

    /// The `submit_command` name this kind answers to, if any.
    fn command_name(&self) -> Option<&'static str> {
        None
    }

    /// Projection DDL owned by this kind. Applied at store open.
    fn projection_schema(&self) -> &'static [&'static str] {
        &[]
    }

    /// Local-only events never enter `events` and never leave the node.
    fn local_only(&self) -> bool {
        false
    }

    /// Ephemeral events are validated and reflected but neither stored nor
    /// projected (sync control traffic).
    fn ephemeral(&self) -> bool {
        false
    }

    /// Event ids this payload requires to exist before validation passes.
    fn deps(&self, _payload: &JsonValue) -> Vec<EventId> {
        Vec::new()
    }

    /// Blocked-queue partitions this event resolves once projected, beyond
    /// the implicit `missing_dep:<own id>`.
    fn unblock_keys(&self, _event: &Event) -> Vec<BlockReason> {
        Vec::new()
    }

    /// Build envelopes for a local command.
    async fn command(
        &self,
        _params: JsonValue,
        _ctx: &mut CommandCtx<'_>,
    ) -> ProtocolResult<Vec<Envelope>> {
        Err(ProtocolError::NoCommand(self.name()))
    }

    /// Type-specific validation against a read-only snapshot. The pipeline
    /// has already verified the signature, checked `deps`, and rejected
    /// removed signers before this runs.
    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation>;

    /// Apply projection deltas inside the current transaction. Must be
    /// idempotent: re-applying a projected event is a no-op.
    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()>;

    /// Generate response envelopes for an incoming event.
    async fn reflect(
        &self,
        _event: &Event,
        _ctx: &mut ReadCtx<'_>,
    ) -> ProtocolResult<Vec<Envelope>> {
        Ok(Vec::new())
    }
}

static NETWORK: kinds::network::NetworkKind = kinds::network::NetworkKind;
static PEER: kinds::network::PeerKind = kinds::network::PeerKind;
static ADDRESS: kinds::network::AddressKind = kinds::network::AddressKind;
static REMOVE_PEER: kinds::network::RemovePeerKind = kinds::network::RemovePeerKind;
static IDENTITY: kinds::identity::IdentityKind = kinds::identity::IdentityKind;
static USER: kinds::identity::UserKind = kinds::identity::UserKind;
static INVITE: kinds::invite::InviteKind = kinds::invite::InviteKind;
static LINK_INVITE: kinds::invite::LinkInviteKind = kinds::invite::LinkInviteKind;
static GROUP: kinds::group::GroupKind = kinds::group::GroupKind;
static GROUP_MEMBER: kinds::group::GroupMemberKind = kinds::group::GroupMemberKind;
static CHANNEL: kinds::group::ChannelKind = kinds::group::ChannelKind;
static MESSAGE: kinds::group::MessageKind = kinds::group::MessageKind;
static KEY: kinds::keys::KeyKind = kinds::keys::KeyKind;
static SEALED_KEY: kinds::keys::SealedKeyKind = kinds::keys::SealedKeyKind;
static TRANSIT_SECRET: kinds::keys::TransitSecretKind = kinds::keys::TransitSecretKind;
static SYNC_REQUEST: kinds::sync::SyncRequestKind = kinds::sync::SyncRequestKind;
static SYNC_RESPONSE: kinds::sync::SyncResponseKind = kinds::sync::SyncResponseKind;
static BLOB: kinds::blob::BlobKind = kinds::blob::BlobKind;
static BLOB_SLICE: kinds::blob::BlobSliceKind = kinds::blob::BlobSliceKind;

static KINDS: &[&dyn EventKind] = &[
    &NETWORK,
    &IDENTITY,
    &PEER,
    &USER,
    &LINK_INVITE,
    &INVITE,
    &GROUP,
    &GROUP_MEMBER,
    &CHANNEL,
    &MESSAGE,
    &ADDRESS,
    &KEY,
    &SEALED_KEY,
    &TRANSIT_SECRET,
    &SYNC_REQUEST,
    &SYNC_RESPONSE,
    &REMOVE_PEER,
    &BLOB,
    &BLOB_SLICE,
];

/// The process-wide kind table. Immutable after init.
pub struct Registry {
    kinds: &'static [&'static dyn EventKind],
    by_name: HashMap<&'static str, &'static dyn EventKind>,
    by_command: HashMap<&'static str, &'static dyn EventKind>,
}

impl Registry {
    fn build() -> Self {
        let mut by_name = HashMap::with_capacity(KINDS.len());
        let mut by_command = HashMap::new();
        for kind in KINDS {
            by_name.insert(kind.name(), *kind);
            if let Some(command) = kind.command_name() {
                by_command.insert(command, *kind);
            }
        }
        Self {
            kinds: KINDS,
            by_name,
            by_command,
        }
    }

    pub fn kind(&self, name: &str) -> ProtocolResult<&'static dyn EventKind> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| ProtocolError::UnknownKind(name.to_string()))
    }

    pub fn kind_for_command(&self, command: &str) -> ProtocolResult<&'static dyn EventKind> {
        self.by_command
            .get(command)
            .copied()
            .ok_or_else(|| ProtocolError::UnknownKind(command.to_string()))
    }

    pub fn kinds(&self) -> &'static [&'static dyn EventKind] {
        self.kinds
    }

    /// All projection DDL, in registry order.
    pub fn projection_ddl(&self) -> Vec<&'static str> {
        self.kinds
            .iter()
            .flat_map(|k| k.projection_schema().iter().copied())
            .collect()
    }
}

/// The registry singleton.
pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::build)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_is_resolvable_by_name() {
        let reg = registry();
        assert_eq!(reg.kinds().len(), 19);
        for kind in reg.kinds() {
            assert_eq!(reg.kind(kind.name()).unwrap().name(), kind.name());
        }
    }

    #[test]
    fn commands_dispatch_to_their_kinds() {
        let reg = registry();
        assert_eq!(reg.kind_for_command("create_network").unwrap().name(), "network");
        assert_eq!(reg.kind_for_command("create_message").unwrap().name(), "message");
        assert_eq!(reg.kind_for_command("join_as_user").unwrap().name(), "user");
        assert!(reg.kind_for_command("no_such_command").is_err());
    }

    #[test]
    fn flags_are_consistent() {
        let reg = registry();
        assert!(reg.kind("identity").unwrap().local_only());
        assert!(reg.kind("sync_request").unwrap().ephemeral());
        assert!(reg.kind("sync_response").unwrap().ephemeral());
        assert!(!reg.kind("message").unwrap().ephemeral());
    }

    #[test]
    fn projection_ddl_covers_every_table() {
        let ddl = registry().projection_ddl();
        for table in [
            "networks", "identities", "peers", "users", "groups", "group_members",
            "channels", "messages", "invites", "addresses", "group_keys",
            "sealed_keys", "removed_peers", "transit_keys", "blobs", "blob_slices",
        ] {
            assert!(
                ddl.iter().any(|stmt| stmt.contains(table)),
                "no DDL mentions {table}"
            );
        }
    }
}
