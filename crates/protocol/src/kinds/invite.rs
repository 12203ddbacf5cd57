//! Invites: the cryptographic admission path into a network.
//!
//! `create_invite` mints a random secret, derives the invite proof keypair
//! and the bootstrap transit key from it, and announces the proof public key
//! in an `invite` (group-scoped) or `link_invite` (network-scoped) event.
//! The secret itself stays local; it only travels inside the
//! `quiet://invite/…` link the inviter hands out.

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::SqliteConnection;

use quiet_core::EventId;
use quiet_crypto::{derive_keypair, derive_symmetric_key, PublicKey};

use crate::ctx::{CommandCtx, ReadCtx};
use crate::envelope::{BlockReason, Envelope, SignerSpec, Validation};
use crate::event::Event;
use crate::kinds::common::{parse_params, parse_payload, require_member};
use crate::registry::EventKind;
use crate::wire::{INVITE_KDF_INFO, INVITE_SECRET_LEN, INVITE_TRANSIT_KDF_INFO};
use crate::{db_err, ProtocolError, ProtocolResult};

#[derive(Debug, Deserialize)]
struct InvitePayload {
    network_id: EventId,
    group_id: EventId,
    invite_pubkey: PublicKey,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct CreateInviteParams {
    network_id: EventId,
    group_id: Option<EventId>,
}

const INVITES_SCHEMA: &[&str] = &[r#"
CREATE TABLE IF NOT EXISTS invites (
    invite_pubkey  BLOB PRIMARY KEY,
    network_id     BLOB NOT NULL,
    group_id       BLOB NOT NULL,
    scope          TEXT NOT NULL,
    creator_pubkey BLOB NOT NULL,
    secret         BLOB,
    event_id       BLOB,
    created_at_ms  INTEGER NOT NULL
)
"#];

fn invite_deps(payload: &JsonValue) -> Vec<EventId> {
    let mut deps: Vec<EventId> = Vec::new();
    for field in ["network_id", "group_id"] {
        if let Some(id) = payload
            .get(field)
            .and_then(JsonValue::as_str)
            .and_then(|s| s.parse().ok())
        {
            if !deps.contains(&id) {
                deps.push(id);
            }
        }
    }
    deps
}

fn invite_unblock_keys(event: &Event) -> Vec<BlockReason> {
    // Join proofs signed with this invite key become verifiable.
    match parse_payload::<InvitePayload>(event) {
        Ok(p) => vec![BlockReason::unknown_signer(&p.invite_pubkey)],
        Err(_) => Vec::new(),
    }
}

async fn validate_invite(event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
    let p: InvitePayload = match parse_payload(event) {
        Ok(p) => p,
        Err(e) => return Ok(Validation::Invalid(e.to_string())),
    };
    require_member(ctx, p.network_id, &event.signer).await
}

async fn project_invite(
    event: &Event,
    conn: &mut SqliteConnection,
    scope: &str,
) -> ProtocolResult<()> {
    let p: InvitePayload = parse_payload(event)?;
    sqlx::query(
        "INSERT INTO invites \
         (invite_pubkey, network_id, group_id, scope, creator_pubkey, secret, event_id, created_at_ms) \
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7) \
         ON CONFLICT(invite_pubkey) DO UPDATE SET event_id = excluded.event_id",
    )
    .bind(&p.invite_pubkey.as_bytes()[..])
    .bind(&p.network_id.as_bytes()[..])
    .bind(&p.group_id.as_bytes()[..])
    .bind(scope)
    .bind(&event.signer.as_bytes()[..])
    .bind(&event.event_id()?.as_bytes()[..])
    .bind(p.created_at_ms)
    .execute(&mut *conn)
    .await
    .map_err(db_err("project invite"))?;
    Ok(())
}

/// Group-scoped invite (`create_invite` with a `group_id`); without one the
/// same command emits a network-scoped `link_invite` admitting to the
/// default group.
pub struct InviteKind;

#[async_trait]
impl EventKind for InviteKind {
    fn name(&self) -> &'static str {
        "invite"
    }

    fn command_name(&self) -> Option<&'static str> {
        Some("create_invite")
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        INVITES_SCHEMA
    }

    fn deps(&self, payload: &JsonValue) -> Vec<EventId> {
        invite_deps(payload)
    }

    fn unblock_keys(&self, event: &Event) -> Vec<BlockReason> {
        invite_unblock_keys(event)
    }

    async fn command(
        &self,
        params: JsonValue,
        ctx: &mut CommandCtx<'_>,
    ) -> ProtocolResult<Vec<Envelope>> {
        let params: CreateInviteParams = parse_params(params)?;
        let signer = ctx
            .identity_for_network(params.network_id)
            .await?
            .ok_or_else(|| ProtocolError::missing("no identity for network"))?;
        let now = ctx.now_ms();

        // Network scope admits to the default group (group_id == network_id).
        let (event_type, scope, group_id) = match params.group_id {
            Some(group) if group != params.network_id => ("invite", "group", group),
            _ => ("link_invite", "network", params.network_id),
        };

        let mut secret = vec![0u8; INVITE_SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        let invite_keypair = derive_keypair(&secret, INVITE_KDF_INFO)?;
        let invite_pubkey = invite_keypair.public();
        let transit = derive_symmetric_key(&secret, INVITE_TRANSIT_KDF_INFO)?;

        // The secret stays local; `query("invite_link")` rebuilds the link
        // from this row.
        sqlx::query(
            "INSERT INTO invites \
             (invite_pubkey, network_id, group_id, scope, creator_pubkey, secret, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7) \
             ON CONFLICT(invite_pubkey) DO UPDATE SET secret = excluded.secret",
        )
        .bind(&invite_pubkey.as_bytes()[..])
        .bind(&params.network_id.as_bytes()[..])
        .bind(&group_id.as_bytes()[..])
        .bind(scope)
        .bind(&signer.as_bytes()[..])
        .bind(&secret[..])
        .bind(now)
        .execute(ctx.conn())
        .await
        .map_err(db_err("insert invite secret"))?;

        sqlx::query(
            "INSERT OR IGNORE INTO transit_keys \
             (key_id, secret, peer_pubkey, network_id, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
        )
        .bind(&transit.id().as_bytes()[..])
        .bind(&transit.as_bytes()[..])
        .bind(&invite_pubkey.as_bytes()[..])
        .bind(&params.network_id.as_bytes()[..])
        .bind(now)
        .execute(ctx.conn())
        .await
        .map_err(db_err("insert invite transit key"))?;

        Ok(vec![Envelope::local(
            event_type,
            json!({
                "network_id": params.network_id,
                "group_id": group_id,
                "invite_pubkey": invite_pubkey,
                "created_at_ms": now,
            }),
            SignerSpec::Identity(signer),
        )
        .broadcast()])
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        validate_invite(event, ctx).await
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        project_invite(event, conn, "group").await
    }
}

/// Network-scoped invite announced for link joins.
pub struct LinkInviteKind;

#[async_trait]
impl EventKind for LinkInviteKind {
    fn name(&self) -> &'static str {
        "link_invite"
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        // Shares the invites table; the invite kind owns the DDL.
        &[]
    }

    fn deps(&self, payload: &JsonValue) -> Vec<EventId> {
        invite_deps(payload)
    }

    fn unblock_keys(&self, event: &Event) -> Vec<BlockReason> {
        invite_unblock_keys(event)
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        validate_invite(event, ctx).await
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        project_invite(event, conn, "network").await
    }
}
