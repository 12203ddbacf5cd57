//! Local identities and network membership via invite proof.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::SqliteConnection;

use quiet_core::EventId;
use quiet_crypto::{derive_keypair, derive_symmetric_key, Keypair, PublicKey, SealPublicKey};

use crate::ctx::{CommandCtx, ReadCtx};
use crate::envelope::{BlockReason, Envelope, SignerSpec, Validation};
use crate::event::Event;
use crate::kinds::common::{parse_params, parse_payload};
use crate::registry::EventKind;
use crate::wire::{InviteLink, INVITE_KDF_INFO, INVITE_TRANSIT_KDF_INFO};
use crate::{db_err, ProtocolResult};

/// A local-only identity. Never stored in `events`, never leaves the node;
/// the private key lives exclusively in the `identities` table.
pub struct IdentityKind;

#[derive(Debug, Deserialize)]
struct IdentityPayload {
    name: String,
    pubkey: PublicKey,
    seal_pubkey: SealPublicKey,
    network_id: Option<EventId>,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct CreateIdentityParams {
    name: String,
    network_id: Option<EventId>,
}

#[async_trait]
impl EventKind for IdentityKind {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn command_name(&self) -> Option<&'static str> {
        Some("create_identity")
    }

    fn local_only(&self) -> bool {
        true
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        &[r#"
        CREATE TABLE IF NOT EXISTS identities (
            pubkey        BLOB PRIMARY KEY,
            network_id    BLOB,
            name          TEXT NOT NULL,
            secret        BLOB,
            seal_pubkey   BLOB NOT NULL,
            created_at_ms INTEGER NOT NULL
        )
        "#]
    }

    async fn command(
        &self,
        params: JsonValue,
        ctx: &mut CommandCtx<'_>,
    ) -> ProtocolResult<Vec<Envelope>> {
        let params: CreateIdentityParams = parse_params(params)?;
        let keypair = Keypair::generate();
        let seal = keypair.seal_public()?;
        let now = ctx.now_ms();

        sqlx::query(
            "INSERT INTO identities (pubkey, network_id, name, secret, seal_pubkey, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(pubkey) DO UPDATE SET secret = excluded.secret",
        )
        .bind(&keypair.public().as_bytes()[..])
        .bind(params.network_id.as_ref().map(|id| id.as_bytes().to_vec()))
        .bind(&params.name)
        .bind(&keypair.secret_bytes()[..])
        .bind(&seal.as_bytes()[..])
        .bind(now)
        .execute(ctx.conn())
        .await
        .map_err(db_err("insert identity"))?;

        Ok(vec![Envelope::local(
            "identity",
            json!({
                "name": params.name,
                "pubkey": keypair.public(),
                "seal_pubkey": seal,
                "network_id": params.network_id,
                "created_at_ms": now,
            }),
            SignerSpec::Identity(keypair.public()),
        )])
    }

    async fn validate(&self, event: &Event, _ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        match parse_payload::<IdentityPayload>(event) {
            Ok(p) if p.pubkey == event.signer => Ok(Validation::Valid),
            Ok(_) => Ok(Validation::Invalid("identity must be self-signed".into())),
            Err(e) => Ok(Validation::Invalid(e.to_string())),
        }
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: IdentityPayload = parse_payload(event)?;
        // The command already wrote the secret; this fills the row when the
        // projector runs first (it never overwrites the secret).
        sqlx::query(
            "INSERT OR IGNORE INTO identities \
             (pubkey, network_id, name, secret, seal_pubkey, created_at_ms) \
             VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
        )
        .bind(&p.pubkey.as_bytes()[..])
        .bind(p.network_id.as_ref().map(|id| id.as_bytes().to_vec()))
        .bind(&p.name)
        .bind(&p.seal_pubkey.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project identity"))?;
        Ok(())
    }
}

/// A user joining a network. The event is signed with the keypair derived
/// from the invite secret, proving possession of the link; the payload
/// carries the user's real identity key.
pub struct UserKind;

#[derive(Debug, Deserialize)]
struct UserPayload {
    network_id: EventId,
    group_id: EventId,
    name: String,
    pubkey: PublicKey,
    seal_pubkey: SealPublicKey,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct JoinParams {
    invite_code: String,
    name: String,
}

#[async_trait]
impl EventKind for UserKind {
    fn name(&self) -> &'static str {
        "user"
    }

    fn command_name(&self) -> Option<&'static str> {
        Some("join_as_user")
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        &[r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id       BLOB PRIMARY KEY,
            network_id    BLOB NOT NULL,
            name          TEXT NOT NULL,
            pubkey        BLOB NOT NULL,
            seal_pubkey   BLOB,
            event_id      BLOB NOT NULL,
            created_at_ms INTEGER NOT NULL
        )
        "#]
    }

    fn deps(&self, payload: &JsonValue) -> Vec<EventId> {
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

    fn unblock_keys(&self, event: &Event) -> Vec<BlockReason> {
        // The joined identity key becomes a valid signer.
        match parse_payload::<UserPayload>(event) {
            Ok(p) => vec![BlockReason::unknown_signer(&p.pubkey)],
            Err(_) => Vec::new(),
        }
    }

    async fn command(
        &self,
        params: JsonValue,
        ctx: &mut CommandCtx<'_>,
    ) -> ProtocolResult<Vec<Envelope>> {
        let params: JoinParams = parse_params(params)?;
        let link = InviteLink::parse(&params.invite_code)?;
        let keypair = Keypair::generate();
        let seal = keypair.seal_public()?;
        let now = ctx.now_ms();

        sqlx::query(
            "INSERT INTO identities (pubkey, network_id, name, secret, seal_pubkey, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(pubkey) DO UPDATE SET secret = excluded.secret",
        )
        .bind(&keypair.public().as_bytes()[..])
        .bind(&link.network_id.as_bytes()[..])
        .bind(&params.name)
        .bind(&keypair.secret_bytes()[..])
        .bind(&seal.as_bytes()[..])
        .bind(now)
        .execute(ctx.conn())
        .await
        .map_err(db_err("insert identity"))?;

        // Both ends of the link can derive this transit key, so the first
        // datagrams flow before any transit_secret exchange.
        let invite_keypair = derive_keypair(&link.secret, INVITE_KDF_INFO)?;
        let transit = derive_symmetric_key(&link.secret, INVITE_TRANSIT_KDF_INFO)?;
        sqlx::query(
            "INSERT OR IGNORE INTO transit_keys \
             (key_id, secret, peer_pubkey, network_id, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
        )
        .bind(&transit.id().as_bytes()[..])
        .bind(&transit.as_bytes()[..])
        .bind(&invite_keypair.public().as_bytes()[..])
        .bind(&link.network_id.as_bytes()[..])
        .bind(now)
        .execute(ctx.conn())
        .await
        .map_err(db_err("insert invite transit key"))?;

        Ok(vec![Envelope::local(
            "user",
            json!({
                "network_id": link.network_id,
                "group_id": link.group_id,
                "name": params.name,
                "pubkey": keypair.public(),
                "seal_pubkey": seal,
                "created_at_ms": now,
            }),
            SignerSpec::InviteSecret(link.secret),
        )
        .broadcast()])
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        let p: UserPayload = match parse_payload(event) {
            Ok(p) => p,
            Err(e) => return Ok(Validation::Invalid(e.to_string())),
        };
        // The signer is the invite proof key; it must match a known invite.
        if ctx.invite_exists(p.network_id, &event.signer).await? {
            Ok(Validation::Valid)
        } else {
            Ok(Validation::Blocked(BlockReason::unknown_signer(&event.signer)))
        }
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: UserPayload = parse_payload(event)?;
        let id = event.event_id()?;
        let id_bytes = &id.as_bytes()[..];

        sqlx::query(
            "INSERT OR IGNORE INTO users \
             (user_id, network_id, name, pubkey, seal_pubkey, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?1, ?6)",
        )
        .bind(id_bytes)
        .bind(&p.network_id.as_bytes()[..])
        .bind(&p.name)
        .bind(&p.pubkey.as_bytes()[..])
        .bind(&p.seal_pubkey.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project user"))?;

        sqlx::query(
            "INSERT OR IGNORE INTO peers \
             (pubkey, network_id, seal_pubkey, event_id, created_at_ms, last_synced_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        )
        .bind(&p.pubkey.as_bytes()[..])
        .bind(&p.network_id.as_bytes()[..])
        .bind(&p.seal_pubkey.as_bytes()[..])
        .bind(id_bytes)
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project user peer"))?;

        sqlx::query(
            "INSERT OR IGNORE INTO group_members \
             (group_id, user_id, network_id, added_by, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?2, ?5)",
        )
        .bind(&p.group_id.as_bytes()[..])
        .bind(id_bytes)
        .bind(&p.network_id.as_bytes()[..])
        .bind(&event.signer.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project invited membership"))?;

        Ok(())
    }
}
