//! Key distribution: group keys, sealed key delivery, transit secrets.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::{Row, SqliteConnection};

use quiet_core::{EventId, KeyId};
use quiet_crypto::{open_sealed, seal_to, Keypair, PublicKey, SealPublicKey, SymmetricKey};

use crate::ctx::{CommandCtx, ReadCtx};
use crate::envelope::{BlockReason, Envelope, SignerSpec, Validation};
use crate::event::Event;
use crate::kinds::common::{parse_params, parse_payload, require_member};
use crate::registry::EventKind;
use crate::{db_err, ProtocolError, ProtocolResult};

pub fn encode_sealed(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_sealed(s: &str) -> ProtocolResult<Vec<u8>> {
    STANDARD
        .decode(s)
        .map_err(|e| ProtocolError::malformed(format!("sealed blob: {e}")))
}

fn key_id_from(payload_field: &str) -> ProtocolResult<KeyId> {
    payload_field
        .parse()
        .map_err(|e: quiet_core::CoreError| ProtocolError::malformed(e.to_string()))
}

/// Announces a group key's existence. The secret never rides here (it
/// arrives via `sealed_key`), so this projector only anchors the key to its
/// group.
pub struct KeyKind;

#[derive(Debug, Deserialize)]
struct KeyPayload {
    network_id: EventId,
    group_id: EventId,
    key_id: String,
    created_at_ms: i64,
}

#[async_trait]
impl EventKind for KeyKind {
    fn name(&self) -> &'static str {
        "key"
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        &[r#"
        CREATE TABLE IF NOT EXISTS group_keys (
            key_id        BLOB PRIMARY KEY,
            group_id      BLOB,
            network_id    BLOB,
            secret        BLOB,
            event_id      BLOB,
            created_at_ms INTEGER NOT NULL
        )
        "#]
    }

    fn deps(&self, payload: &JsonValue) -> Vec<EventId> {
        payload
            .get("group_id")
            .and_then(JsonValue::as_str)
            .and_then(|s| s.parse().ok())
            .into_iter()
            .collect()
    }

    fn unblock_keys(&self, event: &Event) -> Vec<BlockReason> {
        match parse_payload::<KeyPayload>(event) {
            Ok(p) => key_id_from(&p.key_id)
                .map(|id| vec![BlockReason::missing_key(id)])
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        let p: KeyPayload = match parse_payload(event) {
            Ok(p) => p,
            Err(e) => return Ok(Validation::Invalid(e.to_string())),
        };
        if key_id_from(&p.key_id).is_err() {
            return Ok(Validation::Invalid("bad key_id".into()));
        }
        require_member(ctx, p.network_id, &event.signer).await
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: KeyPayload = parse_payload(event)?;
        let key_id = key_id_from(&p.key_id)?;
        // Anchor group/network/event metadata; never touch the secret.
        sqlx::query(
            "INSERT INTO group_keys \
             (key_id, group_id, network_id, secret, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, NULL, ?4, ?5) \
             ON CONFLICT(key_id) DO UPDATE SET \
                 group_id = excluded.group_id, \
                 network_id = excluded.network_id, \
                 event_id = excluded.event_id",
        )
        .bind(&key_id.as_bytes()[..])
        .bind(&p.group_id.as_bytes()[..])
        .bind(&p.network_id.as_bytes()[..])
        .bind(&event.event_id()?.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project key"))?;
        Ok(())
    }
}

/// A group key sealed to one recipient. When the recipient is a local
/// identity, projection opens the box and fills the group key's secret.
pub struct SealedKeyKind;

#[derive(Debug, Deserialize)]
struct SealedKeyPayload {
    network_id: EventId,
    key_id: String,
    recipient_seal_pubkey: SealPublicKey,
    sealed: String,
    created_at_ms: i64,
}

#[async_trait]
impl EventKind for SealedKeyKind {
    fn name(&self) -> &'static str {
        "sealed_key"
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        &[r#"
        CREATE TABLE IF NOT EXISTS sealed_keys (
            key_id                BLOB NOT NULL,
            recipient_seal_pubkey BLOB NOT NULL,
            sealed                BLOB NOT NULL,
            network_id            BLOB NOT NULL,
            event_id              BLOB NOT NULL,
            created_at_ms         INTEGER NOT NULL,
            PRIMARY KEY (key_id, recipient_seal_pubkey)
        )
        "#]
    }

    fn unblock_keys(&self, event: &Event) -> Vec<BlockReason> {
        // A parked ciphertext may now be decryptable.
        match parse_payload::<SealedKeyPayload>(event) {
            Ok(p) => key_id_from(&p.key_id)
                .map(|id| vec![BlockReason::missing_key(id)])
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        let p: SealedKeyPayload = match parse_payload(event) {
            Ok(p) => p,
            Err(e) => return Ok(Validation::Invalid(e.to_string())),
        };
        if key_id_from(&p.key_id).is_err() || decode_sealed(&p.sealed).is_err() {
            return Ok(Validation::Invalid("bad sealed key payload".into()));
        }
        require_member(ctx, p.network_id, &event.signer).await
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: SealedKeyPayload = parse_payload(event)?;
        let key_id = key_id_from(&p.key_id)?;
        let sealed = decode_sealed(&p.sealed)?;

        sqlx::query(
            "INSERT OR IGNORE INTO sealed_keys \
             (key_id, recipient_seal_pubkey, sealed, network_id, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&key_id.as_bytes()[..])
        .bind(&p.recipient_seal_pubkey.as_bytes()[..])
        .bind(&sealed[..])
        .bind(&p.network_id.as_bytes()[..])
        .bind(&event.event_id()?.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project sealed key"))?;

        // If the box targets one of our identities, open it and learn the
        // group key. The key id doubles as an integrity check.
        let identity = sqlx::query(
            "SELECT secret FROM identities WHERE seal_pubkey = ?1 AND secret IS NOT NULL",
        )
        .bind(&p.recipient_seal_pubkey.as_bytes()[..])
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("find sealing identity"))?;

        if let Some(row) = identity {
            let keypair = Keypair::from_secret_bytes(&row.get::<Vec<u8>, _>("secret"))?;
            match open_sealed(&keypair, &sealed) {
                Ok(secret_bytes) => {
                    let secret = SymmetricKey::from_slice(&secret_bytes)?;
                    if secret.id() == key_id {
                        sqlx::query(
                            "INSERT INTO group_keys \
                             (key_id, group_id, network_id, secret, event_id, created_at_ms) \
                             VALUES (?1, NULL, ?2, ?3, NULL, ?4) \
                             ON CONFLICT(key_id) DO UPDATE SET \
                                 secret = COALESCE(group_keys.secret, excluded.secret)",
                        )
                        .bind(&key_id.as_bytes()[..])
                        .bind(&p.network_id.as_bytes()[..])
                        .bind(&secret.as_bytes()[..])
                        .bind(p.created_at_ms)
                        .execute(&mut *conn)
                        .await
                        .map_err(db_err("store unsealed group key"))?;
                    } else {
                        tracing::warn!(key_id = %key_id, "sealed key id mismatch, ignoring");
                    }
                }
                Err(e) => {
                    // Sealed to our key but undecipherable: log and move on.
                    tracing::warn!(error = %e, "failed to open sealed key");
                }
            }
        }
        Ok(())
    }
}

/// Establishes a durable transit key with one peer: the secret rides sealed
/// to the recipient inside the payload.
pub struct TransitSecretKind;

#[derive(Debug, Deserialize)]
struct TransitSecretPayload {
    network_id: EventId,
    peer_pubkey: PublicKey,
    transit_key_id: String,
    sealed: String,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct CreateTransitSecretParams {
    network_id: EventId,
    peer: PublicKey,
}

#[async_trait]
impl EventKind for TransitSecretKind {
    fn name(&self) -> &'static str {
        "transit_secret"
    }

    fn command_name(&self) -> Option<&'static str> {
        Some("create_transit_secret")
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        &[r#"
        CREATE TABLE IF NOT EXISTS transit_keys (
            key_id        BLOB PRIMARY KEY,
            secret        BLOB,
            peer_pubkey   BLOB,
            network_id    BLOB,
            event_id      BLOB,
            created_at_ms INTEGER NOT NULL
        )
        "#]
    }

    fn deps(&self, payload: &JsonValue) -> Vec<EventId> {
        payload
            .get("network_id")
            .and_then(JsonValue::as_str)
            .and_then(|s| s.parse().ok())
            .into_iter()
            .collect()
    }

    async fn command(
        &self,
        params: JsonValue,
        ctx: &mut CommandCtx<'_>,
    ) -> ProtocolResult<Vec<Envelope>> {
        let params: CreateTransitSecretParams = parse_params(params)?;
        let signer = ctx
            .identity_for_network(params.network_id)
            .await?
            .ok_or_else(|| ProtocolError::missing("no identity for network"))?;
        let now = ctx.now_ms();

        let peer = sqlx::query(
            "SELECT seal_pubkey FROM peers \
             WHERE network_id = ?1 AND pubkey = ?2 AND seal_pubkey IS NOT NULL",
        )
        .bind(&params.network_id.as_bytes()[..])
        .bind(&params.peer.as_bytes()[..])
        .fetch_optional(ctx.conn())
        .await
        .map_err(db_err("fetch peer seal key"))?
        .ok_or_else(|| ProtocolError::missing("peer has no seal key"))?;
        let seal = SealPublicKey::from_slice(&peer.get::<Vec<u8>, _>("seal_pubkey"))?;

        let transit = SymmetricKey::generate();
        let sealed = seal_to(&seal, transit.as_bytes())?;

        // Our own copy, usable immediately for outbound datagrams.
        sqlx::query(
            "INSERT OR IGNORE INTO transit_keys \
             (key_id, secret, peer_pubkey, network_id, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
        )
        .bind(&transit.id().as_bytes()[..])
        .bind(&transit.as_bytes()[..])
        .bind(&params.peer.as_bytes()[..])
        .bind(&params.network_id.as_bytes()[..])
        .bind(now)
        .execute(ctx.conn())
        .await
        .map_err(db_err("insert transit key"))?;

        Ok(vec![Envelope::local(
            "transit_secret",
            json!({
                "network_id": params.network_id,
                "peer_pubkey": params.peer,
                "transit_key_id": transit.id(),
                "sealed": encode_sealed(&sealed),
                "created_at_ms": now,
            }),
            SignerSpec::Identity(signer),
        )
        .outgoing_to(params.peer)])
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        let p: TransitSecretPayload = match parse_payload(event) {
            Ok(p) => p,
            Err(e) => return Ok(Validation::Invalid(e.to_string())),
        };
        if key_id_from(&p.transit_key_id).is_err() || decode_sealed(&p.sealed).is_err() {
            return Ok(Validation::Invalid("bad transit secret payload".into()));
        }
        require_member(ctx, p.network_id, &event.signer).await
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: TransitSecretPayload = parse_payload(event)?;
        let key_id = key_id_from(&p.transit_key_id)?;
        let sealed = decode_sealed(&p.sealed)?;

        // Only the addressed recipient can recover the secret; everyone else
        // records nothing. The sender stored its copy at command time.
        let identity = sqlx::query(
            "SELECT secret FROM identities WHERE pubkey = ?1 AND secret IS NOT NULL",
        )
        .bind(&p.peer_pubkey.as_bytes()[..])
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("find recipient identity"))?;

        if let Some(row) = identity {
            let keypair = Keypair::from_secret_bytes(&row.get::<Vec<u8>, _>("secret"))?;
            match open_sealed(&keypair, &sealed) {
                Ok(secret_bytes) => {
                    let secret = SymmetricKey::from_slice(&secret_bytes)?;
                    if secret.id() == key_id {
                        sqlx::query(
                            "INSERT OR IGNORE INTO transit_keys \
                             (key_id, secret, peer_pubkey, network_id, event_id, created_at_ms) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        )
                        .bind(&key_id.as_bytes()[..])
                        .bind(&secret.as_bytes()[..])
                        .bind(&event.signer.as_bytes()[..])
                        .bind(&p.network_id.as_bytes()[..])
                        .bind(&event.event_id()?.as_bytes()[..])
                        .bind(p.created_at_ms)
                        .execute(&mut *conn)
                        .await
                        .map_err(db_err("store transit key"))?;
                    } else {
                        tracing::warn!(key_id = %key_id, "transit key id mismatch, ignoring");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open transit secret");
                }
            }
        }
        Ok(())
    }
}
