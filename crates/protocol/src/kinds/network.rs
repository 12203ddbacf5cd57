//! Network lifecycle: creation, peer bookkeeping, addresses, removal.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::SqliteConnection;

use quiet_core::EventId;
use quiet_crypto::{Keypair, PublicKey, SealPublicKey};

use crate::ctx::{CommandCtx, ReadCtx};
use crate::envelope::{BlockReason, Envelope, SignerSpec, Validation};
use crate::event::Event;
use crate::kinds::common::{parse_params, parse_payload, require_member};
use crate::registry::EventKind;
use crate::{db_err, ProtocolError, ProtocolResult};

/// Creates a network and materializes its founder.
///
/// `create_network` emits two envelopes: a local-only identity (holding the
/// founder's keys) and the network event itself. The projector derives the
/// default group, the founder's user and peer rows from the one network
/// event, so the wire carries a single record.
pub struct NetworkKind;

#[derive(Debug, Deserialize)]
struct NetworkPayload {
    name: String,
    username: String,
    seal_pubkey: SealPublicKey,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct CreateNetworkParams {
    name: String,
    #[serde(default = "default_username")]
    username: String,
}

fn default_username() -> String {
    "founder".to_string()
}

#[async_trait]
impl EventKind for NetworkKind {
    fn name(&self) -> &'static str {
        "network"
    }

    fn command_name(&self) -> Option<&'static str> {
        Some("create_network")
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        &[r#"
        CREATE TABLE IF NOT EXISTS networks (
            network_id    BLOB PRIMARY KEY,
            name          TEXT NOT NULL,
            creator_pubkey BLOB NOT NULL,
            event_id      BLOB NOT NULL,
            created_at_ms INTEGER NOT NULL
        )
        "#]
    }

    fn unblock_keys(&self, event: &Event) -> Vec<BlockReason> {
        // The founder becomes a known signer once the network projects.
        vec![BlockReason::unknown_signer(&event.signer)]
    }

    async fn command(
        &self,
        params: JsonValue,
        ctx: &mut CommandCtx<'_>,
    ) -> ProtocolResult<Vec<Envelope>> {
        let params: CreateNetworkParams = parse_params(params)?;
        let keypair = Keypair::generate();
        let seal = keypair.seal_public()?;
        let now = ctx.now_ms();

        // The secret never rides in a payload; it goes straight into the
        // local identities table, inside this same transaction.
        sqlx::query(
            "INSERT INTO identities (pubkey, network_id, name, secret, seal_pubkey, created_at_ms) \
             VALUES (?1, NULL, ?2, ?3, ?4, ?5) \
             ON CONFLICT(pubkey) DO UPDATE SET secret = excluded.secret",
        )
        .bind(&keypair.public().as_bytes()[..])
        .bind(&params.username)
        .bind(&keypair.secret_bytes()[..])
        .bind(&seal.as_bytes()[..])
        .bind(now)
        .execute(ctx.conn())
        .await
        .map_err(db_err("insert identity"))?;

        let identity = Envelope::local(
            "identity",
            json!({
                "name": params.username,
                "pubkey": keypair.public(),
                "seal_pubkey": seal,
                "network_id": JsonValue::Null,
                "created_at_ms": now,
            }),
            SignerSpec::Identity(keypair.public()),
        );

        let network = Envelope::local(
            "network",
            json!({
                "name": params.name,
                "username": params.username,
                "seal_pubkey": seal,
                "created_at_ms": now,
            }),
            SignerSpec::Identity(keypair.public()),
        )
        .broadcast();

        Ok(vec![identity, network])
    }

    async fn validate(&self, event: &Event, _ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        // Network creation is the trust root: no prior membership to check.
        let payload: Result<NetworkPayload, _> = parse_payload(event);
        match payload {
            Ok(p) if !p.name.is_empty() => Ok(Validation::Valid),
            Ok(_) => Ok(Validation::Invalid("network name is empty".into())),
            Err(e) => Ok(Validation::Invalid(e.to_string())),
        }
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: NetworkPayload = parse_payload(event)?;
        let id = event.event_id()?;
        let id_bytes = &id.as_bytes()[..];
        let signer_bytes = &event.signer.as_bytes()[..];

        sqlx::query(
            "INSERT OR IGNORE INTO networks \
             (network_id, name, creator_pubkey, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?1, ?4)",
        )
        .bind(id_bytes)
        .bind(&p.name)
        .bind(signer_bytes)
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project network"))?;

        // Default group: group_id == network_id.
        sqlx::query(
            "INSERT OR IGNORE INTO groups \
             (group_id, network_id, name, creator_id, creator_pubkey, event_id, created_at_ms) \
             VALUES (?1, ?1, ?2, ?1, ?3, ?1, ?4)",
        )
        .bind(id_bytes)
        .bind(&p.name)
        .bind(signer_bytes)
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project default group"))?;

        sqlx::query(
            "INSERT OR IGNORE INTO users \
             (user_id, network_id, name, pubkey, seal_pubkey, event_id, created_at_ms) \
             VALUES (?1, ?1, ?2, ?3, ?4, ?1, ?5)",
        )
        .bind(id_bytes)
        .bind(&p.username)
        .bind(signer_bytes)
        .bind(&p.seal_pubkey.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project founder user"))?;

        sqlx::query(
            "INSERT OR IGNORE INTO peers \
             (pubkey, network_id, seal_pubkey, event_id, created_at_ms, last_synced_ms) \
             VALUES (?1, ?2, ?3, ?2, ?4, 0)",
        )
        .bind(signer_bytes)
        .bind(id_bytes)
        .bind(&p.seal_pubkey.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project founder peer"))?;

        sqlx::query(
            "INSERT OR IGNORE INTO group_members \
             (group_id, user_id, network_id, added_by, event_id, created_at_ms) \
             VALUES (?1, ?1, ?1, ?2, ?1, ?3)",
        )
        .bind(id_bytes)
        .bind(signer_bytes)
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project founder membership"))?;

        // On the founder's own node, attach the identity to its network.
        sqlx::query(
            "UPDATE identities SET network_id = ?1 WHERE pubkey = ?2 AND network_id IS NULL",
        )
        .bind(id_bytes)
        .bind(signer_bytes)
        .execute(&mut *conn)
        .await
        .map_err(db_err("attach identity network"))?;

        Ok(())
    }
}

/// Out-of-band peer bookkeeping: records a known peer of the network.
pub struct PeerKind;

#[derive(Debug, Deserialize)]
struct PeerPayload {
    network_id: EventId,
    pubkey: PublicKey,
    seal_pubkey: SealPublicKey,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct AddPeerParams {
    network_id: EventId,
    pubkey: PublicKey,
    seal_pubkey: SealPublicKey,
}

#[async_trait]
impl EventKind for PeerKind {
    fn name(&self) -> &'static str {
        "peer"
    }

    fn command_name(&self) -> Option<&'static str> {
        Some("add_peer")
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        &[r#"
        CREATE TABLE IF NOT EXISTS peers (
            pubkey         BLOB NOT NULL,
            network_id     BLOB NOT NULL,
            seal_pubkey    BLOB,
            event_id       BLOB NOT NULL,
            created_at_ms  INTEGER NOT NULL,
            last_synced_ms INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (pubkey, network_id)
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
        let params: AddPeerParams = parse_params(params)?;
        let signer = ctx
            .identity_for_network(params.network_id)
            .await?
            .ok_or_else(|| ProtocolError::missing("no identity for network"))?;
        let now = ctx.now_ms();

        Ok(vec![Envelope::local(
            "peer",
            json!({
                "network_id": params.network_id,
                "pubkey": params.pubkey,
                "seal_pubkey": params.seal_pubkey,
                "created_at_ms": now,
            }),
            SignerSpec::Identity(signer),
        )
        .broadcast()])
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        let p: PeerPayload = match parse_payload(event) {
            Ok(p) => p,
            Err(e) => return Ok(Validation::Invalid(e.to_string())),
        };
        require_member(ctx, p.network_id, &event.signer).await
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: PeerPayload = parse_payload(event)?;
        sqlx::query(
            "INSERT OR IGNORE INTO peers \
             (pubkey, network_id, seal_pubkey, event_id, created_at_ms, last_synced_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        )
        .bind(&p.pubkey.as_bytes()[..])
        .bind(&p.network_id.as_bytes()[..])
        .bind(&p.seal_pubkey.as_bytes()[..])
        .bind(&event.event_id()?.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project peer"))?;
        Ok(())
    }
}

/// A peer's announced transport address. Competing updates resolve by the
/// larger `(timestamp, event_id)` pair so every replica converges.
pub struct AddressKind;

#[derive(Debug, Deserialize)]
struct AddressPayload {
    network_id: EventId,
    ip: String,
    port: u16,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct SetAddressParams {
    network_id: EventId,
    ip: String,
    port: u16,
}

#[async_trait]
impl EventKind for AddressKind {
    fn name(&self) -> &'static str {
        "address"
    }

    fn command_name(&self) -> Option<&'static str> {
        Some("set_address")
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        &[r#"
        CREATE TABLE IF NOT EXISTS addresses (
            peer_pubkey   BLOB NOT NULL,
            network_id    BLOB NOT NULL,
            ip            TEXT NOT NULL,
            port          INTEGER NOT NULL,
            event_id      BLOB NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (peer_pubkey, network_id)
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
        let params: SetAddressParams = parse_params(params)?;
        let signer = ctx
            .identity_for_network(params.network_id)
            .await?
            .ok_or_else(|| ProtocolError::missing("no identity for network"))?;
        let now = ctx.now_ms();

        Ok(vec![Envelope::local(
            "address",
            json!({
                "network_id": params.network_id,
                "ip": params.ip,
                "port": params.port,
                "created_at_ms": now,
            }),
            SignerSpec::Identity(signer),
        )
        .broadcast()])
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        let p: AddressPayload = match parse_payload(event) {
            Ok(p) => p,
            Err(e) => return Ok(Validation::Invalid(e.to_string())),
        };
        require_member(ctx, p.network_id, &event.signer).await
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: AddressPayload = parse_payload(event)?;
        // Last-writer-wins; BLOB comparison is memcmp, which matches the
        // lexicographic event-id tie-break.
        sqlx::query(
            "INSERT INTO addresses \
             (peer_pubkey, network_id, ip, port, event_id, updated_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(peer_pubkey, network_id) DO UPDATE SET \
                 ip = excluded.ip, \
                 port = excluded.port, \
                 event_id = excluded.event_id, \
                 updated_at_ms = excluded.updated_at_ms \
             WHERE excluded.updated_at_ms > addresses.updated_at_ms \
                OR (excluded.updated_at_ms = addresses.updated_at_ms \
                    AND excluded.event_id > addresses.event_id)",
        )
        .bind(&event.signer.as_bytes()[..])
        .bind(&p.network_id.as_bytes()[..])
        .bind(&p.ip)
        .bind(p.port as i64)
        .bind(&event.event_id()?.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project address"))?;
        Ok(())
    }
}

/// Removes a peer from the network, retroactively: the tombstone lands and
/// every row the removed signer produced is dropped in the same transaction.
pub struct RemovePeerKind;

#[derive(Debug, Deserialize)]
struct RemovePeerPayload {
    network_id: EventId,
    pubkey: PublicKey,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct RemovePeerParams {
    network_id: EventId,
    pubkey: PublicKey,
}

#[async_trait]
impl EventKind for RemovePeerKind {
    fn name(&self) -> &'static str {
        "remove_peer"
    }

    fn command_name(&self) -> Option<&'static str> {
        Some("remove_peer")
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        &[r#"
        CREATE TABLE IF NOT EXISTS removed_peers (
            pubkey        BLOB NOT NULL,
            network_id    BLOB NOT NULL,
            removed_by    BLOB NOT NULL,
            event_id      BLOB NOT NULL,
            created_at_ms INTEGER NOT NULL,
            PRIMARY KEY (pubkey, network_id)
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
        let params: RemovePeerParams = parse_params(params)?;
        let signer = ctx
            .identity_for_network(params.network_id)
            .await?
            .ok_or_else(|| ProtocolError::missing("no identity for network"))?;
        let now = ctx.now_ms();

        Ok(vec![Envelope::local(
            "remove_peer",
            json!({
                "network_id": params.network_id,
                "pubkey": params.pubkey,
                "created_at_ms": now,
            }),
            SignerSpec::Identity(signer),
        )
        .broadcast()])
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        let p: RemovePeerPayload = match parse_payload(event) {
            Ok(p) => p,
            Err(e) => return Ok(Validation::Invalid(e.to_string())),
        };
        // Only the network creator may remove peers.
        match ctx.network_creator(p.network_id).await? {
            Some(creator) if creator == event.signer => Ok(Validation::Valid),
            Some(_) => Ok(Validation::Invalid("signer is not the network creator".into())),
            None => Ok(Validation::Blocked(BlockReason::missing_dep(p.network_id))),
        }
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: RemovePeerPayload = parse_payload(event)?;
        let net = &p.network_id.as_bytes()[..];
        let gone = &p.pubkey.as_bytes()[..];

        sqlx::query(
            "INSERT OR IGNORE INTO removed_peers \
             (pubkey, network_id, removed_by, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(gone)
        .bind(net)
        .bind(&event.signer.as_bytes()[..])
        .bind(&event.event_id()?.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project removed peer"))?;

        // Retroactive hiding: drop everything the removed signer produced.
        for stmt in [
            "DELETE FROM messages WHERE network_id = ?1 AND sender_pubkey = ?2",
            "DELETE FROM channels WHERE network_id = ?1 AND creator_pubkey = ?2",
            "DELETE FROM blobs WHERE network_id = ?1 AND sender_pubkey = ?2",
            "DELETE FROM addresses WHERE network_id = ?1 AND peer_pubkey = ?2",
            "DELETE FROM invites WHERE network_id = ?1 AND creator_pubkey = ?2",
            "DELETE FROM group_members WHERE network_id = ?1 AND user_id IN \
                 (SELECT user_id FROM users WHERE network_id = ?1 AND pubkey = ?2)",
            "DELETE FROM users WHERE network_id = ?1 AND pubkey = ?2",
            "DELETE FROM peers WHERE network_id = ?1 AND pubkey = ?2",
        ] {
            sqlx::query(stmt)
                .bind(net)
                .bind(gone)
                .execute(&mut *conn)
                .await
                .map_err(db_err("reproject after removal"))?;
        }
        Ok(())
    }
}
