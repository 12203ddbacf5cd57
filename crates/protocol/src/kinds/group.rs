//! Groups, membership, channels, messages.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::{Row, SqliteConnection};

use quiet_core::EventId;
use quiet_crypto::{seal_to, SealPublicKey, SymmetricKey};

use crate::ctx::{CommandCtx, Ctx, ReadCtx};
use crate::envelope::{placeholder, BlockReason, Envelope, SignerSpec, Validation};
use crate::event::Event;
use crate::kinds::common::{parse_params, parse_payload, require_member};
use crate::registry::EventKind;
use crate::{db_err, ProtocolError, ProtocolResult};

fn single_dep(payload: &JsonValue, field: &str) -> Vec<EventId> {
    payload
        .get(field)
        .and_then(JsonValue::as_str)
        .and_then(|s| s.parse().ok())
        .into_iter()
        .collect()
}

/// Membership in a group, via the signer's user row. Non-members park on the
/// group's partition: a later `group_member` projection re-drives them.
async fn require_group_member(
    ctx: &mut Ctx<'_>,
    group_id: EventId,
    signer: &quiet_crypto::PublicKey,
) -> ProtocolResult<Validation> {
    let row = sqlx::query(
        "SELECT 1 FROM group_members gm \
         JOIN users u ON u.user_id = gm.user_id \
         WHERE gm.group_id = ?1 AND u.pubkey = ?2",
    )
    .bind(&group_id.as_bytes()[..])
    .bind(&signer.as_bytes()[..])
    .fetch_optional(ctx.conn())
    .await
    .map_err(db_err("group membership"))?;

    if row.is_some() {
        Ok(Validation::Valid)
    } else {
        Ok(Validation::Blocked(BlockReason::missing_dep(group_id)))
    }
}

/// A group inside a network. `create_group` also mints the group's symmetric
/// key and seals it to every existing member.
pub struct GroupKind;

#[derive(Debug, Deserialize)]
struct GroupPayload {
    network_id: EventId,
    name: String,
    creator_id: EventId,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct CreateGroupParams {
    network_id: EventId,
    name: String,
}

#[async_trait]
impl EventKind for GroupKind {
    fn name(&self) -> &'static str {
        "group"
    }

    fn command_name(&self) -> Option<&'static str> {
        Some("create_group")
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        &[
            r#"
        CREATE TABLE IF NOT EXISTS groups (
            group_id       BLOB PRIMARY KEY,
            network_id     BLOB NOT NULL,
            name           TEXT NOT NULL,
            creator_id     BLOB NOT NULL,
            creator_pubkey BLOB NOT NULL,
            event_id       BLOB NOT NULL,
            created_at_ms  INTEGER NOT NULL
        )
        "#,
            r#"
        CREATE TABLE IF NOT EXISTS group_members (
            group_id      BLOB NOT NULL,
            user_id       BLOB NOT NULL,
            network_id    BLOB NOT NULL,
            added_by      BLOB NOT NULL,
            event_id      BLOB NOT NULL,
            created_at_ms INTEGER NOT NULL,
            PRIMARY KEY (group_id, user_id)
        )
        "#,
        ]
    }

    fn deps(&self, payload: &JsonValue) -> Vec<EventId> {
        single_dep(payload, "network_id")
    }

    async fn command(
        &self,
        params: JsonValue,
        ctx: &mut CommandCtx<'_>,
    ) -> ProtocolResult<Vec<Envelope>> {
        let params: CreateGroupParams = parse_params(params)?;
        let signer = ctx
            .identity_for_network(params.network_id)
            .await?
            .ok_or_else(|| ProtocolError::missing("no identity for network"))?;
        let creator_id = ctx
            .user_id_for_pubkey(params.network_id, &signer)
            .await?
            .ok_or_else(|| ProtocolError::missing("signer has no user row"))?;
        let now = ctx.now_ms();

        // Mint the group key. The secret lands locally now; the key event
        // announces it, sealed_key events carry it to members.
        let group_key = SymmetricKey::generate();
        sqlx::query(
            "INSERT INTO group_keys \
             (key_id, group_id, network_id, secret, event_id, created_at_ms) \
             VALUES (?1, NULL, ?2, ?3, NULL, ?4) \
             ON CONFLICT(key_id) DO UPDATE SET secret = excluded.secret",
        )
        .bind(&group_key.id().as_bytes()[..])
        .bind(&params.network_id.as_bytes()[..])
        .bind(&group_key.as_bytes()[..])
        .bind(now)
        .execute(ctx.conn())
        .await
        .map_err(db_err("insert group key secret"))?;

        let mut envelopes = vec![
            Envelope::local(
                "group",
                json!({
                    "network_id": params.network_id,
                    "name": params.name,
                    "creator_id": creator_id,
                    "created_at_ms": now,
                }),
                SignerSpec::Identity(signer),
            )
            .broadcast(),
            Envelope::local(
                "key",
                json!({
                    "network_id": params.network_id,
                    "group_id": placeholder("group", 0),
                    "key_id": group_key.id(),
                    "created_at_ms": now,
                }),
                SignerSpec::Identity(signer),
            )
            .broadcast(),
        ];

        // Seal the key to every other member up front.
        let rows = sqlx::query(
            "SELECT seal_pubkey FROM users \
             WHERE network_id = ?1 AND pubkey != ?2 AND seal_pubkey IS NOT NULL",
        )
        .bind(&params.network_id.as_bytes()[..])
        .bind(&signer.as_bytes()[..])
        .fetch_all(ctx.conn())
        .await
        .map_err(db_err("list member seal keys"))?;

        for row in rows {
            let seal = SealPublicKey::from_slice(&row.get::<Vec<u8>, _>("seal_pubkey"))?;
            let sealed = seal_to(&seal, group_key.as_bytes())?;
            envelopes.push(
                Envelope::local(
                    "sealed_key",
                    json!({
                        "network_id": params.network_id,
                        "key_id": group_key.id(),
                        "recipient_seal_pubkey": seal,
                        "sealed": crate::kinds::keys::encode_sealed(&sealed),
                        "created_at_ms": now,
                    }),
                    SignerSpec::Identity(signer),
                )
                .broadcast(),
            );
        }

        Ok(envelopes)
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        let p: GroupPayload = match parse_payload(event) {
            Ok(p) => p,
            Err(e) => return Ok(Validation::Invalid(e.to_string())),
        };
        match require_member(ctx, p.network_id, &event.signer).await? {
            Validation::Valid => {}
            other => return Ok(other),
        }
        // The claimed creator must be the signer's own user.
        match ctx.user_id_for_pubkey(p.network_id, &event.signer).await? {
            Some(user_id) if user_id == p.creator_id => Ok(Validation::Valid),
            _ => Ok(Validation::Invalid("creator_id does not match signer".into())),
        }
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: GroupPayload = parse_payload(event)?;
        let id = event.event_id()?;

        sqlx::query(
            "INSERT OR IGNORE INTO groups \
             (group_id, network_id, name, creator_id, creator_pubkey, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?1, ?6)",
        )
        .bind(&id.as_bytes()[..])
        .bind(&p.network_id.as_bytes()[..])
        .bind(&p.name)
        .bind(&p.creator_id.as_bytes()[..])
        .bind(&event.signer.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project group"))?;

        sqlx::query(
            "INSERT OR IGNORE INTO group_members \
             (group_id, user_id, network_id, added_by, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?1, ?5)",
        )
        .bind(&id.as_bytes()[..])
        .bind(&p.creator_id.as_bytes()[..])
        .bind(&p.network_id.as_bytes()[..])
        .bind(&event.signer.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project group creator membership"))?;

        Ok(())
    }
}

/// Adds an existing user to a group, sealing the group key to them.
pub struct GroupMemberKind;

#[derive(Debug, Deserialize)]
struct GroupMemberPayload {
    network_id: EventId,
    group_id: EventId,
    user_id: EventId,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct AddGroupMemberParams {
    group_id: EventId,
    user_id: EventId,
}

#[async_trait]
impl EventKind for GroupMemberKind {
    fn name(&self) -> &'static str {
        "group_member"
    }

    fn command_name(&self) -> Option<&'static str> {
        Some("add_group_member")
    }

    fn deps(&self, payload: &JsonValue) -> Vec<EventId> {
        let mut deps = single_dep(payload, "group_id");
        deps.extend(single_dep(payload, "user_id"));
        deps
    }

    fn unblock_keys(&self, event: &Event) -> Vec<BlockReason> {
        // Envelopes parked on this group's partition may now be valid.
        match parse_payload::<GroupMemberPayload>(event) {
            Ok(p) => vec![BlockReason::missing_dep(p.group_id)],
            Err(_) => Vec::new(),
        }
    }

    async fn command(
        &self,
        params: JsonValue,
        ctx: &mut CommandCtx<'_>,
    ) -> ProtocolResult<Vec<Envelope>> {
        let params: AddGroupMemberParams = parse_params(params)?;

        let group = sqlx::query("SELECT network_id FROM groups WHERE group_id = ?1")
            .bind(&params.group_id.as_bytes()[..])
            .fetch_optional(ctx.conn())
            .await
            .map_err(db_err("fetch group"))?
            .ok_or_else(|| ProtocolError::missing("unknown group"))?;
        let network_id = EventId::from_slice(&group.get::<Vec<u8>, _>("network_id"))
            .map_err(|e| ProtocolError::malformed(e.to_string()))?;

        let signer = ctx
            .identity_for_network(network_id)
            .await?
            .ok_or_else(|| ProtocolError::missing("no identity for network"))?;
        let now = ctx.now_ms();

        let mut envelopes = vec![Envelope::local(
            "group_member",
            json!({
                "network_id": network_id,
                "group_id": params.group_id,
                "user_id": params.user_id,
                "created_at_ms": now,
            }),
            SignerSpec::Identity(signer),
        )
        .broadcast()];

        // Hand the new member the group key, when we hold it.
        if let Some((key_id, secret)) = ctx.group_key_for_group(params.group_id).await? {
            let member = sqlx::query(
                "SELECT seal_pubkey FROM users WHERE user_id = ?1 AND seal_pubkey IS NOT NULL",
            )
            .bind(&params.user_id.as_bytes()[..])
            .fetch_optional(ctx.conn())
            .await
            .map_err(db_err("fetch member seal key"))?;

            if let Some(row) = member {
                let seal = SealPublicKey::from_slice(&row.get::<Vec<u8>, _>("seal_pubkey"))?;
                let sealed = seal_to(&seal, secret.as_bytes())?;
                envelopes.push(
                    Envelope::local(
                        "sealed_key",
                        json!({
                            "network_id": network_id,
                            "key_id": key_id,
                            "recipient_seal_pubkey": seal,
                            "sealed": crate::kinds::keys::encode_sealed(&sealed),
                            "created_at_ms": now,
                        }),
                        SignerSpec::Identity(signer),
                    )
                    .broadcast(),
                );
            }
        }

        Ok(envelopes)
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        let p: GroupMemberPayload = match parse_payload(event) {
            Ok(p) => p,
            Err(e) => return Ok(Validation::Invalid(e.to_string())),
        };
        match require_member(ctx, p.network_id, &event.signer).await? {
            Validation::Valid => {}
            other => return Ok(other),
        }
        require_group_member(ctx, p.group_id, &event.signer).await
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: GroupMemberPayload = parse_payload(event)?;
        sqlx::query(
            "INSERT OR IGNORE INTO group_members \
             (group_id, user_id, network_id, added_by, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&p.group_id.as_bytes()[..])
        .bind(&p.user_id.as_bytes()[..])
        .bind(&p.network_id.as_bytes()[..])
        .bind(&event.signer.as_bytes()[..])
        .bind(&event.event_id()?.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project group member"))?;
        Ok(())
    }
}

/// A channel within a group.
pub struct ChannelKind;

#[derive(Debug, Deserialize)]
struct ChannelPayload {
    network_id: EventId,
    group_id: EventId,
    name: String,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct CreateChannelParams {
    group_id: EventId,
    name: String,
}

#[async_trait]
impl EventKind for ChannelKind {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn command_name(&self) -> Option<&'static str> {
        Some("create_channel")
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        &[r#"
        CREATE TABLE IF NOT EXISTS channels (
            channel_id     BLOB PRIMARY KEY,
            group_id       BLOB NOT NULL,
            network_id     BLOB NOT NULL,
            name           TEXT NOT NULL,
            creator_pubkey BLOB NOT NULL,
            event_id       BLOB NOT NULL,
            created_at_ms  INTEGER NOT NULL
        )
        "#]
    }

    fn deps(&self, payload: &JsonValue) -> Vec<EventId> {
        single_dep(payload, "group_id")
    }

    async fn command(
        &self,
        params: JsonValue,
        ctx: &mut CommandCtx<'_>,
    ) -> ProtocolResult<Vec<Envelope>> {
        let params: CreateChannelParams = parse_params(params)?;

        let group = sqlx::query("SELECT network_id FROM groups WHERE group_id = ?1")
            .bind(&params.group_id.as_bytes()[..])
            .fetch_optional(ctx.conn())
            .await
            .map_err(db_err("fetch group"))?
            .ok_or_else(|| ProtocolError::missing("unknown group"))?;
        let network_id = EventId::from_slice(&group.get::<Vec<u8>, _>("network_id"))
            .map_err(|e| ProtocolError::malformed(e.to_string()))?;

        let signer = ctx
            .identity_for_network(network_id)
            .await?
            .ok_or_else(|| ProtocolError::missing("no identity for network"))?;
        let now = ctx.now_ms();

        Ok(vec![Envelope::local(
            "channel",
            json!({
                "network_id": network_id,
                "group_id": params.group_id,
                "name": params.name,
                "created_at_ms": now,
            }),
            SignerSpec::Identity(signer),
        )
        .broadcast()])
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        let p: ChannelPayload = match parse_payload(event) {
            Ok(p) => p,
            Err(e) => return Ok(Validation::Invalid(e.to_string())),
        };
        match require_member(ctx, p.network_id, &event.signer).await? {
            Validation::Valid => {}
            other => return Ok(other),
        }
        require_group_member(ctx, p.group_id, &event.signer).await
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: ChannelPayload = parse_payload(event)?;
        let id = event.event_id()?;
        sqlx::query(
            "INSERT OR IGNORE INTO channels \
             (channel_id, group_id, network_id, name, creator_pubkey, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?1, ?6)",
        )
        .bind(&id.as_bytes()[..])
        .bind(&p.group_id.as_bytes()[..])
        .bind(&p.network_id.as_bytes()[..])
        .bind(&p.name)
        .bind(&event.signer.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project channel"))?;
        Ok(())
    }
}

/// A message in a channel. Outbound copies ride under the group key when the
/// group has one.
pub struct MessageKind;

#[derive(Debug, Deserialize)]
struct MessagePayload {
    network_id: EventId,
    channel_id: EventId,
    text: String,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct CreateMessageParams {
    channel_id: EventId,
    text: String,
}

#[async_trait]
impl EventKind for MessageKind {
    fn name(&self) -> &'static str {
        "message"
    }

    fn command_name(&self) -> Option<&'static str> {
        Some("create_message")
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        &[
            r#"
        CREATE TABLE IF NOT EXISTS messages (
            message_id    BLOB PRIMARY KEY,
            channel_id    BLOB NOT NULL,
            network_id    BLOB NOT NULL,
            sender_pubkey BLOB NOT NULL,
            text          TEXT NOT NULL,
            event_id      BLOB NOT NULL,
            created_at_ms INTEGER NOT NULL
        )
        "#,
            r#"
        CREATE INDEX IF NOT EXISTS idx_messages_channel
            ON messages(channel_id, created_at_ms)
        "#,
        ]
    }

    fn deps(&self, payload: &JsonValue) -> Vec<EventId> {
        single_dep(payload, "channel_id")
    }

    async fn command(
        &self,
        params: JsonValue,
        ctx: &mut CommandCtx<'_>,
    ) -> ProtocolResult<Vec<Envelope>> {
        let params: CreateMessageParams = parse_params(params)?;

        let channel = sqlx::query("SELECT group_id, network_id FROM channels WHERE channel_id = ?1")
            .bind(&params.channel_id.as_bytes()[..])
            .fetch_optional(ctx.conn())
            .await
            .map_err(db_err("fetch channel"))?
            .ok_or_else(|| ProtocolError::missing("unknown channel"))?;
        let group_id = EventId::from_slice(&channel.get::<Vec<u8>, _>("group_id"))
            .map_err(|e| ProtocolError::malformed(e.to_string()))?;
        let network_id = EventId::from_slice(&channel.get::<Vec<u8>, _>("network_id"))
            .map_err(|e| ProtocolError::malformed(e.to_string()))?;

        let signer = ctx
            .identity_for_network(network_id)
            .await?
            .ok_or_else(|| ProtocolError::missing("no identity for network"))?;
        let now = ctx.now_ms();

        let mut envelope = Envelope::local(
            "message",
            json!({
                "network_id": network_id,
                "channel_id": params.channel_id,
                "text": params.text,
                "created_at_ms": now,
            }),
            SignerSpec::Identity(signer),
        )
        .broadcast();

        if let Some((key_id, _)) = ctx.group_key_for_group(group_id).await? {
            envelope = envelope.with_group_key(key_id);
        }

        Ok(vec![envelope])
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        let p: MessagePayload = match parse_payload(event) {
            Ok(p) => p,
            Err(e) => return Ok(Validation::Invalid(e.to_string())),
        };
        match require_member(ctx, p.network_id, &event.signer).await? {
            Validation::Valid => {}
            other => return Ok(other),
        }

        let channel = sqlx::query("SELECT group_id FROM channels WHERE channel_id = ?1")
            .bind(&p.channel_id.as_bytes()[..])
            .fetch_optional(ctx.conn())
            .await
            .map_err(db_err("fetch channel"))?;
        let Some(row) = channel else {
            // The channel event exists (deps passed) but its row is gone:
            // its creator was removed.
            return Ok(Validation::Invalid("channel no longer exists".into()));
        };
        let group_id = EventId::from_slice(&row.get::<Vec<u8>, _>("group_id"))
            .map_err(|e| ProtocolError::malformed(e.to_string()))?;

        require_group_member(ctx, group_id, &event.signer).await
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: MessagePayload = parse_payload(event)?;
        let id = event.event_id()?;
        sqlx::query(
            "INSERT OR IGNORE INTO messages \
             (message_id, channel_id, network_id, sender_pubkey, text, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?1, ?6)",
        )
        .bind(&id.as_bytes()[..])
        .bind(&p.channel_id.as_bytes()[..])
        .bind(&p.network_id.as_bytes()[..])
        .bind(&event.signer.as_bytes()[..])
        .bind(&p.text)
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project message"))?;
        Ok(())
    }
}
