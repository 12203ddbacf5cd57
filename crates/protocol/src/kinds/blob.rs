//! Binary attachments, carried as a blob descriptor plus fixed-size slices.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::{Row, SqliteConnection};

use quiet_core::EventId;
use quiet_crypto::sha256;

use crate::ctx::{CommandCtx, ReadCtx};
use crate::envelope::{placeholder, Envelope, SignerSpec, Validation};
use crate::event::Event;
use crate::kinds::common::{parse_params, parse_payload, require_member};
use crate::registry::EventKind;
use crate::{db_err, ProtocolError, ProtocolResult};

/// Slice payload ceiling in raw bytes. A protocol parameter, not an
/// invariant; peers tolerate smaller slices.
pub const BLOB_SLICE_LIMIT: usize = 512;

#[derive(Debug, Deserialize)]
struct BlobPayload {
    network_id: EventId,
    channel_id: EventId,
    blob_id: String,
    name: String,
    size: u64,
    slice_count: u32,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct BlobSlicePayload {
    network_id: EventId,
    blob_event_id: EventId,
    blob_id: String,
    slice_index: u32,
    data: String,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct CreateBlobParams {
    channel_id: EventId,
    name: String,
    /// Base64 content.
    data: String,
}

fn blob_hash(s: &str) -> ProtocolResult<Vec<u8>> {
    let bytes = hex::decode(s).map_err(|e| ProtocolError::malformed(format!("blob_id: {e}")))?;
    if bytes.len() != 32 {
        return Err(ProtocolError::malformed("blob_id must be 32 bytes"));
    }
    Ok(bytes)
}

/// Blob descriptor: names the content hash and how many slices follow.
pub struct BlobKind;

#[async_trait]
impl EventKind for BlobKind {
    fn name(&self) -> &'static str {
        "blob"
    }

    fn command_name(&self) -> Option<&'static str> {
        Some("create_blob")
    }

    fn projection_schema(&self) -> &'static [&'static str] {
        &[
            r#"
        CREATE TABLE IF NOT EXISTS blobs (
            blob_id       BLOB PRIMARY KEY,
            channel_id    BLOB NOT NULL,
            network_id    BLOB NOT NULL,
            name          TEXT NOT NULL,
            size          INTEGER NOT NULL,
            slice_count   INTEGER NOT NULL,
            sender_pubkey BLOB NOT NULL,
            event_id      BLOB NOT NULL,
            created_at_ms INTEGER NOT NULL
        )
        "#,
            r#"
        CREATE TABLE IF NOT EXISTS blob_slices (
            blob_id       BLOB NOT NULL,
            slice_index   INTEGER NOT NULL,
            data          BLOB NOT NULL,
            event_id      BLOB NOT NULL,
            created_at_ms INTEGER NOT NULL,
            PRIMARY KEY (blob_id, slice_index)
        )
        "#,
        ]
    }

    fn deps(&self, payload: &JsonValue) -> Vec<EventId> {
        payload
            .get("channel_id")
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
        let params: CreateBlobParams = parse_params(params)?;
        let data = STANDARD
            .decode(&params.data)
            .map_err(|e| ProtocolError::bad_params(format!("data: {e}")))?;

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
        let group_key = ctx.group_key_for_group(group_id).await?.map(|(id, _)| id);

        let blob_id = hex::encode(sha256(&data));
        let slices: Vec<&[u8]> = data.chunks(BLOB_SLICE_LIMIT).collect();

        let mut descriptor = Envelope::local(
            "blob",
            json!({
                "network_id": network_id,
                "channel_id": params.channel_id,
                "blob_id": blob_id,
                "name": params.name,
                "size": data.len() as u64,
                "slice_count": slices.len() as u32,
                "created_at_ms": now,
            }),
            SignerSpec::Identity(signer),
        )
        .broadcast();
        if let Some(key_id) = group_key {
            descriptor = descriptor.with_group_key(key_id);
        }

        let mut envelopes = vec![descriptor];
        for (index, chunk) in slices.iter().enumerate() {
            let mut slice = Envelope::local(
                "blob_slice",
                json!({
                    "network_id": network_id,
                    "blob_event_id": placeholder("blob", 0),
                    "blob_id": blob_id,
                    "slice_index": index as u32,
                    "data": STANDARD.encode(chunk),
                    "created_at_ms": now,
                }),
                SignerSpec::Identity(signer),
            )
            .broadcast();
            if let Some(key_id) = group_key {
                slice = slice.with_group_key(key_id);
            }
            envelopes.push(slice);
        }
        Ok(envelopes)
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        let p: BlobPayload = match parse_payload(event) {
            Ok(p) => p,
            Err(e) => return Ok(Validation::Invalid(e.to_string())),
        };
        if blob_hash(&p.blob_id).is_err() {
            return Ok(Validation::Invalid("bad blob_id".into()));
        }
        require_member(ctx, p.network_id, &event.signer).await
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: BlobPayload = parse_payload(event)?;
        sqlx::query(
            "INSERT OR IGNORE INTO blobs \
             (blob_id, channel_id, network_id, name, size, slice_count, sender_pubkey, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&blob_hash(&p.blob_id)?[..])
        .bind(&p.channel_id.as_bytes()[..])
        .bind(&p.network_id.as_bytes()[..])
        .bind(&p.name)
        .bind(p.size as i64)
        .bind(p.slice_count as i64)
        .bind(&event.signer.as_bytes()[..])
        .bind(&event.event_id()?.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project blob"))?;
        Ok(())
    }
}

/// One slice of a blob's content, at most [`BLOB_SLICE_LIMIT`] raw bytes.
pub struct BlobSliceKind;

#[async_trait]
impl EventKind for BlobSliceKind {
    fn name(&self) -> &'static str {
        "blob_slice"
    }

    fn deps(&self, payload: &JsonValue) -> Vec<EventId> {
        payload
            .get("blob_event_id")
            .and_then(JsonValue::as_str)
            .and_then(|s| s.parse().ok())
            .into_iter()
            .collect()
    }

    async fn validate(&self, event: &Event, ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        let p: BlobSlicePayload = match parse_payload(event) {
            Ok(p) => p,
            Err(e) => return Ok(Validation::Invalid(e.to_string())),
        };
        if blob_hash(&p.blob_id).is_err() {
            return Ok(Validation::Invalid("bad blob_id".into()));
        }
        match STANDARD.decode(&p.data) {
            Ok(raw) if raw.len() <= BLOB_SLICE_LIMIT => {}
            Ok(_) => return Ok(Validation::Invalid("slice exceeds size limit".into())),
            Err(e) => return Ok(Validation::Invalid(format!("slice data: {e}"))),
        }
        require_member(ctx, p.network_id, &event.signer).await
    }

    async fn project(&self, event: &Event, conn: &mut SqliteConnection) -> ProtocolResult<()> {
        let p: BlobSlicePayload = parse_payload(event)?;
        let data = STANDARD
            .decode(&p.data)
            .map_err(|e| ProtocolError::malformed(format!("slice data: {e}")))?;
        sqlx::query(
            "INSERT OR IGNORE INTO blob_slices \
             (blob_id, slice_index, data, event_id, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&blob_hash(&p.blob_id)?[..])
        .bind(p.slice_index as i64)
        .bind(&data[..])
        .bind(&event.event_id()?.as_bytes()[..])
        .bind(p.created_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(db_err("project blob slice"))?;
        Ok(())
    }
}
