//! Sync: request/response reflectors plus the scheduled request emitter.
//!
//! Both kinds are ephemeral control traffic: validated and reflected, never
//! stored or projected. A responder streams stored events back in batches;
//! the requester's reflector re-materializes them as envelopes that run the
//! ordinary pipeline, which makes sync exactly as safe as direct ingest.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqliteConnection;
use uuid::Uuid;

use quiet_core::EventId;

use crate::ctx::{CommandCtx, ReadCtx};
use crate::envelope::{Envelope, SignerSpec, Validation};
use crate::event::Event;
use crate::kinds::common::parse_payload;
use crate::registry::EventKind;
use crate::ProtocolResult;

/// Most events a responder will scan per request.
pub const SYNC_BATCH_LIMIT: i64 = 200;
/// Events per sync_response envelope.
pub const SYNC_RESPONSE_EVENTS: usize = 20;
/// Re-request window, absorbing clock skew between peers.
pub const SYNC_OVERLAP_MS: i64 = 5_000;

#[derive(Debug, Deserialize)]
struct SyncRequestPayload {
    network_id: EventId,
    since_ms: i64,
    request_id: String,
    created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct SyncResponsePayload {
    #[allow(dead_code)]
    network_id: EventId,
    #[allow(dead_code)]
    request_id: String,
    events: Vec<String>,
    #[allow(dead_code)]
    created_at_ms: i64,
}

/// Asks a peer for events at or after a watermark.
///
/// Authentication rides on the transit layer: a request only reaches this
/// code if it arrived under a transit key we agreed to, so the validator
/// checks shape, not membership. A joiner must be able to sync before its
/// `user` event lands on the responder.
pub struct SyncRequestKind;

#[async_trait]
impl EventKind for SyncRequestKind {
    fn name(&self) -> &'static str {
        "sync_request"
    }

    fn ephemeral(&self) -> bool {
        true
    }

    async fn validate(&self, event: &Event, _ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        match parse_payload::<SyncRequestPayload>(event) {
            Ok(p) if p.since_ms >= 0 => Ok(Validation::Valid),
            Ok(_) => Ok(Validation::Invalid("negative sync watermark".into())),
            Err(e) => Ok(Validation::Invalid(e.to_string())),
        }
    }

    async fn project(&self, _event: &Event, _conn: &mut SqliteConnection) -> ProtocolResult<()> {
        // Ephemeral: nothing to materialize.
        Ok(())
    }

    async fn reflect(
        &self,
        event: &Event,
        ctx: &mut ReadCtx<'_>,
    ) -> ProtocolResult<Vec<Envelope>> {
        let p: SyncRequestPayload = parse_payload(event)?;

        let Some(signer) = ctx.identity_for_network(p.network_id).await? else {
            // Not our network; nothing to reflect.
            return Ok(Vec::new());
        };

        let events = ctx
            .events_since(p.network_id, p.since_ms, SYNC_BATCH_LIMIT)
            .await?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let now = ctx.now_ms();
        let mut responses = Vec::new();
        for chunk in events.chunks(SYNC_RESPONSE_EVENTS) {
            let encoded: Vec<String> = chunk
                .iter()
                .map(|e| Ok(STANDARD.encode(e.canonical_bytes()?)))
                .collect::<ProtocolResult<_>>()?;

            responses.push(
                Envelope::local(
                    "sync_response",
                    json!({
                        "network_id": p.network_id,
                        "request_id": p.request_id,
                        "events": encoded,
                        "created_at_ms": now,
                    }),
                    SignerSpec::Identity(signer),
                )
                .with_origin(crate::envelope::EnvelopeOrigin::Reflected)
                .outgoing_to(event.signer)
                .responding_to(p.request_id.clone()),
            );
        }
        Ok(responses)
    }
}

/// A batch of events answering a sync request. The requester's reflector
/// unpacks them into pipeline envelopes.
pub struct SyncResponseKind;

#[async_trait]
impl EventKind for SyncResponseKind {
    fn name(&self) -> &'static str {
        "sync_response"
    }

    fn ephemeral(&self) -> bool {
        true
    }

    async fn validate(&self, event: &Event, _ctx: &mut ReadCtx<'_>) -> ProtocolResult<Validation> {
        match parse_payload::<SyncResponsePayload>(event) {
            Ok(_) => Ok(Validation::Valid),
            Err(e) => Ok(Validation::Invalid(e.to_string())),
        }
    }

    async fn project(&self, _event: &Event, _conn: &mut SqliteConnection) -> ProtocolResult<()> {
        Ok(())
    }

    async fn reflect(
        &self,
        event: &Event,
        _ctx: &mut ReadCtx<'_>,
    ) -> ProtocolResult<Vec<Envelope>> {
        let p: SyncResponsePayload = parse_payload(event)?;
        let mut unpacked = Vec::with_capacity(p.events.len());
        for encoded in &p.events {
            let bytes = STANDARD
                .decode(encoded)
                .map_err(|e| crate::ProtocolError::malformed(format!("sync payload: {e}")))?;
            let inner = Event::from_canonical_bytes(&bytes)?;
            unpacked.push(Envelope::reflected_event(&inner)?);
        }
        Ok(unpacked)
    }
}

/// The scheduled sync emitter: a reflector with no triggering event. One
/// request per transit-reachable peer per local network, watermarked off the
/// newest stored event (minus an overlap window).
pub async fn sync_job(ctx: &mut CommandCtx<'_>) -> ProtocolResult<Vec<Envelope>> {
    let mut requests = Vec::new();
    let now = ctx.now_ms();

    for (network_id, my_pubkey) in ctx.local_networks().await? {
        let latest = ctx.latest_event_ms(network_id).await?;
        let since_ms = (latest - SYNC_OVERLAP_MS).max(0);

        for peer in ctx.transit_reachable_peers(network_id).await? {
            if peer == my_pubkey {
                continue;
            }
            sqlx::query(
                "UPDATE peers SET last_synced_ms = ?1 WHERE network_id = ?2 AND pubkey = ?3",
            )
            .bind(now)
            .bind(&network_id.as_bytes()[..])
            .bind(&peer.as_bytes()[..])
            .execute(ctx.conn())
            .await
            .map_err(crate::db_err("update sync watermark"))?;

            requests.push(
                Envelope::local(
                    "sync_request",
                    json!({
                        "network_id": network_id,
                        "since_ms": since_ms,
                        "request_id": Uuid::now_v7().to_string(),
                        "created_at_ms": now,
                    }),
                    SignerSpec::Identity(my_pubkey),
                )
                .with_origin(crate::envelope::EnvelopeOrigin::Job)
                .outgoing_to(peer),
            );
        }
    }

    Ok(requests)
}
