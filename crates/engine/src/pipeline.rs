//! The envelope pipeline.
//!
//! An ordered list of stages, each with a filter and a process function. An
//! envelope traverses every stage in order; filters skip the ones that don't
//! apply, which is also how re-driven and mid-run-materialized envelopes find
//! their natural entry point. A stage can emit additional envelopes (command
//! batches, reflected responses, unpacked sync payloads) which join the work
//! queue and traverse the full list themselves.
//!
//! One `run_batch` call operates entirely inside the caller's immediate
//! transaction: stages never suspend on anything but the database.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::SqliteConnection;
use tracing::{debug, warn};

use quiet_core::EventId;
use quiet_crypto::derive_keypair;
use quiet_protocol::wire::{WireEnvelope, INVITE_KDF_INFO};
use quiet_protocol::{
    placeholder, registry, resolve_placeholders, BlockReason, Ctx, DropReason, Envelope,
    EnvelopeOrigin, EnvelopeState, Event, SignerSpec, Validation,
};
use quiet_store::map_sqlx_error;

use crate::blocked;
use crate::cache::TransitCache;
use crate::error::{EngineError, EngineResult};

/// A placeholder that still dangles after this many requeues is a bug in the
/// command that emitted it.
const MAX_DEFERRALS: u32 = 8;

/// What one pipeline run did.
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Ids of events signed in this run (command receipts).
    pub event_ids: Vec<EventId>,
    /// Ids projected into the read model.
    pub projected: Vec<EventId>,
    /// Envelopes parked in `blocked`.
    pub blocked: Vec<BlockReason>,
    /// Envelopes dropped, with reasons.
    pub dropped: Vec<DropReason>,
    /// Rows appended to `outgoing`.
    pub outgoing_rows: usize,
}

/// Per-run mutable state shared across stages.
pub struct StageCtx<'a> {
    pub conn: &'a mut SqliteConnection,
    pub now_ms: i64,
    pub cache: &'a TransitCache,
    /// Resolved `@generated` references for this run.
    resolved: HashMap<String, EventId>,
    /// Per-type counters assigning placeholder indexes in sign order.
    type_counters: HashMap<String, usize>,
    /// Transit key the inbound datagram arrived under, for replies.
    reply_transit: Option<quiet_crypto::SymmetricKey>,
    pub outcome: RunOutcome,
}

impl<'a> StageCtx<'a> {
    fn new(conn: &'a mut SqliteConnection, cache: &'a TransitCache, now_ms: i64) -> Self {
        Self {
            conn,
            now_ms,
            cache,
            resolved: HashMap::new(),
            type_counters: HashMap::new(),
            reply_transit: None,
            outcome: RunOutcome::default(),
        }
    }

    fn protocol_ctx(&mut self) -> Ctx<'_> {
        Ctx::new(&mut *self.conn, self.now_ms)
    }
}

/// Stage verdict for one envelope.
pub enum StageResult {
    /// Proceed to the next stage; extras join the work queue as fresh
    /// envelopes.
    Continue(Envelope, Vec<Envelope>),
    /// Park in `blocked`.
    Blocked(Envelope, BlockReason),
    /// Terminal for this envelope.
    Dropped(Envelope, DropReason),
    /// Requeue and retry once more of the batch has been signed.
    Defer(Envelope),
}

/// One pipeline stage: a filter and a process function.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn filter(&self, env: &Envelope) -> bool;
    async fn process(&self, ctx: &mut StageCtx<'_>, env: Envelope) -> EngineResult<StageResult>;
}

/// The canonical stage order.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            stages: vec![
                Box::new(ParseStage),
                Box::new(TransitDecryptStage),
                Box::new(OpenStage),
                Box::new(ResolveStage),
                Box::new(SignStage),
                Box::new(ValidateStage),
                Box::new(StoreStage),
                Box::new(ProjectStage),
                Box::new(ReflectStage),
                Box::new(UnblockStage),
                Box::new(OutgoingStage),
            ],
        }
    }

    /// Run a batch of envelopes to completion inside the caller's
    /// transaction. Envelopes a stage emits traverse the full stage list.
    pub async fn run_batch(
        &self,
        conn: &mut SqliteConnection,
        cache: &TransitCache,
        now_ms: i64,
        envelopes: Vec<Envelope>,
    ) -> EngineResult<RunOutcome> {
        let mut ctx = StageCtx::new(conn, cache, now_ms);
        let mut queue: VecDeque<(Envelope, u32)> = envelopes.into_iter().map(|e| (e, 0)).collect();

        while let Some((mut env, deferrals)) = queue.pop_front() {
            let mut emitted: Vec<Envelope> = Vec::new();

            for stage in &self.stages {
                if !stage.filter(&env) {
                    continue;
                }
                match stage.process(&mut ctx, env).await? {
                    StageResult::Continue(next, extras) => {
                        env = next;
                        emitted.extend(extras);
                    }
                    StageResult::Blocked(mut parked, reason) => {
                        debug!(stage = stage.name(), reason = %reason.partition_key(), "envelope blocked");
                        parked.state = EnvelopeState::Blocked;
                        blocked::park(&mut ctx, &parked, &reason).await?;
                        ctx.outcome.blocked.push(reason);
                        break;
                    }
                    StageResult::Dropped(mut dropped, reason) => {
                        dropped.state = EnvelopeState::Dropped;
                        record_drop(&mut ctx, &dropped, &reason).await?;
                        ctx.outcome.dropped.push(reason);
                        break;
                    }
                    StageResult::Defer(deferred) => {
                        if deferrals >= MAX_DEFERRALS {
                            let reason =
                                DropReason::Malformed("unresolvable placeholder".to_string());
                            record_drop(&mut ctx, &deferred, &reason).await?;
                            ctx.outcome.dropped.push(reason);
                        } else {
                            queue.push_back((deferred, deferrals + 1));
                        }
                        break;
                    }
                }
            }

            for extra in emitted {
                queue.push_back((extra, 0));
            }
        }

        Ok(ctx.outcome)
    }
}

/// Record a dropped envelope. Parsed-but-invalid envelopes are retained in
/// `unknown_events`; crypto and framing drops only log.
async fn record_drop(
    ctx: &mut StageCtx<'_>,
    env: &Envelope,
    reason: &DropReason,
) -> EngineResult<()> {
    match reason {
        DropReason::Invalid(_) => {
            let envelope_json = serde_json::to_string(env)
                .map_err(|e| EngineError::Transport(format!("encode envelope: {e}")))?;
            sqlx::query(
                "INSERT INTO unknown_events (event_id, envelope, reason, created_at_ms) \
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(env.event_id.as_ref().map(|id| id.as_bytes().to_vec()))
            .bind(envelope_json)
            .bind(reason.to_string())
            .bind(ctx.now_ms)
            .execute(&mut *ctx.conn)
            .await
            .map_err(|e| EngineError::from(map_sqlx_error("retain unknown event", e)))?;
            warn!(%reason, "envelope rejected and retained");
        }
        DropReason::Duplicate => {
            debug!("duplicate event, idempotent skip");
        }
        other => {
            warn!(reason = %other, origin = ?env.origin, "envelope dropped");
        }
    }
    Ok(())
}

fn fill_event_fields(env: &mut Envelope, event: Event) -> EngineResult<()> {
    env.event_id = Some(event.event_id().map_err(EngineError::from)?);
    env.event_type = Some(event.event_type);
    env.event_plaintext = Some(event.payload);
    env.signer = Some(event.signer);
    env.signature = Some(event.signature);
    env.event_ciphertext = None;
    env.state = EnvelopeState::Opened;
    Ok(())
}

/// Stage 1: split a raw datagram into transit key id and ciphertext.
struct ParseStage;

#[async_trait]
impl Stage for ParseStage {
    fn name(&self) -> &'static str {
        "parse"
    }

    fn filter(&self, env: &Envelope) -> bool {
        env.transit_ciphertext.is_some() && env.transit_key_id.is_none()
    }

    async fn process(&self, _ctx: &mut StageCtx<'_>, mut env: Envelope) -> EngineResult<StageResult> {
        let Some(datagram) = env.transit_ciphertext.take() else {
            return Ok(StageResult::Dropped(
                env,
                DropReason::Malformed("empty datagram".into()),
            ));
        };
        match quiet_protocol::wire::split_datagram(&datagram) {
            Ok((key_id, ct)) => {
                env.transit_key_id = Some(key_id);
                env.transit_ciphertext = Some(ct.to_vec());
                Ok(StageResult::Continue(env, Vec::new()))
            }
            Err(e) => Ok(StageResult::Dropped(env, DropReason::Malformed(e.to_string()))),
        }
    }
}

/// Stage 2: transit decryption. Unknown transit keys drop; we never speak
/// to transit keys we did not agree to, so parking would be pointless.
struct TransitDecryptStage;

#[async_trait]
impl Stage for TransitDecryptStage {
    fn name(&self) -> &'static str {
        "transit_decrypt"
    }

    fn filter(&self, env: &Envelope) -> bool {
        env.transit_key_id.is_some() && env.transit_ciphertext.is_some()
    }

    async fn process(&self, ctx: &mut StageCtx<'_>, mut env: Envelope) -> EngineResult<StageResult> {
        let (Some(key_id), Some(ct)) = (env.transit_key_id, env.transit_ciphertext.take()) else {
            return Ok(StageResult::Dropped(
                env,
                DropReason::Malformed("incomplete transit envelope".into()),
            ));
        };

        let key = match ctx.cache.get_by_key_id(key_id, ctx.now_ms) {
            Some(key) => Some(key),
            None => ctx.protocol_ctx().transit_key(key_id).await?,
        };
        let Some(key) = key else {
            return Ok(StageResult::Dropped(env, DropReason::UnknownTransitKey));
        };

        let plaintext = match quiet_crypto::decrypt(&key, &ct) {
            Ok(p) => p,
            Err(_) => return Ok(StageResult::Dropped(env, DropReason::MacFailure)),
        };
        ctx.reply_transit = Some(key);
        env.state = EnvelopeState::TransitDecrypted;

        match WireEnvelope::from_bytes(&plaintext) {
            Ok(WireEnvelope::Plain { event }) => match Event::from_canonical_bytes(&event) {
                Ok(event) => {
                    fill_event_fields(&mut env, event)?;
                    Ok(StageResult::Continue(env, Vec::new()))
                }
                Err(e) => Ok(StageResult::Dropped(env, DropReason::Malformed(e.to_string()))),
            },
            Ok(WireEnvelope::GroupEncrypted {
                group_key_id,
                event_ct,
            }) => {
                env.group_key_id = Some(group_key_id);
                env.event_ciphertext = Some(event_ct);
                Ok(StageResult::Continue(env, Vec::new()))
            }
            Ok(WireEnvelope::Sealed { seal_to, sealed }) => {
                env.seal_to = Some(seal_to);
                env.event_ciphertext = Some(sealed);
                Ok(StageResult::Continue(env, Vec::new()))
            }
            Err(e) => Ok(StageResult::Dropped(env, DropReason::Malformed(e.to_string()))),
        }
    }
}

/// Stage 3: event decryption / unsealing. A missing group key parks the
/// envelope; a box sealed to someone else is simply not ours to read.
struct OpenStage;

#[async_trait]
impl Stage for OpenStage {
    fn name(&self) -> &'static str {
        "open"
    }

    fn filter(&self, env: &Envelope) -> bool {
        env.event_ciphertext.is_some() && env.event_plaintext.is_none()
    }

    async fn process(&self, ctx: &mut StageCtx<'_>, mut env: Envelope) -> EngineResult<StageResult> {
        let Some(ct) = env.event_ciphertext.clone() else {
            return Ok(StageResult::Dropped(
                env,
                DropReason::Malformed("no ciphertext".into()),
            ));
        };

        let plaintext = if let Some(key_id) = env.group_key_id {
            let Some(key) = ctx.protocol_ctx().group_key(key_id).await? else {
                return Ok(StageResult::Blocked(env, BlockReason::missing_key(key_id)));
            };
            match quiet_crypto::decrypt(&key, &ct) {
                Ok(p) => p,
                Err(_) => return Ok(StageResult::Dropped(env, DropReason::MacFailure)),
            }
        } else if let Some(seal) = env.seal_to {
            let Some(keypair) = ctx.protocol_ctx().identity_for_seal(&seal).await? else {
                return Ok(StageResult::Dropped(env, DropReason::SealedToOther));
            };
            match quiet_crypto::open_sealed(&keypair, &ct) {
                Ok(p) => p,
                Err(_) => return Ok(StageResult::Dropped(env, DropReason::MacFailure)),
            }
        } else {
            return Ok(StageResult::Dropped(
                env,
                DropReason::Malformed("ciphertext without key reference".into()),
            ));
        };

        match Event::from_canonical_bytes(&plaintext) {
            Ok(event) => {
                fill_event_fields(&mut env, event)?;
                Ok(StageResult::Continue(env, Vec::new()))
            }
            Err(e) => Ok(StageResult::Dropped(env, DropReason::Malformed(e.to_string()))),
        }
    }
}

/// Stage 4: substitute `@generated:<type>:<index>` references with event ids
/// signed earlier in this run. Incomplete envelopes requeue: the two-pass
/// traversal for multi-event commands.
struct ResolveStage;

#[async_trait]
impl Stage for ResolveStage {
    fn name(&self) -> &'static str {
        "resolve"
    }

    fn filter(&self, env: &Envelope) -> bool {
        env.signature.is_none() && !env.placeholders_resolved()
    }

    async fn process(&self, ctx: &mut StageCtx<'_>, mut env: Envelope) -> EngineResult<StageResult> {
        let Some(mut payload) = env.event_plaintext.take() else {
            return Ok(StageResult::Dropped(
                env,
                DropReason::Malformed("placeholders without payload".into()),
            ));
        };
        let complete = resolve_placeholders(&mut payload, &ctx.resolved);
        env.event_plaintext = Some(payload);
        if complete {
            env.placeholders.clear();
            Ok(StageResult::Continue(env, Vec::new()))
        } else {
            Ok(StageResult::Defer(env))
        }
    }
}

/// Stage 5: sign locally issued envelopes and compute their identity.
struct SignStage;

#[async_trait]
impl Stage for SignStage {
    fn name(&self) -> &'static str {
        "sign"
    }

    fn filter(&self, env: &Envelope) -> bool {
        env.sign_with.is_some() && env.signature.is_none() && env.event_plaintext.is_some()
    }

    async fn process(&self, ctx: &mut StageCtx<'_>, mut env: Envelope) -> EngineResult<StageResult> {
        let (Some(spec), Some(event_type), Some(payload)) = (
            env.sign_with.clone(),
            env.event_type.clone(),
            env.event_plaintext.clone(),
        ) else {
            return Ok(StageResult::Dropped(
                env,
                DropReason::Malformed("unsignable envelope".into()),
            ));
        };

        let keypair = match spec {
            SignerSpec::Identity(pubkey) => ctx
                .protocol_ctx()
                .identity_keypair(&pubkey)
                .await?
                .ok_or_else(|| {
                    EngineError::CommandRejected(format!("no secret for identity {pubkey}"))
                })?,
            SignerSpec::InviteSecret(secret) => {
                derive_keypair(&secret, INVITE_KDF_INFO).map_err(EngineError::Crypto)?
            }
        };

        let event = Event::sign(&keypair, &event_type, payload).map_err(EngineError::from)?;
        let event_id = event.event_id().map_err(EngineError::from)?;

        // Register this event for later placeholders in the same batch.
        let index = ctx.type_counters.entry(event_type.clone()).or_insert(0);
        ctx.resolved
            .insert(placeholder(&event_type, *index), event_id);
        *index += 1;

        let kind = registry().kind(&event_type).map_err(EngineError::from)?;
        env.deps = kind.deps(&event.payload);
        env.signer = Some(event.signer);
        env.signature = Some(event.signature);
        env.event_id = Some(event_id);
        ctx.outcome.event_ids.push(event_id);

        Ok(StageResult::Continue(env, Vec::new()))
    }
}

/// Stage 6: uniform validation (signature, dependency existence, removed
/// signer) then the kind's own predicate.
struct ValidateStage;

#[async_trait]
impl Stage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn filter(&self, env: &Envelope) -> bool {
        env.signature.is_some()
            && env.event_plaintext.is_some()
            && matches!(
                env.state,
                EnvelopeState::Received | EnvelopeState::TransitDecrypted | EnvelopeState::Opened
            )
    }

    async fn process(&self, ctx: &mut StageCtx<'_>, mut env: Envelope) -> EngineResult<StageResult> {
        let event = match env.event() {
            Ok(e) => e,
            Err(e) => {
                return Ok(StageResult::Dropped(env, DropReason::Malformed(e.to_string())))
            }
        };

        let Ok(kind) = registry().kind(&event.event_type) else {
            return Ok(StageResult::Dropped(
                env,
                DropReason::Invalid(format!("unknown event kind {}", event.event_type)),
            ));
        };

        match event.verify_signature() {
            Ok(true) => {}
            Ok(false) => return Ok(StageResult::Dropped(env, DropReason::BadSignature)),
            Err(e) => {
                return Ok(StageResult::Dropped(env, DropReason::Malformed(e.to_string())))
            }
        }

        if env.deps.is_empty() {
            env.deps = kind.deps(&event.payload);
        }
        for dep in env.deps.clone() {
            if !ctx.protocol_ctx().event_exists(dep).await? {
                return Ok(StageResult::Blocked(env, BlockReason::missing_dep(dep)));
            }
        }

        if let Some(network_id) = event.network_id() {
            if ctx
                .protocol_ctx()
                .is_removed(network_id, &event.signer)
                .await?
            {
                return Ok(StageResult::Dropped(
                    env,
                    DropReason::Invalid("signer was removed from the network".into()),
                ));
            }
        }

        let verdict = {
            let mut pctx = ctx.protocol_ctx();
            kind.validate(&event, &mut pctx).await.map_err(EngineError::from)?
        };
        match verdict {
            Validation::Valid => {
                env.state = EnvelopeState::Validated;
                Ok(StageResult::Continue(env, Vec::new()))
            }
            Validation::Invalid(msg) => Ok(StageResult::Dropped(env, DropReason::Invalid(msg))),
            Validation::Blocked(reason) => Ok(StageResult::Blocked(env, reason)),
        }
    }
}

fn kind_flags(env: &Envelope) -> (bool, bool) {
    env.event_type
        .as_deref()
        .and_then(|t| registry().kind(t).ok())
        .map(|k| (k.local_only(), k.ephemeral()))
        .unwrap_or((false, false))
}

/// Stage 7: idempotent append to `events`. A duplicate short-circuits the
/// rest of the pipeline.
struct StoreStage;

#[async_trait]
impl Stage for StoreStage {
    fn name(&self) -> &'static str {
        "store_event"
    }

    fn filter(&self, env: &Envelope) -> bool {
        let (local_only, ephemeral) = kind_flags(env);
        env.state == EnvelopeState::Validated && !local_only && !ephemeral
    }

    async fn process(&self, ctx: &mut StageCtx<'_>, mut env: Envelope) -> EngineResult<StageResult> {
        let event = match env.event() {
            Ok(e) => e,
            Err(e) => {
                return Ok(StageResult::Dropped(env, DropReason::Malformed(e.to_string())))
            }
        };
        let (Ok(event_id), Ok(canonical), Ok(created_at_ms)) = (
            event.event_id(),
            event.canonical_bytes(),
            event.created_at_ms(),
        ) else {
            return Ok(StageResult::Dropped(
                env,
                DropReason::Malformed("unstorable event".into()),
            ));
        };

        // The network kind is its own scope; everyone else names one.
        let network_id: Option<Vec<u8>> = if event.event_type == "network" {
            Some(event_id.as_bytes().to_vec())
        } else {
            event.network_id().map(|id| id.as_bytes().to_vec())
        };

        let result = sqlx::query(
            "INSERT OR IGNORE INTO events \
             (event_id, event_type, network_id, signer, created_at_ms, payload_blob) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&event_id.as_bytes()[..])
        .bind(&event.event_type)
        .bind(network_id)
        .bind(&event.signer.as_bytes()[..])
        .bind(created_at_ms)
        .bind(&canonical[..])
        .execute(&mut *ctx.conn)
        .await
        .map_err(|e| EngineError::from(map_sqlx_error("store event", e)))?;

        if result.rows_affected() == 0 {
            return Ok(StageResult::Dropped(env, DropReason::Duplicate));
        }
        env.state = EnvelopeState::Stored;
        Ok(StageResult::Continue(env, Vec::new()))
    }
}

/// Stage 8: projection, inside the same transaction. A projector error is a
/// bug: the whole transaction aborts so invariant 1 holds.
struct ProjectStage;

#[async_trait]
impl Stage for ProjectStage {
    fn name(&self) -> &'static str {
        "project"
    }

    fn filter(&self, env: &Envelope) -> bool {
        let (local_only, _) = kind_flags(env);
        env.state == EnvelopeState::Stored
            || (env.state == EnvelopeState::Validated && local_only)
    }

    async fn process(&self, ctx: &mut StageCtx<'_>, mut env: Envelope) -> EngineResult<StageResult> {
        let event = env.event().map_err(EngineError::from)?;
        let kind = registry().kind(&event.event_type).map_err(EngineError::from)?;

        if let Err(e) = kind.project(&event, &mut *ctx.conn).await {
            let envelope_json = serde_json::to_string(&env).unwrap_or_else(|_| "{}".to_string());
            return Err(EngineError::Projector {
                kind: event.event_type.clone(),
                message: e.to_string(),
                envelope: envelope_json,
            });
        }

        env.state = EnvelopeState::Projected;
        if let Some(id) = env.event_id {
            ctx.outcome.projected.push(id);
        }
        Ok(StageResult::Continue(env, Vec::new()))
    }
}

/// Stage 9: reflectors answer incoming events. Locally issued and reflected
/// envelopes never reflect; only traffic that arrived off the wire does.
struct ReflectStage;

#[async_trait]
impl Stage for ReflectStage {
    fn name(&self) -> &'static str {
        "reflect"
    }

    fn filter(&self, env: &Envelope) -> bool {
        let (_, ephemeral) = kind_flags(env);
        env.origin == EnvelopeOrigin::IncomingDatagram
            && (env.state == EnvelopeState::Projected
                || (env.state == EnvelopeState::Validated && ephemeral))
    }

    async fn process(&self, ctx: &mut StageCtx<'_>, env: Envelope) -> EngineResult<StageResult> {
        let event = match env.event() {
            Ok(e) => e,
            Err(e) => {
                return Ok(StageResult::Dropped(env, DropReason::Malformed(e.to_string())))
            }
        };
        let kind = registry().kind(&event.event_type).map_err(EngineError::from)?;

        let produced = {
            let mut pctx = ctx.protocol_ctx();
            kind.reflect(&event, &mut pctx).await.map_err(EngineError::from)?
        };

        // Responses may leave in a later transaction; keep the inbound
        // transit key reachable by request id for its 30 s window.
        if !produced.is_empty() {
            if let (Some(key), Some(request_id)) = (
                ctx.reply_transit.clone(),
                event.payload.get("request_id").and_then(JsonValue::as_str),
            ) {
                ctx.cache.insert(request_id, key, ctx.now_ms);
            }
        }

        Ok(StageResult::Continue(env, produced))
    }
}

/// Stage 10: wake blocked envelopes whose reason this projection cleared, by
/// upserting coalesced recheck markers.
struct UnblockStage;

#[async_trait]
impl Stage for UnblockStage {
    fn name(&self) -> &'static str {
        "unblock"
    }

    fn filter(&self, env: &Envelope) -> bool {
        env.state == EnvelopeState::Projected && env.event_id.is_some()
    }

    async fn process(&self, ctx: &mut StageCtx<'_>, env: Envelope) -> EngineResult<StageResult> {
        let Some(event_id) = env.event_id else {
            return Ok(StageResult::Continue(env, Vec::new()));
        };
        let event = match env.event() {
            Ok(e) => e,
            Err(_) => return Ok(StageResult::Continue(env, Vec::new())),
        };

        let mut reasons = vec![BlockReason::missing_dep(event_id)];
        if let Ok(kind) = registry().kind(&event.event_type) {
            reasons.extend(kind.unblock_keys(&event));
        }

        for reason in reasons {
            if blocked::partition_has_rows(ctx.conn, &reason).await? {
                blocked::push_marker(ctx.conn, &reason, ctx.now_ms).await?;
                debug!(partition = %reason.partition_key(), "recheck marker queued");
            }
        }
        Ok(StageResult::Continue(env, Vec::new()))
    }
}

/// Stage 11: enqueue wire-bound envelopes to `outgoing`, wrapping the event
/// for its recipients. Broadcast envelopes fan out to every
/// transit-reachable peer of the network.
struct OutgoingStage;

#[async_trait]
impl Stage for OutgoingStage {
    fn name(&self) -> &'static str {
        "outgoing_send"
    }

    fn filter(&self, env: &Envelope) -> bool {
        env.is_outgoing && env.signature.is_some()
    }

    async fn process(&self, ctx: &mut StageCtx<'_>, env: Envelope) -> EngineResult<StageResult> {
        let event = match env.event() {
            Ok(e) => e,
            Err(e) => {
                return Ok(StageResult::Dropped(env, DropReason::Malformed(e.to_string())))
            }
        };
        let canonical = event.canonical_bytes().map_err(EngineError::from)?;

        let wire = if let Some(key_id) = env.group_key_id {
            let Some(key) = ctx.protocol_ctx().group_key(key_id).await? else {
                return Err(EngineError::CommandRejected(format!(
                    "outgoing event references unknown group key {key_id}"
                )));
            };
            WireEnvelope::GroupEncrypted {
                group_key_id: key_id,
                event_ct: quiet_crypto::encrypt(&key, &canonical).map_err(EngineError::Crypto)?,
            }
        } else if let Some(seal) = env.seal_to {
            WireEnvelope::Sealed {
                seal_to: seal,
                sealed: quiet_crypto::seal_to(&seal, &canonical).map_err(EngineError::Crypto)?,
            }
        } else {
            WireEnvelope::Plain { event: canonical }
        };
        let blob = wire.to_bytes().map_err(EngineError::from)?;

        // A reply is pinned to the transit key its request arrived under.
        let pinned_key: Option<Vec<u8>> = env
            .in_response_to
            .as_deref()
            .and_then(|rid| ctx.cache.get(rid, ctx.now_ms))
            .map(|key| key.id().as_bytes().to_vec());

        let recipients = match env.recipient {
            Some(recipient) => vec![recipient],
            None => {
                let network_id = if event.event_type == "network" {
                    env.event_id
                } else {
                    event.network_id()
                };
                match network_id {
                    Some(net) => {
                        let mut pctx = ctx.protocol_ctx();
                        pctx.transit_reachable_peers(net)
                            .await?
                            .into_iter()
                            .filter(|p| *p != event.signer)
                            .collect()
                    }
                    None => Vec::new(),
                }
            }
        };

        for recipient in recipients {
            sqlx::query(
                "INSERT INTO outgoing \
                 (recipient, blob, transit_key_id, sent, retry_count, next_retry, created_at_ms) \
                 VALUES (?1, ?2, ?3, 0, 0, 0, ?4)",
            )
            .bind(&recipient.as_bytes()[..])
            .bind(&blob[..])
            .bind(pinned_key.clone())
            .bind(ctx.now_ms)
            .execute(&mut *ctx.conn)
            .await
            .map_err(|e| EngineError::from(map_sqlx_error("enqueue outgoing", e)))?;
            ctx.outcome.outgoing_rows += 1;
        }

        Ok(StageResult::Continue(env, Vec::new()))
    }
}
