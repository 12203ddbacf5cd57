//! The blocked / recheck subsystem.
//!
//! `blocked` holds whole envelopes waiting on something that does not exist
//! yet: a group key, a dependency event, a signer. Wakeups are coalesced:
//! one `recheck_queue` marker per `(reason_type, reason_key)` partition,
//! upserted by the pipeline's unblock stage with a minimized due time. The
//! drainer claims due partitions one at a time (it runs under the `tick`
//! lease, so there is exactly one drainer) and re-drives each parked envelope
//! through the pipeline in its own transaction.

use serde_json::Value as JsonValue;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info, warn};

use quiet_core::Clock;
use quiet_protocol::{BlockReason, Envelope, EnvelopeState};
use quiet_store::{map_sqlx_error, Store};

use crate::cache::TransitCache;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::{Pipeline, StageCtx};
use crate::scheduler::{renew_lease, LeaseRenewal};

/// Marker re-arm backoff base and cap, for partitions that stay blocked.
const RECHECK_BACKOFF_BASE_MS: i64 = 1_000;
const RECHECK_BACKOFF_CAP_MS: i64 = 60_000;

/// Park an envelope. A re-park of the same event updates its reason in
/// place (reason reclassification).
pub async fn park(
    ctx: &mut StageCtx<'_>,
    env: &Envelope,
    reason: &BlockReason,
) -> EngineResult<()> {
    let envelope_json = serde_json::to_string(env)
        .map_err(|e| EngineError::Transport(format!("encode blocked envelope: {e}")))?;

    sqlx::query(
        "INSERT INTO blocked (reason_type, reason_key, envelope, event_id, created_at_ms) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(event_id) DO UPDATE SET \
             reason_type = excluded.reason_type, \
             reason_key = excluded.reason_key, \
             envelope = excluded.envelope",
    )
    .bind(reason.kind.as_str())
    .bind(&reason.key)
    .bind(envelope_json)
    .bind(env.event_id.as_ref().map(|id| id.as_bytes().to_vec()))
    .bind(ctx.now_ms)
    .execute(&mut *ctx.conn)
    .await
    .map_err(|e| EngineError::from(map_sqlx_error("park blocked", e)))?;
    Ok(())
}

/// Whether any envelope waits on this partition.
pub async fn partition_has_rows(
    conn: &mut SqliteConnection,
    reason: &BlockReason,
) -> EngineResult<bool> {
    let row = sqlx::query("SELECT 1 FROM blocked WHERE reason_type = ?1 AND reason_key = ?2 LIMIT 1")
        .bind(reason.kind.as_str())
        .bind(&reason.key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| EngineError::from(map_sqlx_error("blocked partition probe", e)))?;
    Ok(row.is_some())
}

/// Upsert a coalesced recheck marker, minimizing `available_at_ms`.
pub async fn push_marker(
    conn: &mut SqliteConnection,
    reason: &BlockReason,
    now_ms: i64,
) -> EngineResult<()> {
    sqlx::query(
        "INSERT INTO recheck_queue (partition_key, reason_type, available_at_ms, attempts) \
         VALUES (?1, ?2, ?3, 0) \
         ON CONFLICT(partition_key) DO UPDATE SET \
             available_at_ms = MIN(recheck_queue.available_at_ms, excluded.available_at_ms)",
    )
    .bind(reason.partition_key())
    .bind(reason.kind.as_str())
    .bind(now_ms)
    .execute(&mut *conn)
    .await
    .map_err(|e| EngineError::from(map_sqlx_error("push recheck marker", e)))?;
    Ok(())
}

/// Retain a dead envelope in `unknown_events`, in its own transaction (the
/// transaction it died in has already rolled back).
pub async fn dead_letter(
    store: &Store,
    envelope_json: &str,
    reason: &str,
    now_ms: i64,
) -> EngineResult<()> {
    let event_id: Option<Vec<u8>> = serde_json::from_str::<JsonValue>(envelope_json)
        .ok()
        .and_then(|v| {
            v.get("event_id")
                .and_then(JsonValue::as_str)
                .and_then(|s| hex::decode(s).ok())
        });

    let mut txn = store.begin_immediate().await?;
    sqlx::query(
        "INSERT INTO unknown_events (event_id, envelope, reason, created_at_ms) \
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(event_id)
    .bind(envelope_json)
    .bind(reason)
    .bind(now_ms)
    .execute(txn.conn())
    .await
    .map_err(|e| EngineError::from(map_sqlx_error("dead letter", e)))?;
    txn.commit().await?;
    warn!(reason, "envelope dead-lettered");
    Ok(())
}

struct ClaimedPartition {
    reason_type: String,
    reason_key: String,
    attempts: i64,
}

/// Claim the next due partition: read and delete its marker atomically.
async fn claim_due_partition(
    store: &Store,
    now_ms: i64,
) -> EngineResult<Option<ClaimedPartition>> {
    let mut txn = store.begin_immediate().await?;
    let row = sqlx::query(
        "SELECT partition_key, reason_type, attempts FROM recheck_queue \
         WHERE available_at_ms <= ?1 ORDER BY available_at_ms ASC LIMIT 1",
    )
    .bind(now_ms)
    .fetch_optional(txn.conn())
    .await
    .map_err(|e| EngineError::from(map_sqlx_error("claim partition", e)))?;

    let Some(row) = row else {
        txn.rollback().await?;
        return Ok(None);
    };
    let partition_key: String = row.get("partition_key");
    let reason_type: String = row.get("reason_type");
    let attempts: i64 = row.get("attempts");

    sqlx::query("DELETE FROM recheck_queue WHERE partition_key = ?1")
        .bind(&partition_key)
        .execute(txn.conn())
        .await
        .map_err(|e| EngineError::from(map_sqlx_error("delete marker", e)))?;
    txn.commit().await?;

    let reason_key = partition_key
        .strip_prefix(&format!("{reason_type}:"))
        .unwrap_or_default()
        .to_string();
    Ok(Some(ClaimedPartition {
        reason_type,
        reason_key,
        attempts,
    }))
}

/// Re-arm a partition that still has blocked rows, with exponential backoff.
async fn re_arm_partition(
    store: &Store,
    partition: &ClaimedPartition,
    now_ms: i64,
) -> EngineResult<()> {
    let attempts = partition.attempts + 1;
    let delay = (RECHECK_BACKOFF_BASE_MS << attempts.min(16)).min(RECHECK_BACKOFF_CAP_MS);

    let mut txn = store.begin_immediate().await?;
    sqlx::query(
        "INSERT INTO recheck_queue (partition_key, reason_type, available_at_ms, attempts) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(partition_key) DO UPDATE SET \
             available_at_ms = MIN(recheck_queue.available_at_ms, excluded.available_at_ms), \
             attempts = excluded.attempts",
    )
    .bind(format!("{}:{}", partition.reason_type, partition.reason_key))
    .bind(&partition.reason_type)
    .bind(now_ms + delay)
    .bind(attempts)
    .execute(txn.conn())
    .await
    .map_err(|e| EngineError::from(map_sqlx_error("re-arm marker", e)))?;
    txn.commit().await?;
    Ok(())
}

/// Drain due recheck partitions, re-driving each parked envelope through the
/// pipeline from where it stopped. Returns the number of envelopes
/// re-driven. The caller holds the `tick` lease; `lease` makes this loop
/// renew it at half period.
pub async fn drain(
    store: &Store,
    pipeline: &Pipeline,
    cache: &TransitCache,
    clock: &dyn Clock,
    lease: Option<&LeaseRenewal<'_>>,
) -> EngineResult<usize> {
    let mut processed = 0usize;

    loop {
        if let Some(renewal) = lease {
            renew_lease(store, renewal, clock.now_ms()).await?;
        }

        let now = clock.now_ms();
        let Some(partition) = claim_due_partition(store, now).await? else {
            break;
        };
        debug!(
            partition = format!("{}:{}", partition.reason_type, partition.reason_key),
            "draining recheck partition"
        );

        // FIFO over the partition's parked envelopes.
        let items: Vec<(i64, String)> = {
            let mut reader = store.reader().await?;
            sqlx::query(
                "SELECT id, envelope FROM blocked \
                 WHERE reason_type = ?1 AND reason_key = ?2 ORDER BY id ASC",
            )
            .bind(&partition.reason_type)
            .bind(&partition.reason_key)
            .fetch_all(&mut *reader)
            .await
            .map_err(|e| EngineError::from(map_sqlx_error("list blocked", e)))?
            .iter()
            .map(|r| (r.get::<i64, _>("id"), r.get::<String, _>("envelope")))
            .collect()
        };

        let mut still_blocked = false;
        for (id, envelope_json) in items {
            let now = clock.now_ms();
            cache.sweep(now);

            let mut txn = store.begin_immediate().await?;
            let deleted = sqlx::query("DELETE FROM blocked WHERE id = ?1")
                .bind(id)
                .execute(txn.conn())
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("claim blocked row", e)))?;
            if deleted.rows_affected() == 0 {
                txn.rollback().await?;
                continue;
            }

            let mut env: Envelope = match serde_json::from_str(&envelope_json) {
                Ok(env) => env,
                Err(e) => {
                    txn.commit().await?;
                    dead_letter(store, &envelope_json, &format!("undecodable: {e}"), now).await?;
                    continue;
                }
            };
            env.state = if env.event_plaintext.is_some() {
                EnvelopeState::Opened
            } else {
                EnvelopeState::TransitDecrypted
            };

            match pipeline.run_batch(txn.conn(), cache, now, vec![env]).await {
                Ok(outcome) => {
                    if !outcome.blocked.is_empty() {
                        still_blocked = true;
                    }
                    txn.commit().await?;
                    processed += 1;
                }
                Err(EngineError::Projector {
                    kind,
                    message,
                    envelope,
                }) => {
                    txn.rollback().await?;
                    dead_letter(store, &envelope, &format!("projector {kind}: {message}"), now)
                        .await?;
                    processed += 1;
                }
                Err(e) => {
                    txn.rollback().await?;
                    return Err(e);
                }
            }
        }

        if still_blocked {
            re_arm_partition(store, &partition, clock.now_ms()).await?;
        }
    }

    if processed > 0 {
        info!(processed, "recheck drain complete");
    }
    Ok(processed)
}
