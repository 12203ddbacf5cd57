//! Periodic jobs over a DB-backed claim table, plus the lease protocol.
//!
//! Jobs are reflectors without a triggering event: each claims its due slot
//! in `job_runs` under a short write transaction, builds envelopes with a
//! read context, and submits them through the ordinary pipeline, one
//! transaction per envelope. Only the recheck drainer needs mutual
//! exclusion; it runs under the `tick` lease, renewed at half period on
//! monotonic time.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use sqlx::{Row, SqliteConnection};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quiet_store::{map_sqlx_error, Store};

use crate::blocked;
use crate::error::{EngineError, EngineResult};
use crate::node::Node;

/// The drainer's lease name.
pub const TICK_LEASE: &str = "tick";

/// Scheduler configuration: job frequencies and the tick cadence.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub sync_interval_ms: i64,
    pub recheck_interval_ms: i64,
    pub outgoing_gc_interval_ms: i64,
    /// How often the scheduler wakes to check for due jobs.
    pub tick_ms: u64,
    pub lease_ttl_ms: i64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 5_000,
            recheck_interval_ms: 1_000,
            outgoing_gc_interval_ms: 60_000,
            tick_ms: 250,
            lease_ttl_ms: 30_000,
        }
    }
}

/// Handle to a running scheduler task.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

pub(crate) fn spawn(node: Node, config: JobConfig) -> SchedulerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(scheduler_loop(node, config, shutdown_rx));
    SchedulerHandle {
        shutdown: shutdown_tx,
        join: Some(join),
    }
}

async fn scheduler_loop(node: Node, config: JobConfig, mut shutdown: watch::Receiver<bool>) {
    let owner = Uuid::now_v7().to_string();
    info!(%owner, "scheduler started");

    let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }

        run_due_jobs(&node, &config, &owner).await;
    }

    info!(%owner, "scheduler stopped");
}

async fn run_due_jobs(node: &Node, config: &JobConfig, owner: &str) {
    let jobs: [(&str, i64); 3] = [
        ("sync", config.sync_interval_ms),
        ("recheck", config.recheck_interval_ms),
        ("outgoing_gc", config.outgoing_gc_interval_ms),
    ];

    for (name, frequency_ms) in jobs {
        match claim_job(node.store(), name, frequency_ms, node.now_ms()).await {
            Ok(false) => continue,
            Ok(true) => {
                let result = match name {
                    "sync" => run_sync_job(node).await.map(|n| n as i64),
                    "recheck" => run_recheck_job(node, owner, config.lease_ttl_ms)
                        .await
                        .map(|n| n as i64),
                    "outgoing_gc" => run_outgoing_gc(node).await.map(|n| n as i64),
                    _ => Ok(0),
                };
                match result {
                    Ok(count) if count > 0 => debug!(job = name, count, "job ran"),
                    Ok(_) => {}
                    Err(e) => warn!(job = name, error = %e, "job failed"),
                }
            }
            Err(e) => warn!(job = name, error = %e, "job claim failed"),
        }
    }
}

/// Claim a job slot: due when `now - last_run_ms >= frequency`. The check
/// and the update share one immediate transaction, so concurrent processes
/// cannot double-claim.
pub async fn claim_job(
    store: &Store,
    name: &str,
    frequency_ms: i64,
    now_ms: i64,
) -> EngineResult<bool> {
    let mut txn = store.begin_immediate().await?;

    let last: Option<i64> = sqlx::query("SELECT last_run_ms FROM job_runs WHERE job_name = ?1")
        .bind(name)
        .fetch_optional(txn.conn())
        .await
        .map_err(|e| EngineError::from(map_sqlx_error("read job_runs", e)))?
        .map(|row| row.get("last_run_ms"));

    if let Some(last) = last {
        if now_ms - last < frequency_ms {
            txn.rollback().await?;
            return Ok(false);
        }
    }

    sqlx::query(
        "INSERT INTO job_runs (job_name, last_run_ms, run_count) VALUES (?1, ?2, 1) \
         ON CONFLICT(job_name) DO UPDATE SET \
             last_run_ms = excluded.last_run_ms, \
             run_count = job_runs.run_count + 1",
    )
    .bind(name)
    .bind(now_ms)
    .execute(txn.conn())
    .await
    .map_err(|e| EngineError::from(map_sqlx_error("claim job", e)))?;
    txn.commit().await?;
    Ok(true)
}

/// Emit sync requests via the node's public entry point.
async fn run_sync_job(node: &Node) -> EngineResult<usize> {
    node.run_sync().await
}

/// Drain the recheck queue under the `tick` lease.
async fn run_recheck_job(node: &Node, owner: &str, lease_ttl_ms: i64) -> EngineResult<usize> {
    let now = node.now_ms();
    let acquired = {
        let mut txn = node.store().begin_immediate().await?;
        let ok = acquire_lease(txn.conn(), TICK_LEASE, owner, now, lease_ttl_ms).await?;
        txn.commit().await?;
        ok
    };
    if !acquired {
        return Ok(0);
    }

    let renewal = LeaseRenewal::new(TICK_LEASE, owner, lease_ttl_ms);
    let drained = blocked::drain(
        node.store(),
        node.pipeline(),
        node.cache(),
        node.clock(),
        Some(&renewal),
    )
    .await;

    let mut txn = node.store().begin_immediate().await?;
    release_lease(txn.conn(), TICK_LEASE, owner).await?;
    txn.commit().await?;

    drained
}

/// Prune delivered outgoing rows older than an hour.
async fn run_outgoing_gc(node: &Node) -> EngineResult<usize> {
    let cutoff = node.now_ms() - 3_600_000;
    let mut txn = node.store().begin_immediate().await?;
    let result = sqlx::query("DELETE FROM outgoing WHERE sent = 1 AND created_at_ms < ?1")
        .bind(cutoff)
        .execute(txn.conn())
        .await
        .map_err(|e| EngineError::from(map_sqlx_error("outgoing gc", e)))?;
    txn.commit().await?;
    Ok(result.rows_affected() as usize)
}

/// Acquire or refresh a lease: succeeds when the lease is free, expired, or
/// already ours.
pub async fn acquire_lease(
    conn: &mut SqliteConnection,
    lease: &str,
    owner: &str,
    now_ms: i64,
    ttl_ms: i64,
) -> EngineResult<bool> {
    let result = sqlx::query(
        "INSERT INTO leases (lease, owner, expires_at_ms) VALUES (?1, ?2, ?3) \
         ON CONFLICT(lease) DO UPDATE SET \
             owner = excluded.owner, \
             expires_at_ms = excluded.expires_at_ms \
         WHERE leases.expires_at_ms < ?4 OR leases.owner = excluded.owner",
    )
    .bind(lease)
    .bind(owner)
    .bind(now_ms + ttl_ms)
    .bind(now_ms)
    .execute(&mut *conn)
    .await
    .map_err(|e| EngineError::from(map_sqlx_error("acquire lease", e)))?;
    Ok(result.rows_affected() > 0)
}

pub async fn release_lease(
    conn: &mut SqliteConnection,
    lease: &str,
    owner: &str,
) -> EngineResult<()> {
    sqlx::query("DELETE FROM leases WHERE lease = ?1 AND owner = ?2")
        .bind(lease)
        .bind(owner)
        .execute(&mut *conn)
        .await
        .map_err(|e| EngineError::from(map_sqlx_error("release lease", e)))?;
    Ok(())
}

/// Half-period lease renewal state; cadence runs on monotonic time.
pub struct LeaseRenewal<'a> {
    lease: &'a str,
    owner: &'a str,
    ttl_ms: i64,
    last: Mutex<Instant>,
}

impl<'a> LeaseRenewal<'a> {
    pub fn new(lease: &'a str, owner: &'a str, ttl_ms: i64) -> Self {
        Self {
            lease,
            owner,
            ttl_ms,
            last: Mutex::new(Instant::now()),
        }
    }
}

/// Renew when half the TTL has elapsed. Losing the lease mid-drain is an
/// error: the caller must stop touching the partition queue.
pub async fn renew_lease(
    store: &Store,
    renewal: &LeaseRenewal<'_>,
    now_ms: i64,
) -> EngineResult<()> {
    let due = {
        let last = renewal.last.lock().expect("lease renewal lock");
        last.elapsed() >= Duration::from_millis((renewal.ttl_ms / 2).max(1) as u64)
    };
    if !due {
        return Ok(());
    }

    let mut txn = store.begin_immediate().await?;
    let ok = acquire_lease(txn.conn(), renewal.lease, renewal.owner, now_ms, renewal.ttl_ms).await?;
    txn.commit().await?;

    if ok {
        *renewal.last.lock().expect("lease renewal lock") = Instant::now();
        Ok(())
    } else {
        Err(EngineError::Contended("tick lease lost".into()))
    }
}
