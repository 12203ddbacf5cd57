//! The node: the API surface every front-end and transport talks to.
//!
//! Three entry points converge on the one pipeline: `submit_command` (local
//! front-ends), `ingest_datagram` (the transport), and the scheduler's jobs.
//! `query` serves read-only snapshots from the reader pool.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use sqlx::Row;
use tracing::{info, instrument};

use quiet_core::{Clock, EventId, SystemClock};
use quiet_protocol::wire::InviteLink;
use quiet_protocol::{registry, Ctx, Envelope};
use quiet_store::{map_sqlx_error, Store, StoreConfig};

use crate::blocked;
use crate::cache::TransitCache;
use crate::error::{EngineError, EngineResult};
use crate::outgoing::{self, OutgoingDatagram};
use crate::pipeline::{Pipeline, RunOutcome};
use crate::scheduler::{self, JobConfig, SchedulerHandle};

/// Summary returned to command issuers.
#[derive(Debug, Clone, Serialize)]
pub struct CommandReceipt {
    pub success: bool,
    pub error: Option<String>,
    pub event_ids: Vec<EventId>,
    pub projected: Vec<EventId>,
    pub blocked: usize,
}

impl CommandReceipt {
    fn from_outcome(outcome: RunOutcome) -> Self {
        Self {
            success: true,
            error: None,
            event_ids: outcome.event_ids,
            projected: outcome.projected,
            blocked: outcome.blocked.len(),
        }
    }

    fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            event_ids: Vec::new(),
            projected: Vec::new(),
            blocked: 0,
        }
    }
}

/// One process-wide node over one store. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    store: Store,
    pipeline: Arc<Pipeline>,
    cache: Arc<TransitCache>,
    clock: Arc<dyn Clock>,
}

impl Node {
    /// Open (creating if missing) with the system clock.
    pub async fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        Self::open_with(StoreConfig::new(path), Arc::new(SystemClock)).await
    }

    pub async fn open_with(config: StoreConfig, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        let store = Store::open_with(config).await?;
        let ddl = registry().projection_ddl();
        store.init_schema(&ddl).await?;
        info!("node opened");

        Ok(Self {
            store,
            pipeline: Arc::new(Pipeline::new()),
            cache: Arc::new(TransitCache::new()),
            clock,
        })
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub(crate) fn cache(&self) -> &TransitCache {
        &self.cache
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Build and run a local command. The command's envelopes and their
    /// projections commit together; failures roll the whole batch back and
    /// surface as an unsuccessful receipt with a coarse category.
    #[instrument(skip(self, params))]
    pub async fn submit_command(
        &self,
        command: &str,
        params: JsonValue,
    ) -> EngineResult<CommandReceipt> {
        let kind = match registry().kind_for_command(command) {
            Ok(kind) => kind,
            Err(e) => return Ok(CommandReceipt::rejected(e.to_string())),
        };

        let mut txn = self.store.begin_immediate().await?;
        let now = self.now_ms();
        self.cache.sweep(now);

        let built = {
            let mut ctx = Ctx::new(txn.conn(), now);
            kind.command(params, &mut ctx).await
        };
        let envelopes = match built {
            Ok(envelopes) => envelopes,
            Err(e) => {
                txn.rollback().await?;
                let err = EngineError::from(e);
                return Ok(CommandReceipt::rejected(format!(
                    "{}: {err}",
                    err.category()
                )));
            }
        };

        match self
            .pipeline
            .run_batch(txn.conn(), &self.cache, now, envelopes)
            .await
        {
            Ok(outcome) => {
                txn.commit().await?;
                Ok(CommandReceipt::from_outcome(outcome))
            }
            Err(EngineError::Projector {
                kind,
                message,
                envelope,
            }) => {
                txn.rollback().await?;
                blocked::dead_letter(
                    &self.store,
                    &envelope,
                    &format!("projector {kind}: {message}"),
                    now,
                )
                .await?;
                Ok(CommandReceipt::rejected(format!("projector: {message}")))
            }
            Err(e) => {
                txn.rollback().await?;
                Err(e)
            }
        }
    }

    /// Ingest one transport datagram: journal it in `incoming`, run the
    /// pipeline over it, and clear the journal row, all in one transaction.
    #[instrument(skip(self, bytes, origin), fields(len = bytes.len()))]
    pub async fn ingest_datagram(
        &self,
        bytes: Vec<u8>,
        origin: Option<(String, u16)>,
    ) -> EngineResult<RunOutcome> {
        let mut txn = self.store.begin_immediate().await?;
        let now = self.now_ms();
        self.cache.sweep(now);

        let (ip, port) = match origin {
            Some((ip, port)) => (Some(ip), Some(port)),
            None => (None, None),
        };

        let inserted = sqlx::query(
            "INSERT INTO incoming (blob, origin, created_at_ms) VALUES (?1, ?2, ?3)",
        )
        .bind(&bytes[..])
        .bind(ip.clone())
        .bind(now)
        .execute(txn.conn())
        .await
        .map_err(|e| EngineError::from(map_sqlx_error("journal incoming", e)))?;
        let row_id = inserted.last_insert_rowid();

        let envelope = Envelope::incoming(bytes, ip, port);
        match self
            .pipeline
            .run_batch(txn.conn(), &self.cache, now, vec![envelope])
            .await
        {
            Ok(outcome) => {
                sqlx::query("DELETE FROM incoming WHERE id = ?1")
                    .bind(row_id)
                    .execute(txn.conn())
                    .await
                    .map_err(|e| EngineError::from(map_sqlx_error("clear incoming", e)))?;
                txn.commit().await?;
                Ok(outcome)
            }
            Err(EngineError::Projector {
                kind,
                message,
                envelope,
            }) => {
                txn.rollback().await?;
                blocked::dead_letter(
                    &self.store,
                    &envelope,
                    &format!("projector {kind}: {message}"),
                    now,
                )
                .await?;
                Ok(RunOutcome::default())
            }
            Err(e) => {
                txn.rollback().await?;
                Err(e)
            }
        }
    }

    /// Run one envelope in its own transaction (scheduler jobs).
    pub(crate) async fn run_envelope(&self, envelope: Envelope) -> EngineResult<RunOutcome> {
        let mut txn = self.store.begin_immediate().await?;
        let now = self.now_ms();
        self.cache.sweep(now);

        match self
            .pipeline
            .run_batch(txn.conn(), &self.cache, now, vec![envelope])
            .await
        {
            Ok(outcome) => {
                txn.commit().await?;
                Ok(outcome)
            }
            Err(EngineError::Projector {
                kind,
                message,
                envelope,
            }) => {
                txn.rollback().await?;
                blocked::dead_letter(
                    &self.store,
                    &envelope,
                    &format!("projector {kind}: {message}"),
                    now,
                )
                .await?;
                Ok(RunOutcome::default())
            }
            Err(e) => {
                txn.rollback().await?;
                Err(e)
            }
        }
    }

    /// Drain the recheck queue once, without the scheduler (tests and
    /// embedders that run their own cadence).
    pub async fn run_recheck(&self) -> EngineResult<usize> {
        blocked::drain(&self.store, &self.pipeline, &self.cache, &*self.clock, None).await
    }

    /// Emit one round of sync requests: build under one short transaction,
    /// then pipe each envelope in its own. The scheduler's `sync` job calls
    /// this on its cadence.
    pub async fn run_sync(&self) -> EngineResult<usize> {
        let envelopes = {
            let mut txn = self.store.begin_immediate().await?;
            let now = self.now_ms();
            self.cache.sweep(now);
            let result = {
                let mut ctx = Ctx::new(txn.conn(), now);
                quiet_protocol::kinds::sync::sync_job(&mut ctx).await
            };
            match result {
                Ok(envelopes) => {
                    txn.commit().await?;
                    envelopes
                }
                Err(e) => {
                    txn.rollback().await?;
                    return Err(e.into());
                }
            }
        };

        let count = envelopes.len();
        for envelope in envelopes {
            self.run_envelope(envelope).await?;
        }
        Ok(count)
    }

    /// Due outgoing datagrams for the transport.
    pub async fn drain_outgoing(&self, limit: i64) -> EngineResult<Vec<OutgoingDatagram>> {
        outgoing::drain(&self.store, &self.cache, &*self.clock, limit).await
    }

    pub async fn mark_sent(&self, id: i64) -> EngineResult<()> {
        outgoing::mark_sent(&self.store, id).await
    }

    pub async fn mark_failed(&self, id: i64) -> EngineResult<()> {
        outgoing::mark_failed(&self.store, &*self.clock, id).await
    }

    /// Start the periodic scheduler (sync emission, recheck drain, queue GC).
    pub fn spawn_scheduler(&self, config: JobConfig) -> SchedulerHandle {
        scheduler::spawn(self.clone(), config)
    }

    /// Read-only named queries over the projection tables, served from the
    /// reader pool. Ids and keys are hex in and hex out.
    pub async fn query(&self, name: &str, params: JsonValue) -> EngineResult<Vec<JsonValue>> {
        let mut conn = self.store.reader().await?;

        let id_param = |field: &str| -> Option<Vec<u8>> {
            params
                .get(field)
                .and_then(JsonValue::as_str)
                .and_then(|s| hex::decode(s).ok())
        };

        let rows = match name {
            "networks" => {
                sqlx::query(
                    "SELECT network_id, name, creator_pubkey, created_at_ms FROM networks \
                     ORDER BY created_at_ms ASC",
                )
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query networks", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "network_id": hex::encode(r.get::<Vec<u8>, _>("network_id")),
                        "name": r.get::<String, _>("name"),
                        "creator_pubkey": hex::encode(r.get::<Vec<u8>, _>("creator_pubkey")),
                        "created_at_ms": r.get::<i64, _>("created_at_ms"),
                    })
                })
                .collect()
            }
            "users" => {
                sqlx::query(
                    "SELECT user_id, network_id, name, pubkey, created_at_ms FROM users \
                     WHERE (?1 IS NULL OR network_id = ?1) \
                     ORDER BY created_at_ms ASC, user_id ASC",
                )
                .bind(id_param("network_id"))
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query users", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "user_id": hex::encode(r.get::<Vec<u8>, _>("user_id")),
                        "network_id": hex::encode(r.get::<Vec<u8>, _>("network_id")),
                        "name": r.get::<String, _>("name"),
                        "pubkey": hex::encode(r.get::<Vec<u8>, _>("pubkey")),
                        "created_at_ms": r.get::<i64, _>("created_at_ms"),
                    })
                })
                .collect()
            }
            "groups" => {
                sqlx::query(
                    "SELECT group_id, network_id, name, creator_pubkey, created_at_ms FROM groups \
                     WHERE (?1 IS NULL OR network_id = ?1) \
                     ORDER BY created_at_ms ASC, group_id ASC",
                )
                .bind(id_param("network_id"))
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query groups", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "group_id": hex::encode(r.get::<Vec<u8>, _>("group_id")),
                        "network_id": hex::encode(r.get::<Vec<u8>, _>("network_id")),
                        "name": r.get::<String, _>("name"),
                        "creator_pubkey": hex::encode(r.get::<Vec<u8>, _>("creator_pubkey")),
                        "created_at_ms": r.get::<i64, _>("created_at_ms"),
                    })
                })
                .collect()
            }
            "channels" => {
                sqlx::query(
                    "SELECT channel_id, group_id, network_id, name, created_at_ms FROM channels \
                     WHERE (?1 IS NULL OR group_id = ?1) AND (?2 IS NULL OR network_id = ?2) \
                     ORDER BY created_at_ms ASC, channel_id ASC",
                )
                .bind(id_param("group_id"))
                .bind(id_param("network_id"))
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query channels", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "channel_id": hex::encode(r.get::<Vec<u8>, _>("channel_id")),
                        "group_id": hex::encode(r.get::<Vec<u8>, _>("group_id")),
                        "network_id": hex::encode(r.get::<Vec<u8>, _>("network_id")),
                        "name": r.get::<String, _>("name"),
                        "created_at_ms": r.get::<i64, _>("created_at_ms"),
                    })
                })
                .collect()
            }
            "messages" => {
                sqlx::query(
                    "SELECT message_id, channel_id, sender_pubkey, text, created_at_ms \
                     FROM messages \
                     WHERE (?1 IS NULL OR channel_id = ?1) \
                     ORDER BY created_at_ms ASC, message_id ASC",
                )
                .bind(id_param("channel_id"))
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query messages", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "message_id": hex::encode(r.get::<Vec<u8>, _>("message_id")),
                        "channel_id": hex::encode(r.get::<Vec<u8>, _>("channel_id")),
                        "sender_pubkey": hex::encode(r.get::<Vec<u8>, _>("sender_pubkey")),
                        "text": r.get::<String, _>("text"),
                        "created_at_ms": r.get::<i64, _>("created_at_ms"),
                    })
                })
                .collect()
            }
            "peers" => {
                sqlx::query(
                    "SELECT pubkey, network_id, created_at_ms, last_synced_ms FROM peers \
                     WHERE (?1 IS NULL OR network_id = ?1) \
                     ORDER BY created_at_ms ASC, pubkey ASC",
                )
                .bind(id_param("network_id"))
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query peers", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "pubkey": hex::encode(r.get::<Vec<u8>, _>("pubkey")),
                        "network_id": hex::encode(r.get::<Vec<u8>, _>("network_id")),
                        "created_at_ms": r.get::<i64, _>("created_at_ms"),
                        "last_synced_ms": r.get::<i64, _>("last_synced_ms"),
                    })
                })
                .collect()
            }
            "invites" => {
                sqlx::query(
                    "SELECT invite_pubkey, network_id, group_id, scope, created_at_ms \
                     FROM invites \
                     WHERE (?1 IS NULL OR network_id = ?1) \
                     ORDER BY created_at_ms ASC",
                )
                .bind(id_param("network_id"))
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query invites", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "invite_pubkey": hex::encode(r.get::<Vec<u8>, _>("invite_pubkey")),
                        "network_id": hex::encode(r.get::<Vec<u8>, _>("network_id")),
                        "group_id": hex::encode(r.get::<Vec<u8>, _>("group_id")),
                        "scope": r.get::<String, _>("scope"),
                        "created_at_ms": r.get::<i64, _>("created_at_ms"),
                    })
                })
                .collect()
            }
            "invite_link" => {
                // Only works for invites this node created: the secret is
                // local-only.
                let Some(invite_pubkey) = id_param("invite_pubkey") else {
                    return Err(EngineError::CommandRejected(
                        "invite_link requires invite_pubkey".into(),
                    ));
                };
                let row = sqlx::query(
                    "SELECT network_id, group_id, secret FROM invites \
                     WHERE invite_pubkey = ?1 AND secret IS NOT NULL",
                )
                .bind(&invite_pubkey[..])
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query invite link", e)))?;

                match row {
                    Some(r) => {
                        let link = InviteLink {
                            network_id: EventId::from_slice(&r.get::<Vec<u8>, _>("network_id"))
                                .map_err(|e| EngineError::Transport(e.to_string()))?,
                            group_id: EventId::from_slice(&r.get::<Vec<u8>, _>("group_id"))
                                .map_err(|e| EngineError::Transport(e.to_string()))?,
                            secret: r.get::<Vec<u8>, _>("secret"),
                        };
                        vec![json!({ "invite_link": link.encode() })]
                    }
                    None => Vec::new(),
                }
            }
            "identities" => {
                sqlx::query(
                    "SELECT pubkey, network_id, name, created_at_ms FROM identities \
                     ORDER BY created_at_ms ASC",
                )
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query identities", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "pubkey": hex::encode(r.get::<Vec<u8>, _>("pubkey")),
                        "network_id": r
                            .get::<Option<Vec<u8>>, _>("network_id")
                            .map(hex::encode),
                        "name": r.get::<String, _>("name"),
                        "created_at_ms": r.get::<i64, _>("created_at_ms"),
                    })
                })
                .collect()
            }
            "blobs" => {
                sqlx::query(
                    "SELECT blob_id, channel_id, name, size, slice_count, created_at_ms \
                     FROM blobs WHERE (?1 IS NULL OR channel_id = ?1) \
                     ORDER BY created_at_ms ASC",
                )
                .bind(id_param("channel_id"))
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query blobs", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "blob_id": hex::encode(r.get::<Vec<u8>, _>("blob_id")),
                        "channel_id": hex::encode(r.get::<Vec<u8>, _>("channel_id")),
                        "name": r.get::<String, _>("name"),
                        "size": r.get::<i64, _>("size"),
                        "slice_count": r.get::<i64, _>("slice_count"),
                        "created_at_ms": r.get::<i64, _>("created_at_ms"),
                    })
                })
                .collect()
            }
            "events" => {
                sqlx::query(
                    "SELECT event_id, event_type, network_id, created_at_ms, payload_blob \
                     FROM events \
                     WHERE (?1 IS NULL OR network_id = ?1) \
                     ORDER BY created_at_ms ASC, event_id ASC",
                )
                .bind(id_param("network_id"))
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query events", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "event_id": hex::encode(r.get::<Vec<u8>, _>("event_id")),
                        "event_type": r.get::<String, _>("event_type"),
                        "network_id": r.get::<Option<Vec<u8>>, _>("network_id").map(hex::encode),
                        "created_at_ms": r.get::<i64, _>("created_at_ms"),
                        "payload_blob": hex::encode(r.get::<Vec<u8>, _>("payload_blob")),
                    })
                })
                .collect()
            }
            "blob_slices" => {
                sqlx::query(
                    "SELECT blob_id, slice_index, data, created_at_ms FROM blob_slices \
                     WHERE (?1 IS NULL OR blob_id = ?1) \
                     ORDER BY blob_id ASC, slice_index ASC",
                )
                .bind(id_param("blob_id"))
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query blob slices", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "blob_id": hex::encode(r.get::<Vec<u8>, _>("blob_id")),
                        "slice_index": r.get::<i64, _>("slice_index"),
                        "data": hex::encode(r.get::<Vec<u8>, _>("data")),
                        "created_at_ms": r.get::<i64, _>("created_at_ms"),
                    })
                })
                .collect()
            }
            "addresses" => {
                sqlx::query(
                    "SELECT peer_pubkey, network_id, ip, port, updated_at_ms FROM addresses \
                     WHERE (?1 IS NULL OR network_id = ?1) \
                     ORDER BY peer_pubkey ASC",
                )
                .bind(id_param("network_id"))
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query addresses", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "peer_pubkey": hex::encode(r.get::<Vec<u8>, _>("peer_pubkey")),
                        "network_id": hex::encode(r.get::<Vec<u8>, _>("network_id")),
                        "ip": r.get::<String, _>("ip"),
                        "port": r.get::<i64, _>("port"),
                        "updated_at_ms": r.get::<i64, _>("updated_at_ms"),
                    })
                })
                .collect()
            }
            "blocked" => {
                sqlx::query(
                    "SELECT id, reason_type, reason_key, event_id, created_at_ms FROM blocked \
                     ORDER BY id ASC",
                )
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query blocked", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "id": r.get::<i64, _>("id"),
                        "reason_type": r.get::<String, _>("reason_type"),
                        "reason_key": r.get::<String, _>("reason_key"),
                        "event_id": r.get::<Option<Vec<u8>>, _>("event_id").map(hex::encode),
                        "created_at_ms": r.get::<i64, _>("created_at_ms"),
                    })
                })
                .collect()
            }
            "outgoing" => {
                sqlx::query(
                    "SELECT id, recipient, sent, retry_count, next_retry FROM outgoing \
                     ORDER BY id ASC",
                )
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| EngineError::from(map_sqlx_error("query outgoing", e)))?
                .iter()
                .map(|r| {
                    json!({
                        "id": r.get::<i64, _>("id"),
                        "recipient": hex::encode(r.get::<Vec<u8>, _>("recipient")),
                        "sent": r.get::<i64, _>("sent") != 0,
                        "retry_count": r.get::<i64, _>("retry_count"),
                        "next_retry": r.get::<i64, _>("next_retry"),
                    })
                })
                .collect()
            }
            other => return Err(EngineError::UnknownQuery(other.to_string())),
        };

        Ok(rows)
    }
}
