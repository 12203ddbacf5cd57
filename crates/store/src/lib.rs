//! Embedded SQLite store with one logical writer.
//!
//! On open the store configures WAL journaling, `synchronous=NORMAL`, a 30 s
//! busy timeout, foreign keys, and a ~20 MB page cache. Writers serialize on
//! a single pooled connection and use `BEGIN IMMEDIATE` so the write lock is
//! taken up front; readers get their own small pool. Busy errors retry with
//! bounded exponential backoff (5 ms start, 200 ms cap, 30 s budget).

pub mod error;
pub mod retry;
pub mod schema;
pub mod writer;

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool};
use tracing::{debug, instrument};

pub use error::{is_unique_violation, map_sqlx_error, StorageError, StorageResult};
pub use retry::{with_busy_retry, Backoff};
pub use schema::CORE_SCHEMA;
pub use writer::WriteTxn;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Size of the read-only pool; the writer always has exactly one.
    pub reader_connections: u32,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            reader_connections: 4,
            busy_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_reader_connections(mut self, n: u32) -> Self {
        self.reader_connections = n;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

/// Handle to one database file: a single-connection writer pool and a
/// read-only pool. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    writer: SqlitePool,
    readers: SqlitePool,
}

impl Store {
    /// Open (creating if missing) with default configuration.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with(StoreConfig::new(path)).await
    }

    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub async fn open_with(config: StoreConfig) -> StorageResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true)
            // Negative cache_size is KiB; -20000 is ~20 MB.
            .pragma("cache_size", "-20000");

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .map_err(|e| map_sqlx_error("open writer", e))?;

        let readers = SqlitePoolOptions::new()
            .max_connections(config.reader_connections)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("open readers", e))?;

        debug!("store opened");
        Ok(Self { writer, readers })
    }

    /// Apply the core schema plus any caller-supplied DDL. Idempotent.
    pub async fn init_schema(&self, extra: &[&str]) -> StorageResult<()> {
        let mut conn = self
            .writer
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire writer", e))?;

        for stmt in schema::CORE_SCHEMA.iter().chain(extra.iter()) {
            sqlx::query(stmt)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("init schema", e))?;
        }
        Ok(())
    }

    /// Begin an immediate write transaction, retrying busy errors.
    ///
    /// Acquiring from the one-connection pool serializes writers; the
    /// `BEGIN IMMEDIATE` then takes the database write lock up front so
    /// cross-process writers conflict here rather than mid-transaction.
    pub async fn begin_immediate(&self) -> StorageResult<WriteTxn> {
        let mut conn = self
            .writer
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire writer", e))?;

        // Clear any transaction a dropped WriteTxn left on the pooled
        // connection. Errors ("no transaction is active") are expected.
        let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;

        let mut backoff = Backoff::new();
        loop {
            match sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
                Ok(_) => return Ok(WriteTxn::new(conn)),
                Err(e) => match map_sqlx_error("begin immediate", e) {
                    StorageError::Busy(_) if backoff.can_retry() => {
                        debug!(attempts = backoff.attempts(), "writer busy, backing off");
                        backoff.wait().await;
                    }
                    other => return Err(other),
                },
            }
        }
    }

    /// A read-only connection from the reader pool.
    pub async fn reader(&self) -> StorageResult<PoolConnection<Sqlite>> {
        self.readers
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire reader", e))
    }

    /// The reader pool itself, for query layers that manage acquisition.
    pub fn reader_pool(&self) -> &SqlitePool {
        &self.readers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    async fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).await.unwrap();
        store.init_schema(&[]).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let (_dir, store) = temp_store().await;
        store.init_schema(&[]).await.unwrap();
        store.init_schema(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn insert_or_ignore_keeps_one_event_row() {
        let (_dir, store) = temp_store().await;

        for _ in 0..3 {
            let mut txn = store.begin_immediate().await.unwrap();
            sqlx::query(
                "INSERT OR IGNORE INTO events \
                 (event_id, event_type, network_id, signer, created_at_ms, payload_blob) \
                 VALUES (?1, ?2, NULL, ?3, ?4, ?5)",
            )
            .bind(&[7u8; 32][..])
            .bind("message")
            .bind(&[1u8; 32][..])
            .bind(1_000i64)
            .bind(&b"{}"[..])
            .execute(txn.conn())
            .await
            .unwrap();
            txn.commit().await.unwrap();
        }

        let mut reader = store.reader().await.unwrap();
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(&mut *reader)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("n"), 1);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let (_dir, store) = temp_store().await;

        let mut txn = store.begin_immediate().await.unwrap();
        sqlx::query("INSERT INTO incoming (blob, origin, created_at_ms) VALUES (?1, NULL, ?2)")
            .bind(&b"datagram"[..])
            .bind(1i64)
            .execute(txn.conn())
            .await
            .unwrap();
        txn.rollback().await.unwrap();

        let mut reader = store.reader().await.unwrap();
        let row = sqlx::query("SELECT COUNT(*) AS n FROM incoming")
            .fetch_one(&mut *reader)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("n"), 0);
    }

    #[tokio::test]
    async fn dropped_txn_does_not_poison_the_writer() {
        let (_dir, store) = temp_store().await;

        {
            let mut txn = store.begin_immediate().await.unwrap();
            sqlx::query("INSERT INTO incoming (blob, origin, created_at_ms) VALUES (?1, NULL, ?2)")
                .bind(&b"x"[..])
                .bind(1i64)
                .execute(txn.conn())
                .await
                .unwrap();
            // Dropped without commit.
        }

        let txn = store.begin_immediate().await.unwrap();
        txn.commit().await.unwrap();

        let mut reader = store.reader().await.unwrap();
        let row = sqlx::query("SELECT COUNT(*) AS n FROM incoming")
            .fetch_one(&mut *reader)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("n"), 0);
    }
}
