//! The single logical writer and its immediate transactions.

use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection};
use tracing::warn;

use crate::error::{map_sqlx_error, StorageResult};

/// An open `BEGIN IMMEDIATE` transaction on the writer connection.
///
/// The write lock is taken at begin, so every statement inside runs without
/// further lock waits. Dropping without `commit`/`rollback` leaves the pooled
/// connection mid-transaction; the next `begin_immediate` clears it before
/// starting.
pub struct WriteTxn {
    conn: PoolConnection<Sqlite>,
    finished: bool,
}

impl WriteTxn {
    pub(crate) fn new(conn: PoolConnection<Sqlite>) -> Self {
        Self {
            conn,
            finished: false,
        }
    }

    /// The underlying connection, for statements inside the transaction.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    pub async fn commit(mut self) -> StorageResult<()> {
        sqlx::query("COMMIT")
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> StorageResult<()> {
        sqlx::query("ROLLBACK")
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("rollback", e))?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        if !self.finished {
            warn!("write transaction dropped without commit; next begin clears it");
        }
    }
}
