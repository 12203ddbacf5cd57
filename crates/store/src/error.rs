//! Storage error model and sqlx error mapping.
//!
//! SQLite errors are mapped to `StorageError` as follows:
//!
//! | SQLite condition | Result code | StorageError | Scenario |
//! |------------------|-------------|--------------|----------|
//! | Busy / locked | `5`, `6`, `261`, `517` | `Busy` | Another writer holds the lock; retried with backoff |
//! | Unique violation | `1555`, `2067` | `Constraint` | Duplicate `event_id` (idempotent success at call sites) |
//! | FK / check violation | `787`, `275` | `Constraint` | Referential breakage |
//! | Generic SQL error | `1` | `Schema` | Missing table/column, schema drift |
//! | Everything else | any | `Io` | Disk, pool, connection failures |

use thiserror::Error;

/// Result type for the storage layer.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The database was locked by another writer past the retry budget.
    #[error("database busy: {0}")]
    Busy(String),

    /// A uniqueness/foreign-key/check constraint fired.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The statement referenced objects the schema does not have.
    #[error("schema error: {0}")]
    Schema(String),

    /// Disk or connection level failure; fatal to the current transaction.
    #[error("storage io error: {0}")]
    Io(String),
}

const BUSY_CODES: &[&str] = &["5", "6", "261", "517"];
const CONSTRAINT_CODES: &[&str] = &["787", "275", "1555", "2067"];

/// Map an sqlx error to `StorageError`, tagging the failing operation.
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            if let Some(code) = db_err.code() {
                let code = code.as_ref();
                if BUSY_CODES.contains(&code) {
                    return StorageError::Busy(msg);
                }
                if CONSTRAINT_CODES.contains(&code) || db_err.is_unique_violation() {
                    return StorageError::Constraint(msg);
                }
                if code == "1" {
                    return StorageError::Schema(msg);
                }
            } else if db_err.is_unique_violation() {
                return StorageError::Constraint(msg);
            }
            StorageError::Io(msg)
        }
        sqlx::Error::PoolTimedOut => {
            StorageError::Busy(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            StorageError::Io(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Io(e) => StorageError::Io(format!("io error in {operation}: {e}")),
        sqlx::Error::RowNotFound => {
            StorageError::Io(format!("unexpected row not found in {operation}"))
        }
        _ => StorageError::Io(format!("sqlx error in {operation}: {err}")),
    }
}

/// True when the error is a uniqueness violation, the idempotent-insert
/// success case for duplicate `event_id`s.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.is_unique_violation();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_maps_to_busy() {
        let mapped = map_sqlx_error("acquire", sqlx::Error::PoolTimedOut);
        assert!(matches!(mapped, StorageError::Busy(_)));
    }

    #[test]
    fn row_not_found_maps_to_io() {
        let mapped = map_sqlx_error("fetch", sqlx::Error::RowNotFound);
        assert!(matches!(mapped, StorageError::Io(_)));
    }
}
