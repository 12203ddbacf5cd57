//! Core (pipeline-owned) table definitions.
//!
//! Protocol event kinds own their projection tables and contribute DDL
//! through the registry; the statements here are the infrastructure the
//! pipeline itself runs on.

/// Append-only event log plus pipeline queues. Applied idempotently on open.
pub const CORE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        event_id      BLOB NOT NULL UNIQUE,
        event_type    TEXT NOT NULL,
        network_id    BLOB,
        signer        BLOB NOT NULL,
        created_at_ms INTEGER NOT NULL,
        payload_blob  BLOB NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_events_network_created
        ON events(network_id, created_at_ms)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS incoming (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        blob          BLOB NOT NULL,
        origin        TEXT,
        created_at_ms INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outgoing (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        recipient      BLOB NOT NULL,
        blob           BLOB NOT NULL,
        transit_key_id BLOB,
        sent           INTEGER NOT NULL DEFAULT 0,
        retry_count    INTEGER NOT NULL DEFAULT 0,
        next_retry     INTEGER NOT NULL DEFAULT 0,
        created_at_ms  INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outgoing_unsent
        ON outgoing(sent, next_retry)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS blocked (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        reason_type   TEXT NOT NULL,
        reason_key    TEXT NOT NULL,
        envelope      TEXT NOT NULL,
        event_id      BLOB UNIQUE,
        created_at_ms INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_blocked_reason
        ON blocked(reason_type, reason_key)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS recheck_queue (
        partition_key   TEXT PRIMARY KEY,
        reason_type     TEXT NOT NULL,
        available_at_ms INTEGER NOT NULL,
        attempts        INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS leases (
        lease         TEXT PRIMARY KEY,
        owner         TEXT NOT NULL,
        expires_at_ms INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_runs (
        job_name    TEXT PRIMARY KEY,
        last_run_ms INTEGER NOT NULL,
        run_count   INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS unknown_events (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id      BLOB,
        envelope      TEXT NOT NULL,
        reason        TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL
    )
    "#,
];
