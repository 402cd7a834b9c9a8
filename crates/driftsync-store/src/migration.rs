//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(from = current, to = CURRENT_VERSION, "migrated store schema");
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Current per-device sequence state
        CREATE TABLE device_seq (
            device_name TEXT PRIMARY KEY,     -- device identity, URI form
            seq INTEGER NOT NULL DEFAULT 0,   -- highest known sequence number
            locator TEXT,                     -- routing hint, not hashed
            updated_at INTEGER NOT NULL
        );

        -- Every digest ever computed
        CREATE TABLE digest_log (
            digest BLOB PRIMARY KEY,          -- 32 bytes
            recorded_at INTEGER NOT NULL
        );

        -- The snapshot each digest summarizes
        CREATE TABLE digest_snapshot (
            digest BLOB NOT NULL,
            device_name TEXT NOT NULL,
            seq INTEGER NOT NULL,
            PRIMARY KEY (digest, device_name)
        );

        -- Outstanding fetch tasks
        CREATE TABLE fetch_tasks (
            producer TEXT NOT NULL,
            base_name TEXT NOT NULL,
            min_seq INTEGER NOT NULL,
            max_seq INTEGER NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (producer, base_name)
        );

        CREATE INDEX idx_digest_log_recorded ON digest_log(recorded_at);
        "#,
    )?;

    Ok(())
}

/// Get current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
