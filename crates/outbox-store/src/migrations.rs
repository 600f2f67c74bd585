//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Schema up to date");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_events(conn)?;
    }
    if current_version < 2 {
        migrate_v2_stale_index(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: outbox_events table with the claim index.
fn migrate_v1_outbox_events(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: outbox events");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processing', 'done', 'failed')),
            attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
            available_at INTEGER,
            processed_at INTEGER,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_events_status_available_at
            ON outbox_events(status, available_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_events_type
            ON outbox_events(type);
        ",
    )?;

    record_migration(conn, 1, "outbox_events")?;
    Ok(())
}

/// V2: index backing the stale-processing sweep.
fn migrate_v2_stale_index(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: stale processing index");

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_outbox_events_status_updated_at
            ON outbox_events(status, updated_at);
        ",
    )?;

    record_migration(conn, 2, "outbox_events_stale_index")?;
    Ok(())
}
