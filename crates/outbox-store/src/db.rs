//! Synchronous database handle.

use crate::{
    migrations, queries, AttemptStart, DatabaseResult, FailureResolution, NewOutboxEvent,
    OutboxEvent, OutboxStatus, RecoveryReport, StatusCounts,
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

/// Pragmas applied to every on-disk connection.
pub(crate) const FILE_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA cache_size = -64000;
    PRAGMA temp_store = MEMORY;
    PRAGMA busy_timeout = 5000;
";

/// Database wrapper with query methods.
///
/// Used by the CLI and by tests; long-running workers use
/// [`AsyncDatabase`](crate::AsyncDatabase) instead.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path, running migrations if needed.
    pub fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(FILE_PRAGMAS)?;
        migrations::run_migrations(&conn)?;

        info!(path = %path.display(), "Database opened");
        Ok(Self { conn })
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        // WAL does not apply to in-memory databases
        conn.execute_batch(
            "
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ==========================================
    // Outbox events
    // ==========================================

    pub fn insert_pending(&self, event: &NewOutboxEvent) -> DatabaseResult<OutboxEvent> {
        queries::insert_pending(&self.conn, event, Utc::now())
    }

    pub fn get_event(&self, id: i64) -> DatabaseResult<Option<OutboxEvent>> {
        queries::get_event(&self.conn, id)
    }

    pub fn list_events(
        &self,
        status: Option<OutboxStatus>,
        limit: usize,
    ) -> DatabaseResult<Vec<OutboxEvent>> {
        queries::list_events(&self.conn, status, limit)
    }

    pub fn count_by_status(&self) -> DatabaseResult<StatusCounts> {
        queries::count_by_status(&self.conn)
    }

    pub fn recover_stale_processing(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
        max_attempts: u32,
    ) -> DatabaseResult<RecoveryReport> {
        queries::recover_stale_processing(&self.conn, now, stale_after, max_attempts)
    }

    pub fn claim_pending(&self, limit: usize, now: DateTime<Utc>) -> DatabaseResult<Vec<i64>> {
        queries::claim_pending(&self.conn, limit, now)
    }

    pub fn begin_attempt(
        &self,
        id: i64,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> DatabaseResult<AttemptStart> {
        queries::begin_attempt(&self.conn, id, max_attempts, now)
    }

    pub fn mark_done(&self, id: i64, now: DateTime<Utc>) -> DatabaseResult<bool> {
        queries::mark_done(&self.conn, id, now)
    }

    pub fn mark_retry_or_failed<B>(
        &self,
        id: i64,
        error: &str,
        max_attempts: u32,
        backoff: B,
        now: DateTime<Utc>,
    ) -> DatabaseResult<FailureResolution>
    where
        B: Fn(u32) -> Duration,
    {
        queries::mark_retry_or_failed(&self.conn, id, error, max_attempts, backoff, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_open_in_memory_runs_migrations() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.count_by_status().unwrap(), StatusCounts::default());
    }

    #[test]
    fn test_open_file_creates_parent_and_uses_wal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("outbox.sqlite");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());

        let mode: String = db
            .connection()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_delegating_methods() {
        let db = Database::open_in_memory().unwrap();
        let event = db
            .insert_pending(&NewOutboxEvent::new("series.uploaded", json!({"series_id": 3})))
            .unwrap();

        let now = Utc::now();
        assert_eq!(db.claim_pending(10, now).unwrap(), vec![event.id]);
        assert!(db.mark_done(event.id, now).unwrap());

        let stored = db.get_event(event.id).unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Done);
        assert_eq!(db.list_events(Some(OutboxStatus::Done), 10).unwrap().len(), 1);
    }
}
