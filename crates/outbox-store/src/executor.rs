//! Async SQLite executor using a dedicated background thread.
//!
//! Each `AsyncDatabase` owns one SQLite connection living on its own
//! thread. Closures passed to [`AsyncDatabase::call`] are queued to that
//! thread and run in FIFO order while the calling task is parked.
//!
//! Clones share the same connection thread. Two independent workers
//! (or two processes) should each open their own handle; the `IMMEDIATE`
//! transactions in [`queries`](crate::queries) serialize them on the
//! database write lock.
//!
//! # Example
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//!
//! let claimed = db.call(move |conn| queries::claim_pending(conn, 50, Utc::now())).await?;
//!
//! // WRONG: never call the integration from inside call()
//! // db.call(|conn| {
//! //     let snapshot = queries::begin_attempt(conn, id, 5, Utc::now())?;
//! //     sink.deliver(&snapshot) // NO! This holds the DB thread for a network round-trip
//! // }).await;
//! ```

use crate::{migrations, DatabaseError, DatabaseResult};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

/// Convert a tokio_rusqlite::Error to DatabaseError.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => DatabaseError::Connection("Connection closed".to_string()),
        other => DatabaseError::Connection(other.to_string()),
    }
}

/// Async SQLite database with a dedicated executor thread.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: String,
}

impl AsyncDatabase {
    /// Open a database at the given path.
    ///
    /// This will:
    /// - Create the database file and parent directory if missing
    /// - Enable WAL mode and set `busy_timeout`
    /// - Run any pending migrations
    /// - Start the dedicated executor thread
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().to_string();
        info!(path = %path_str, "Opening async database");

        let conn = Connection::open(&path_str)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.execute_batch(crate::db::FILE_PRAGMAS)?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        let db = Self {
            conn,
            path: path_str,
        };

        db.call(|conn| migrations::run_migrations(conn)).await?;

        info!(path = %db.path, "Async database initialized with WAL mode");
        Ok(db)
    }

    /// Execute a closure on the database connection.
    ///
    /// The closure runs on the dedicated SQLite thread. Inside it, only run
    /// SQL and lightweight row mapping. Network calls and sleeps starve
    /// every other query on this handle.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        // The inner DatabaseResult rides inside tokio_rusqlite's Ok variant
        // and is flattened after the await.
        let outer_result = self.conn.call(move |conn| Ok(f(conn))).await;

        match outer_result {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Execute a closure that returns a rusqlite::Result.
    pub async fn call_sqlite<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)?))
            .await
            .map_err(from_tokio_rusqlite)
    }

    /// Get the database file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if the database is healthy by executing a simple query.
    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call_sqlite(|conn| conn.execute_batch("SELECT 1")).await?;
        debug!("Database health check passed");
        Ok(())
    }

    /// Close the database connection.
    ///
    /// Waits for queued operations, then shuts down the executor thread.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to close database: {:?}", e)))?;
        info!(path = %self.path, "Database closed");
        Ok(())
    }
}
