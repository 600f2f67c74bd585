//! SQLite storage for the transactional outbox.
//!
//! This crate provides:
//! - The `outbox_events` schema and versioned migrations
//! - Model types (`OutboxEvent`, `OutboxStatus`, delivery snapshots)
//! - State-machine queries that move rows between `pending`,
//!   `processing`, `done` and `failed`
//! - A synchronous `Database` handle and an async `AsyncDatabase` executor
//!
//! # Architecture
//!
//! Every transition is a guarded SQL statement or an `IMMEDIATE`
//! transaction, so two workers pointed at the same file can never claim
//! or resolve the same row twice.
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let ids = db.call(move |conn| queries::claim_pending(conn, 50, Utc::now())).await?;
//! ```
//!
//! **Important**: Only SQL operations should run inside `db.call()`.
//! Integration calls happen outside, after the transaction has committed.

mod db;
mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use db::Database;
pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::run_migrations;
pub use models::*;
