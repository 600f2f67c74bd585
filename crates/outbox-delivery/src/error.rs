//! Delivery error types.

use thiserror::Error;

/// Error raised by the claimer and dispatcher.
///
/// Integration failures are not represented here: they are recorded on the
/// row and reported through the dispatch outcome.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Storage error
    #[error("Database error: {0}")]
    Database(#[from] outbox_store::DatabaseError),

    /// Retry policy failed validation
    #[error("Invalid retry policy: {0}")]
    InvalidPolicy(String),

    /// Poll limit below one
    #[error("Invalid poll limit: {0} (must be at least 1)")]
    InvalidLimit(usize),
}

/// Result type alias using RelayError.
pub type RelayResult<T> = Result<T, RelayError>;

/// Error returned by an integration sink for a single delivery.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote answered with a non-success status
    #[error("Integration rejected delivery with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Failure requested by the event payload
    #[error("{0}")]
    Simulated(String),
}

/// Result type alias using SinkError.
pub type SinkResult<T> = Result<T, SinkError>;
