//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of an outbox row.
///
/// `Done` and `Failed` are terminal: no query moves a row out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl Default for OutboxStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbox event - one domain event awaiting hand-off to the integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub available_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Stable key the consumer uses to dedupe redeliveries.
    pub fn integration_event_key(&self) -> String {
        integration_event_key(&self.event_type, self.id)
    }
}

/// Build the `"{type}:{id}"` idempotency key.
pub fn integration_event_key(event_type: &str, id: i64) -> String {
    format!("{}:{}", event_type, id)
}

/// New outbox event for insertion.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub payload: Value,
}

impl NewOutboxEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.done + self.failed
    }

    pub(crate) fn add(&mut self, status: OutboxStatus, count: u64) {
        match status {
            OutboxStatus::Pending => self.pending += count,
            OutboxStatus::Processing => self.processing += count,
            OutboxStatus::Done => self.done += count,
            OutboxStatus::Failed => self.failed += count,
        }
    }
}

/// Outcome of a stale-processing sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Rows returned to `pending` for another attempt.
    pub requeued: Vec<i64>,
    /// Rows that had no attempts left and were marked `failed`.
    pub failed: Vec<i64>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Immutable view of a row handed to the integration sink.
///
/// Captured inside the Stage A transaction so the sink never touches the
/// database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliverySnapshot {
    pub id: i64,
    pub integration_event_key: String,
    pub event_type: String,
    pub payload: Value,
    pub attempt: u32,
}

/// Result of opening a delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptStart {
    /// No row with that id.
    Missing,
    /// Row is already `done` or `failed`.
    AlreadyTerminal(OutboxStatus),
    /// Row ran out of attempts and was marked `failed`.
    Exhausted { attempts: u32 },
    /// Row is `processing` and ready to deliver.
    Started(DeliverySnapshot),
}

/// Result of resolving a failed delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureResolution {
    /// Back to `pending`, gated until `available_at`.
    Rescheduled {
        attempts: u32,
        available_at: DateTime<Utc>,
    },
    /// Terminal failure.
    Failed { attempts: u32 },
    /// Row was not `processing`; nothing changed.
    Ignored(OutboxStatus),
    /// No row with that id.
    Missing,
}

/// Convert a timestamp to the stored integer form.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Parse a stored millisecond timestamp. `None` when out of range.
pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}
