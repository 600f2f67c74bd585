//! Dispatcher: delivers one event and records the outcome.
//!
//! A dispatch runs in two stages. Stage A moves the row into `processing`
//! and snapshots it inside an `IMMEDIATE` transaction. Stage B calls the
//! integration with no transaction open, then records success or failure
//! through state-guarded updates. The sink never runs while the database
//! write lock is held.

use crate::sink::IntegrationSink;
use crate::{RelayResult, RetryPolicy};
use chrono::{DateTime, Utc};
use outbox_store::{queries, AsyncDatabase, AttemptStart, FailureResolution, OutboxStatus};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a single dispatch did.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// No row with that id.
    NotFound,
    /// Row was already `done` or `failed`; nothing happened.
    AlreadyTerminal(OutboxStatus),
    /// Row had no attempts left and was failed without calling the sink.
    Exhausted { attempts: u32 },
    /// Sink accepted the event.
    ///
    /// `recorded` is false when the row had left `processing` before the
    /// result was written; it will be redelivered and deduped downstream.
    Delivered { attempt: u32, recorded: bool },
    /// Sink failed; `resolution` is how the row was updated.
    DeliveryFailed {
        attempt: u32,
        error: String,
        resolution: FailureResolution,
    },
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

impl std::fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyTerminal(status) => write!(f, "already {}", status),
            Self::Exhausted { attempts } => {
                write!(f, "failed: retry limit reached after {} attempts", attempts)
            }
            Self::Delivered { attempt, recorded: true } => {
                write!(f, "delivered on attempt {}", attempt)
            }
            Self::Delivered { attempt, recorded: false } => {
                write!(f, "delivered on attempt {} (row no longer processing)", attempt)
            }
            Self::DeliveryFailed { attempt, error, resolution } => match resolution {
                FailureResolution::Rescheduled { available_at, .. } => write!(
                    f,
                    "attempt {} failed ({}); retry at {}",
                    attempt,
                    error,
                    available_at.to_rfc3339()
                ),
                FailureResolution::Failed { attempts } => write!(
                    f,
                    "attempt {} failed ({}); failed permanently after {} attempts",
                    attempt, error, attempts
                ),
                FailureResolution::Ignored(status) => {
                    write!(f, "attempt {} failed ({}); row already {}", attempt, error, status)
                }
                FailureResolution::Missing => {
                    write!(f, "attempt {} failed ({}); row vanished", attempt, error)
                }
            },
        }
    }
}

/// Delivers claimed events through an integration sink.
#[derive(Clone)]
pub struct Dispatcher {
    db: AsyncDatabase,
    sink: Arc<dyn IntegrationSink>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        db: AsyncDatabase,
        sink: Arc<dyn IntegrationSink>,
        policy: RetryPolicy,
    ) -> RelayResult<Self> {
        policy.validate()?;
        Ok(Self { db, sink, policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver one event.
    ///
    /// Integration failures are recorded on the row and reported in the
    /// outcome; only storage failures return `Err`.
    pub async fn dispatch(&self, event_id: i64) -> RelayResult<DispatchOutcome> {
        let max_attempts = self.policy.max_attempts;
        let now = Utc::now();

        let start = self
            .db
            .call(move |conn| queries::begin_attempt(conn, event_id, max_attempts, now))
            .await?;

        let snapshot = match start {
            AttemptStart::Missing => {
                warn!(event_id, "Outbox event not found");
                return Ok(DispatchOutcome::NotFound);
            }
            AttemptStart::AlreadyTerminal(status) => {
                debug!(event_id, status = %status, "Outbox event already resolved");
                return Ok(DispatchOutcome::AlreadyTerminal(status));
            }
            AttemptStart::Exhausted { attempts } => {
                error!(event_id, attempts, "Outbox event failed: retry limit reached");
                return Ok(DispatchOutcome::Exhausted { attempts });
            }
            AttemptStart::Started(snapshot) => snapshot,
        };

        let attempt = snapshot.attempt;
        debug!(
            event_id,
            attempt,
            key = %snapshot.integration_event_key,
            sink = self.sink.name(),
            "Delivering outbox event"
        );

        match self.sink.deliver(&snapshot).await {
            Ok(()) => {
                let now = Utc::now();
                let recorded = self
                    .db
                    .call(move |conn| queries::mark_done(conn, event_id, now))
                    .await?;
                if recorded {
                    info!(event_id, attempt, "Outbox event delivered");
                } else {
                    warn!(event_id, attempt, "Delivered event was no longer processing");
                }
                Ok(DispatchOutcome::Delivered { attempt, recorded })
            }
            Err(e) => {
                let message = e.to_string();
                let resolution = self.resolve_failure(event_id, &message, Utc::now()).await?;
                Ok(DispatchOutcome::DeliveryFailed {
                    attempt,
                    error: message,
                    resolution,
                })
            }
        }
    }

    /// Record that the job delivering `event_id` ultimately failed.
    ///
    /// Used when a dispatch could not complete (storage errors, a crashed
    /// task). Only a row still in `processing` is affected.
    pub async fn report_job_failure(
        &self,
        event_id: i64,
        message: &str,
    ) -> RelayResult<FailureResolution> {
        self.resolve_failure(event_id, message, Utc::now()).await
    }

    async fn resolve_failure(
        &self,
        event_id: i64,
        message: &str,
        now: DateTime<Utc>,
    ) -> RelayResult<FailureResolution> {
        let policy = self.policy.clone();
        let max_attempts = policy.max_attempts;
        let error_message = message.to_string();

        let resolution = self
            .db
            .call(move |conn| {
                queries::mark_retry_or_failed(
                    conn,
                    event_id,
                    &error_message,
                    max_attempts,
                    |attempt| policy.backoff(attempt),
                    now,
                )
            })
            .await?;

        match &resolution {
            FailureResolution::Rescheduled { attempts, available_at } => {
                warn!(
                    event_id,
                    attempts,
                    available_at = %available_at,
                    error = %message,
                    "Outbox delivery failed, will retry"
                );
            }
            FailureResolution::Failed { attempts } => {
                error!(event_id, attempts, error = %message, "Outbox event failed permanently");
            }
            FailureResolution::Ignored(status) => {
                debug!(event_id, status = %status, "Failure report ignored");
            }
            FailureResolution::Missing => {
                warn!(event_id, "Failure reported for missing outbox event");
            }
        }
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LogSink;
    use chrono::Duration;
    use outbox_store::NewOutboxEvent;
    use serde_json::json;

    #[test]
    fn outcome_display_is_readable() {
        let at = Utc::now() + Duration::minutes(1);
        let outcome = DispatchOutcome::DeliveryFailed {
            attempt: 1,
            error: "integration is down".to_string(),
            resolution: FailureResolution::Rescheduled {
                attempts: 1,
                available_at: at,
            },
        };
        let text = outcome.to_string();
        assert!(text.starts_with("attempt 1 failed (integration is down); retry at"));

        assert_eq!(
            DispatchOutcome::Delivered { attempt: 2, recorded: true }.to_string(),
            "delivered on attempt 2"
        );
        assert_eq!(
            DispatchOutcome::AlreadyTerminal(OutboxStatus::Done).to_string(),
            "already done"
        );
    }

    #[tokio::test]
    async fn dispatch_delivers_pending_event() {
        let dir = tempfile::tempdir().unwrap();
        let db = AsyncDatabase::open(&dir.path().join("outbox.sqlite")).await.unwrap();
        let dispatcher =
            Dispatcher::new(db.clone(), Arc::new(LogSink::new()), RetryPolicy::default()).unwrap();

        let event = db
            .call(|conn| {
                queries::insert_pending(
                    conn,
                    &NewOutboxEvent::new("series.uploaded", json!({"series_id": 1})),
                    Utc::now(),
                )
            })
            .await
            .unwrap();

        let outcome = dispatcher.dispatch(event.id).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Delivered { attempt: 1, recorded: true });
        assert!(outcome.is_delivered());

        assert_eq!(
            dispatcher.dispatch(event.id).await.unwrap(),
            DispatchOutcome::AlreadyTerminal(OutboxStatus::Done)
        );
        assert_eq!(dispatcher.dispatch(event.id + 100).await.unwrap(), DispatchOutcome::NotFound);
    }
}
