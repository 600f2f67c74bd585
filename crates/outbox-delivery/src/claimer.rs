//! Claimer: recovers orphaned rows and claims due ones.

use crate::{RelayError, RelayResult, RetryPolicy};
use chrono::{DateTime, Utc};
use outbox_store::{queries, AsyncDatabase, RecoveryReport};
use tracing::{debug, info};

/// Selects due pending events and moves them to `processing`.
///
/// Several claimers may run against the same database; a row is only ever
/// returned to one of them.
#[derive(Clone)]
pub struct Claimer {
    db: AsyncDatabase,
    policy: RetryPolicy,
}

impl Claimer {
    pub fn new(db: AsyncDatabase, policy: RetryPolicy) -> RelayResult<Self> {
        policy.validate()?;
        Ok(Self { db, policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Recover stale rows, then claim up to `limit` due ones.
    ///
    /// Returns the claimed ids in ascending order.
    pub async fn poll(&self, limit: usize) -> RelayResult<Vec<i64>> {
        self.poll_at(limit, Utc::now()).await
    }

    /// [`poll`](Self::poll) against an explicit clock.
    pub async fn poll_at(&self, limit: usize, now: DateTime<Utc>) -> RelayResult<Vec<i64>> {
        if limit < 1 {
            return Err(RelayError::InvalidLimit(limit));
        }

        self.recover_stale_at(now).await?;

        let claimed = self
            .db
            .call(move |conn| queries::claim_pending(conn, limit, now))
            .await?;

        if claimed.is_empty() {
            debug!(limit, "No due outbox events");
        } else {
            info!(claimed = claimed.len(), limit, "Claimed outbox events");
        }
        Ok(claimed)
    }

    /// Run only the stale-processing sweep.
    pub async fn recover_stale(&self) -> RelayResult<RecoveryReport> {
        self.recover_stale_at(Utc::now()).await
    }

    async fn recover_stale_at(&self, now: DateTime<Utc>) -> RelayResult<RecoveryReport> {
        let stale_after = self.policy.stale_after_chrono();
        let max_attempts = self.policy.max_attempts;
        let report = self
            .db
            .call(move |conn| {
                queries::recover_stale_processing(conn, now, stale_after, max_attempts)
            })
            .await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_store::{NewOutboxEvent, OutboxStatus};
    use serde_json::json;
    use tempfile::tempdir;

    async fn setup() -> (tempfile::TempDir, AsyncDatabase, Claimer) {
        let dir = tempdir().unwrap();
        let db = AsyncDatabase::open(&dir.path().join("outbox.sqlite")).await.unwrap();
        let claimer = Claimer::new(db.clone(), RetryPolicy::default()).unwrap();
        (dir, db, claimer)
    }

    #[tokio::test]
    async fn poll_rejects_zero_limit() {
        let (_dir, _db, claimer) = setup().await;
        assert!(matches!(
            claimer.poll(0).await,
            Err(RelayError::InvalidLimit(0))
        ));
    }

    #[tokio::test]
    async fn new_rejects_invalid_policy() {
        let (_dir, db, _claimer) = setup().await;
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(matches!(
            Claimer::new(db, policy),
            Err(RelayError::InvalidPolicy(_))
        ));
    }

    #[tokio::test]
    async fn poll_claims_in_id_order_once() {
        let (_dir, db, claimer) = setup().await;
        let ids = db
            .call(|conn| {
                let mut ids = Vec::new();
                for n in 0..3 {
                    let event = queries::insert_pending(
                        conn,
                        &NewOutboxEvent::new("series.uploaded", json!({"series_id": n})),
                        Utc::now(),
                    )?;
                    ids.push(event.id);
                }
                Ok(ids)
            })
            .await
            .unwrap();

        assert_eq!(claimer.poll(50).await.unwrap(), ids);
        assert!(claimer.poll(50).await.unwrap().is_empty());

        let counts = db.call(|conn| queries::count_by_status(conn)).await.unwrap();
        assert_eq!(counts.processing, 3);
        assert_eq!(counts.pending, 0);

        let first = ids[0];
        let row = db
            .call(move |conn| queries::get_event(conn, first))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, OutboxStatus::Processing);
        assert_eq!(row.attempts, 1);
    }
}
