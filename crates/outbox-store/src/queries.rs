//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter and, where a
//! timestamp is written or compared, an explicit `now` so callers and tests
//! control the clock.
//!
//! Multi-statement transitions open an `IMMEDIATE` transaction. SQLite takes
//! the write lock at `BEGIN`, so a second claimer blocks (bounded by
//! `busy_timeout`) until the first one commits, and its selection then sees
//! the committed state.

use crate::models::{from_millis, integration_event_key, to_millis};
use crate::{
    AttemptStart, DatabaseError, DatabaseResult, DeliverySnapshot, FailureResolution,
    NewOutboxEvent, OutboxEvent, OutboxStatus, RecoveryReport, StatusCounts,
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

const EVENT_COLUMNS: &str = "id, type, payload, status, attempts, available_at, processed_at, last_error, created_at, updated_at";

/// Message stored when a row is failed for running out of attempts.
pub const RETRY_LIMIT_MESSAGE: &str = "retry limit reached";

/// Open an `IMMEDIATE` transaction on a shared connection reference.
fn begin_immediate(conn: &Connection) -> DatabaseResult<Transaction<'_>> {
    Ok(Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?)
}

fn parse_status(idx: usize, value: String) -> rusqlite::Result<OutboxStatus> {
    OutboxStatus::from_str(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown outbox status: {}", value).into(),
        )
    })
}

fn parse_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    from_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {}", ms).into(),
        )
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
    let payload: String = row.get(2)?;
    let payload = serde_json::from_str(&payload)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(OutboxEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        payload,
        status: parse_status(3, row.get(3)?)?,
        attempts: row.get(4)?,
        available_at: row
            .get::<_, Option<i64>>(5)?
            .map(|ms| parse_millis(5, ms))
            .transpose()?,
        processed_at: row
            .get::<_, Option<i64>>(6)?
            .map(|ms| parse_millis(6, ms))
            .transpose()?,
        last_error: row.get(7)?,
        created_at: parse_millis(8, row.get(8)?)?,
        updated_at: parse_millis(9, row.get(9)?)?,
    })
}

fn id_placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(", ")
}

// ==========================================
// Producer side
// ==========================================

/// Insert a new pending outbox event.
///
/// Call this inside the producer's own transaction so the event commits
/// atomically with the domain change.
pub fn insert_pending(
    conn: &Connection,
    event: &NewOutboxEvent,
    now: DateTime<Utc>,
) -> DatabaseResult<OutboxEvent> {
    let payload = serde_json::to_string(&event.payload)?;
    let now_ms = to_millis(now);
    conn.execute(
        "INSERT INTO outbox_events (type, payload, status, attempts, available_at, created_at, updated_at)
         VALUES (?1, ?2, 'pending', 0, NULL, ?3, ?3)",
        params![event.event_type, payload, now_ms],
    )?;
    let id = conn.last_insert_rowid();
    debug!(event_id = id, event_type = %event.event_type, "Outbox event enqueued");

    get_event(conn, id)?
        .ok_or_else(|| DatabaseError::NotFound("Outbox event not found after insert".to_string()))
}

// ==========================================
// Inspection
// ==========================================

/// Get an outbox event by ID.
pub fn get_event(conn: &Connection, id: i64) -> DatabaseResult<Option<OutboxEvent>> {
    let sql = format!("SELECT {} FROM outbox_events WHERE id = ?1", EVENT_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;

    match stmt.query_row(params![id], row_to_event) {
        Ok(event) => Ok(Some(event)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List outbox events, newest first, optionally filtered by status.
pub fn list_events(
    conn: &Connection,
    status: Option<OutboxStatus>,
    limit: usize,
) -> DatabaseResult<Vec<OutboxEvent>> {
    let limit = limit as i64;
    let rows = match status {
        Some(status) => {
            let sql = format!(
                "SELECT {} FROM outbox_events WHERE status = ?1 ORDER BY id DESC LIMIT ?2",
                EVENT_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(params![status.as_str(), limit], row_to_event)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let sql = format!(
                "SELECT {} FROM outbox_events ORDER BY id DESC LIMIT ?1",
                EVENT_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(params![limit], row_to_event)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

/// Count rows in each status.
pub fn count_by_status(conn: &Connection) -> DatabaseResult<StatusCounts> {
    let mut stmt =
        conn.prepare_cached("SELECT status, COUNT(*) FROM outbox_events GROUP BY status")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((parse_status(0, row.get(0)?)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = StatusCounts::default();
    for (status, count) in rows {
        counts.add(status, count.max(0) as u64);
    }
    Ok(counts)
}

// ==========================================
// Claimer
// ==========================================

/// Return abandoned `processing` rows to the queue.
///
/// A row whose `updated_at` is at or before `now - stale_after` is treated
/// as orphaned by a crashed worker. Rows with no attempts left become
/// `failed`; the rest go back to `pending` with no backoff gate.
pub fn recover_stale_processing(
    conn: &Connection,
    now: DateTime<Utc>,
    stale_after: Duration,
    max_attempts: u32,
) -> DatabaseResult<RecoveryReport> {
    let tx = begin_immediate(conn)?;
    let now_ms = to_millis(now);
    let cutoff_ms = to_millis(now - stale_after);

    let stale: Vec<(i64, u32)> = {
        let mut stmt = tx.prepare_cached(
            "SELECT id, attempts FROM outbox_events
             WHERE status = 'processing' AND updated_at <= ?1
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![cutoff_ms], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut report = RecoveryReport::default();
    if stale.is_empty() {
        tx.commit()?;
        return Ok(report);
    }

    {
        let mut fail_stmt = tx.prepare_cached(
            "UPDATE outbox_events
             SET status = 'failed', available_at = NULL, last_error = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'processing'",
        )?;
        let mut requeue_stmt = tx.prepare_cached(
            "UPDATE outbox_events
             SET status = 'pending', available_at = NULL, last_error = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'processing'",
        )?;

        for (id, attempts) in stale {
            if attempts >= max_attempts {
                let message = format!(
                    "processing lease expired after {} attempt(s); {}",
                    attempts, RETRY_LIMIT_MESSAGE
                );
                fail_stmt.execute(params![message, now_ms, id])?;
                report.failed.push(id);
            } else {
                let message = format!(
                    "processing lease expired after {} attempt(s); requeued",
                    attempts
                );
                requeue_stmt.execute(params![message, now_ms, id])?;
                report.requeued.push(id);
            }
        }
    }

    tx.commit()?;

    if !report.is_empty() {
        warn!(
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            "Recovered stale processing events"
        );
    }
    Ok(report)
}

/// Atomically claim up to `limit` due pending rows.
///
/// Returns the ids this call moved to `processing`, ascending. Each claimed
/// row has its attempt counted here.
pub fn claim_pending(
    conn: &Connection,
    limit: usize,
    now: DateTime<Utc>,
) -> DatabaseResult<Vec<i64>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let tx = begin_immediate(conn)?;
    let now_ms = to_millis(now);

    let candidates: Vec<i64> = {
        let mut stmt = tx.prepare_cached(
            "SELECT id FROM outbox_events
             WHERE status = 'pending' AND (available_at IS NULL OR available_at <= ?1)
             ORDER BY id
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![now_ms, limit as i64], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    if candidates.is_empty() {
        tx.commit()?;
        return Ok(Vec::new());
    }

    let placeholders = id_placeholders(candidates.len());

    let update_sql = format!(
        "UPDATE outbox_events
         SET status = 'processing', attempts = attempts + 1, last_error = NULL, updated_at = ?1
         WHERE status = 'pending' AND id IN ({})",
        placeholders
    );
    let mut params_vec: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(candidates.len() + 1);
    params_vec.push(&now_ms);
    for id in &candidates {
        params_vec.push(id);
    }
    tx.execute(&update_sql, params_vec.as_slice())?;

    // Only rows carrying this call's claim stamp belong to it.
    let claimed: Vec<i64> = {
        let select_sql = format!(
            "SELECT id FROM outbox_events
             WHERE status = 'processing' AND updated_at = ?1 AND id IN ({})
             ORDER BY id",
            placeholders
        );
        let mut stmt = tx.prepare(&select_sql)?;
        let rows = stmt
            .query_map(params_vec.as_slice(), |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    tx.commit()?;

    debug!(claimed = claimed.len(), limit, "Claimed pending outbox events");
    Ok(claimed)
}

// ==========================================
// Dispatcher
// ==========================================

/// Stage A of a dispatch: move the row into `processing` and snapshot it.
///
/// An attempt is counted only when the row enters `processing`. A row the
/// claimer already moved there keeps its count; a `pending` row dispatched
/// directly gains one. When that attempt would exceed `max_attempts` the
/// row is failed instead.
pub fn begin_attempt(
    conn: &Connection,
    id: i64,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> DatabaseResult<AttemptStart> {
    let tx = begin_immediate(conn)?;
    let now_ms = to_millis(now);

    let Some(event) = get_event(&tx, id)? else {
        tx.commit()?;
        return Ok(AttemptStart::Missing);
    };

    let attempt = match event.status {
        OutboxStatus::Done | OutboxStatus::Failed => {
            tx.commit()?;
            return Ok(AttemptStart::AlreadyTerminal(event.status));
        }
        OutboxStatus::Pending => event.attempts.saturating_add(1),
        OutboxStatus::Processing => event.attempts,
    };

    if attempt > max_attempts {
        tx.execute(
            "UPDATE outbox_events
             SET status = 'failed', available_at = NULL,
                 last_error = COALESCE(last_error, ?1), updated_at = ?2
             WHERE id = ?3",
            params![RETRY_LIMIT_MESSAGE, now_ms, id],
        )?;
        tx.commit()?;
        warn!(event_id = id, attempts = event.attempts, max_attempts, "Outbox event exhausted before delivery");
        return Ok(AttemptStart::Exhausted {
            attempts: event.attempts,
        });
    }

    tx.execute(
        "UPDATE outbox_events
         SET status = 'processing', attempts = ?1, last_error = NULL, updated_at = ?2
         WHERE id = ?3",
        params![attempt, now_ms, id],
    )?;
    tx.commit()?;

    Ok(AttemptStart::Started(DeliverySnapshot {
        id,
        integration_event_key: integration_event_key(&event.event_type, id),
        event_type: event.event_type,
        payload: event.payload,
        attempt,
    }))
}

/// Stage B success: `processing -> done`.
///
/// Returns `false` when the row was no longer `processing` (for example it
/// was recovered as stale while the sink call was in flight).
pub fn mark_done(conn: &Connection, id: i64, now: DateTime<Utc>) -> DatabaseResult<bool> {
    let now_ms = to_millis(now);
    let rows = conn.execute(
        "UPDATE outbox_events
         SET status = 'done', processed_at = ?1, available_at = NULL, last_error = NULL, updated_at = ?1
         WHERE id = ?2 AND status = 'processing'",
        params![now_ms, id],
    )?;
    Ok(rows > 0)
}

/// Resolve a failed attempt: reschedule with backoff or fail terminally.
///
/// Applies only to a row still in `processing`, with `attempts` read inside
/// the transaction. `backoff` maps the attempt count to the delay before the
/// row becomes due again.
pub fn mark_retry_or_failed<B>(
    conn: &Connection,
    id: i64,
    error: &str,
    max_attempts: u32,
    backoff: B,
    now: DateTime<Utc>,
) -> DatabaseResult<FailureResolution>
where
    B: Fn(u32) -> Duration,
{
    let tx = begin_immediate(conn)?;
    let now_ms = to_millis(now);

    let current: Option<(OutboxStatus, u32)> = {
        let mut stmt =
            tx.prepare_cached("SELECT status, attempts FROM outbox_events WHERE id = ?1")?;
        match stmt.query_row(params![id], |row| {
            Ok((parse_status(0, row.get(0)?)?, row.get(1)?))
        }) {
            Ok(found) => Some(found),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        }
    };

    let Some((status, attempts)) = current else {
        tx.commit()?;
        return Ok(FailureResolution::Missing);
    };

    if status != OutboxStatus::Processing {
        tx.commit()?;
        return Ok(FailureResolution::Ignored(status));
    }

    let resolution = if attempts >= max_attempts {
        tx.execute(
            "UPDATE outbox_events
             SET status = 'failed', available_at = NULL, processed_at = NULL,
                 last_error = ?1, updated_at = ?2
             WHERE id = ?3",
            params![error, now_ms, id],
        )?;
        FailureResolution::Failed { attempts }
    } else {
        let available_at = now + backoff(attempts);
        tx.execute(
            "UPDATE outbox_events
             SET status = 'pending', available_at = ?1, processed_at = NULL,
                 last_error = ?2, updated_at = ?3
             WHERE id = ?4",
            params![to_millis(available_at), error, now_ms, id],
        )?;
        FailureResolution::Rescheduled {
            attempts,
            available_at: from_millis(to_millis(available_at)).unwrap_or(available_at),
        }
    };

    tx.commit()?;

    match &resolution {
        FailureResolution::Failed { attempts } => {
            info!(event_id = id, attempts, "Outbox event failed permanently");
        }
        FailureResolution::Rescheduled { attempts, available_at } => {
            debug!(event_id = id, attempts, available_at = %available_at, "Outbox event rescheduled");
        }
        _ => {}
    }
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn enqueue(conn: &Connection, now: DateTime<Utc>) -> OutboxEvent {
        insert_pending(
            conn,
            &NewOutboxEvent::new("series.uploaded", json!({"series_id": 1, "title": "Dunes"})),
            now,
        )
        .unwrap()
    }

    /// Force a row into an arbitrary state, bypassing the state machine.
    fn force(
        conn: &Connection,
        id: i64,
        status: OutboxStatus,
        attempts: u32,
        available_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) {
        conn.execute(
            "UPDATE outbox_events SET status = ?1, attempts = ?2, available_at = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                status.as_str(),
                attempts,
                available_at.map(to_millis),
                to_millis(updated_at),
                id
            ],
        )
        .unwrap();
    }

    fn backoff_minutes(attempt: u32) -> Duration {
        Duration::minutes(attempt as i64)
    }

    #[test]
    fn test_insert_pending_defaults() {
        let conn = setup();
        let now = Utc::now();
        let event = enqueue(&conn, now);

        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.attempts, 0);
        assert!(event.available_at.is_none());
        assert!(event.processed_at.is_none());
        assert!(event.last_error.is_none());
        assert_eq!(event.payload["title"], "Dunes");
        assert_eq!(event.integration_event_key(), format!("series.uploaded:{}", event.id));
    }

    #[test]
    fn test_get_event_missing() {
        let conn = setup();
        assert!(get_event(&conn, 999).unwrap().is_none());
    }

    #[test]
    fn test_out_of_range_timestamp_is_a_read_error() {
        let conn = setup();
        let now = Utc::now();
        let event = enqueue(&conn, now);
        conn.execute(
            "UPDATE outbox_events SET available_at = ?1 WHERE id = ?2",
            params![i64::MAX, event.id],
        )
        .unwrap();

        let err = get_event(&conn, event.id).unwrap_err();
        assert!(err.to_string().contains("timestamp out of range"));
        // Corrupt gate stays in the future for the claim query
        assert!(claim_pending(&conn, 10, now).unwrap().is_empty());
    }

    #[test]
    fn test_list_and_count() {
        let conn = setup();
        let now = Utc::now();
        let a = enqueue(&conn, now);
        let b = enqueue(&conn, now);
        let _c = enqueue(&conn, now);
        force(&conn, b.id, OutboxStatus::Done, 1, None, now);

        let all = list_events(&conn, None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].id > all[2].id);

        let done = list_events(&conn, Some(OutboxStatus::Done), 10).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, b.id);

        let limited = list_events(&conn, Some(OutboxStatus::Pending), 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_ne!(limited[0].id, a.id);

        let counts = count_by_status(&conn).unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.done, 1);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_claim_pending_selects_only_due_rows() {
        let conn = setup();
        let now = Utc::now();
        let due_null = enqueue(&conn, now);
        let due_past = enqueue(&conn, now);
        let future = enqueue(&conn, now);
        let done = enqueue(&conn, now);
        let failed = enqueue(&conn, now);
        force(&conn, due_past.id, OutboxStatus::Pending, 0, Some(now - Duration::minutes(1)), now);
        force(&conn, future.id, OutboxStatus::Pending, 0, Some(now + Duration::minutes(10)), now);
        force(&conn, done.id, OutboxStatus::Done, 1, None, now);
        force(&conn, failed.id, OutboxStatus::Failed, 5, None, now);

        let claimed = claim_pending(&conn, 50, now).unwrap();
        assert_eq!(claimed, vec![due_null.id, due_past.id]);

        for id in claimed {
            let event = get_event(&conn, id).unwrap().unwrap();
            assert_eq!(event.status, OutboxStatus::Processing);
            assert_eq!(event.attempts, 1);
        }
        assert_eq!(get_event(&conn, future.id).unwrap().unwrap().status, OutboxStatus::Pending);

        assert!(claim_pending(&conn, 50, now).unwrap().is_empty());
    }

    #[test]
    fn test_claim_pending_respects_limit_and_order() {
        let conn = setup();
        let now = Utc::now();
        let ids: Vec<i64> = (0..5).map(|_| enqueue(&conn, now).id).collect();

        assert_eq!(claim_pending(&conn, 2, now).unwrap(), ids[..2].to_vec());
        assert_eq!(claim_pending(&conn, 2, now).unwrap(), ids[2..4].to_vec());
        assert_eq!(claim_pending(&conn, 0, now).unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn test_recover_stale_processing() {
        let conn = setup();
        let now = Utc::now();
        let stale = enqueue(&conn, now);
        let fresh = enqueue(&conn, now);
        let exhausted = enqueue(&conn, now);
        force(&conn, stale.id, OutboxStatus::Processing, 1, None, now - Duration::minutes(3));
        force(&conn, fresh.id, OutboxStatus::Processing, 1, None, now - Duration::seconds(20));
        force(&conn, exhausted.id, OutboxStatus::Processing, 2, None, now - Duration::minutes(3));

        let report = recover_stale_processing(&conn, now, Duration::seconds(60), 2).unwrap();
        assert_eq!(report.requeued, vec![stale.id]);
        assert_eq!(report.failed, vec![exhausted.id]);

        let stale = get_event(&conn, stale.id).unwrap().unwrap();
        assert_eq!(stale.status, OutboxStatus::Pending);
        assert!(stale.available_at.is_none());
        assert!(stale.last_error.is_some());

        let fresh = get_event(&conn, fresh.id).unwrap().unwrap();
        assert_eq!(fresh.status, OutboxStatus::Processing);
        assert!(fresh.last_error.is_none());

        let exhausted = get_event(&conn, exhausted.id).unwrap().unwrap();
        assert_eq!(exhausted.status, OutboxStatus::Failed);
        assert_eq!(exhausted.attempts, 2);
        assert!(exhausted.available_at.is_none());
    }

    #[test]
    fn test_begin_attempt_counts_only_on_entry() {
        let conn = setup();
        let now = Utc::now();
        let claimed = enqueue(&conn, now);
        let direct = enqueue(&conn, now);
        assert_eq!(claim_pending(&conn, 1, now).unwrap(), vec![claimed.id]);

        let AttemptStart::Started(snapshot) = begin_attempt(&conn, claimed.id, 5, now).unwrap() else {
            panic!("expected started attempt");
        };
        assert_eq!(snapshot.attempt, 1);
        assert_eq!(snapshot.integration_event_key, format!("series.uploaded:{}", claimed.id));
        assert_eq!(get_event(&conn, claimed.id).unwrap().unwrap().attempts, 1);

        let AttemptStart::Started(snapshot) = begin_attempt(&conn, direct.id, 5, now).unwrap() else {
            panic!("expected started attempt");
        };
        assert_eq!(snapshot.attempt, 1);
        let row = get_event(&conn, direct.id).unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Processing);
        assert_eq!(row.attempts, 1);
    }

    #[test]
    fn test_begin_attempt_terminal_missing_and_exhausted() {
        let conn = setup();
        let now = Utc::now();
        assert_eq!(begin_attempt(&conn, 404, 5, now).unwrap(), AttemptStart::Missing);

        let done = enqueue(&conn, now);
        force(&conn, done.id, OutboxStatus::Done, 1, None, now);
        assert_eq!(
            begin_attempt(&conn, done.id, 5, now).unwrap(),
            AttemptStart::AlreadyTerminal(OutboxStatus::Done)
        );

        let spent = enqueue(&conn, now);
        force(&conn, spent.id, OutboxStatus::Pending, 5, None, now);
        assert_eq!(
            begin_attempt(&conn, spent.id, 5, now).unwrap(),
            AttemptStart::Exhausted { attempts: 5 }
        );
        let row = get_event(&conn, spent.id).unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.attempts, 5);
        assert_eq!(row.last_error.as_deref(), Some(RETRY_LIMIT_MESSAGE));
        assert!(row.available_at.is_none());
    }

    #[test]
    fn test_mark_done_guarded_by_processing() {
        let conn = setup();
        let now = Utc::now();
        let event = enqueue(&conn, now);

        assert!(!mark_done(&conn, event.id, now).unwrap());
        assert_eq!(get_event(&conn, event.id).unwrap().unwrap().status, OutboxStatus::Pending);

        claim_pending(&conn, 1, now).unwrap();
        assert!(mark_done(&conn, event.id, now).unwrap());
        let row = get_event(&conn, event.id).unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Done);
        assert!(row.processed_at.is_some());
        assert!(row.last_error.is_none());

        assert!(!mark_done(&conn, event.id, now).unwrap());
    }

    #[test]
    fn test_mark_retry_or_failed_reschedules_with_backoff() {
        let conn = setup();
        let now = Utc::now();
        let event = enqueue(&conn, now);
        claim_pending(&conn, 1, now).unwrap();

        let resolution =
            mark_retry_or_failed(&conn, event.id, "integration is down", 5, backoff_minutes, now)
                .unwrap();
        let expected_at = from_millis(to_millis(now + Duration::minutes(1))).unwrap();
        assert_eq!(
            resolution,
            FailureResolution::Rescheduled {
                attempts: 1,
                available_at: expected_at
            }
        );

        let row = get_event(&conn, event.id).unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.last_error.as_deref(), Some("integration is down"));
        assert_eq!(row.available_at, Some(expected_at));
    }

    #[test]
    fn test_mark_retry_or_failed_fails_at_limit() {
        let conn = setup();
        let now = Utc::now();
        let event = enqueue(&conn, now);
        force(&conn, event.id, OutboxStatus::Processing, 5, None, now);

        let resolution =
            mark_retry_or_failed(&conn, event.id, "still down", 5, backoff_minutes, now).unwrap();
        assert_eq!(resolution, FailureResolution::Failed { attempts: 5 });

        let row = get_event(&conn, event.id).unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.last_error.as_deref(), Some("still down"));
        assert!(row.available_at.is_none());
    }

    #[test]
    fn test_mark_retry_or_failed_ignores_non_processing_rows() {
        let conn = setup();
        let now = Utc::now();
        let event = enqueue(&conn, now);

        assert_eq!(
            mark_retry_or_failed(&conn, event.id, "boom", 5, backoff_minutes, now).unwrap(),
            FailureResolution::Ignored(OutboxStatus::Pending)
        );
        assert_eq!(
            mark_retry_or_failed(&conn, 999, "boom", 5, backoff_minutes, now).unwrap(),
            FailureResolution::Missing
        );

        force(&conn, event.id, OutboxStatus::Done, 1, None, now);
        assert_eq!(
            mark_retry_or_failed(&conn, event.id, "boom", 5, backoff_minutes, now).unwrap(),
            FailureResolution::Ignored(OutboxStatus::Done)
        );
        let row = get_event(&conn, event.id).unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Done);
        assert!(row.last_error.is_none());
    }
}
