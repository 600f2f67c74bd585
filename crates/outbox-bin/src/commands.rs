//! Command implementations behind the `outboxd` subcommands.

use crate::relay::{retry_policy, RelaySettings, RelayLoop};
use outbox_config_and_utils::{Config, Paths, WebhookSettings};
use outbox_delivery::{
    Claimer, Dispatcher, IntegrationSink, LogSink, SinkResult, WebhookConfig, WebhookSink,
};
use outbox_store::{
    AsyncDatabase, Database, DatabaseError, FailureResolution, NewOutboxEvent, OutboxEvent,
    OutboxStatus, StatusCounts,
};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{error, info};

pub type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Parse a `--status` argument.
pub fn parse_status(value: &str) -> Result<OutboxStatus, String> {
    OutboxStatus::from_str(value).ok_or_else(|| {
        format!(
            "unknown status '{}', expected pending, processing, done or failed",
            value
        )
    })
}

/// Pick the integration sink: the webhook when a URL is configured,
/// otherwise the log sink.
pub fn build_sink(settings: &WebhookSettings) -> SinkResult<Arc<dyn IntegrationSink>> {
    match settings.url.as_deref() {
        Some(url) => {
            let sink = WebhookSink::new(WebhookConfig {
                url: url.to_string(),
                timeout_secs: settings.timeout_secs,
            })?;
            info!(url = sink.url(), "Using webhook sink");
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(LogSink::new())),
    }
}

/// Wire a relay loop from configuration.
pub fn build_relay(config: &Config, db: AsyncDatabase) -> CommandResult<RelayLoop> {
    let policy = retry_policy(&config.retry);
    let sink = build_sink(&config.webhook)?;
    let claimer = Claimer::new(db.clone(), policy.clone())?;
    let dispatcher = Dispatcher::new(db, sink, policy)?;
    Ok(RelayLoop::new(
        claimer,
        dispatcher,
        RelaySettings::from_config(&config.worker),
    ))
}

fn build_dispatcher(config: &Config, db: AsyncDatabase) -> CommandResult<Dispatcher> {
    let sink = build_sink(&config.webhook)?;
    Ok(Dispatcher::new(db, sink, retry_policy(&config.retry))?)
}

pub fn enqueue(db: &Database, event_type: &str, payload: &str) -> CommandResult<OutboxEvent> {
    let event_type = event_type.trim();
    if event_type.is_empty() {
        return Err(DatabaseError::InvalidData("event type must not be empty".to_string()).into());
    }
    let payload: serde_json::Value = serde_json::from_str(payload)?;
    Ok(db.insert_pending(&NewOutboxEvent::new(event_type, payload))?)
}

pub fn show(db: &Database, id: i64) -> CommandResult<String> {
    let event = db
        .get_event(id)?
        .ok_or_else(|| DatabaseError::NotFound(format!("outbox event {}", id)))?;
    Ok(serde_json::to_string_pretty(&event)?)
}

pub fn render_events(events: &[OutboxEvent], counts: &StatusCounts) -> String {
    let mut out = String::new();
    if events.is_empty() {
        out.push_str("No outbox events.\n");
    } else {
        let _ = writeln!(
            out,
            "{:>8}  {:<10}  {:>8}  {:<28}  {:<25}  LAST ERROR",
            "ID", "STATUS", "ATTEMPTS", "TYPE", "AVAILABLE AT"
        );
        for event in events {
            let available = event
                .available_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:>8}  {:<10}  {:>8}  {:<28}  {:<25}  {}",
                event.id,
                event.status.as_str(),
                event.attempts,
                event.event_type,
                available,
                event.last_error.as_deref().unwrap_or("")
            );
        }
    }
    let _ = writeln!(
        out,
        "pending={} processing={} done={} failed={} total={}",
        counts.pending,
        counts.processing,
        counts.done,
        counts.failed,
        counts.total()
    );
    out
}

pub fn render_resolution(id: i64, resolution: &FailureResolution) -> String {
    match resolution {
        FailureResolution::Rescheduled { attempts, available_at } => format!(
            "Event {} rescheduled after {} attempts; available at {}.",
            id,
            attempts,
            available_at.to_rfc3339()
        ),
        FailureResolution::Failed { attempts } => {
            format!("Event {} failed permanently after {} attempts.", id, attempts)
        }
        FailureResolution::Ignored(status) => {
            format!("Event {} is {}; failure report ignored.", id, status)
        }
        FailureResolution::Missing => format!("Event {} not found.", id),
    }
}

pub async fn poll(config: &Config, paths: &Paths, limit: usize) -> CommandResult<usize> {
    let db = AsyncDatabase::open(&config.database_file(paths)).await?;
    let relay = build_relay(config, db)?;
    let ids = relay.poll_and_dispatch(limit).await?;
    Ok(ids.len())
}

pub async fn dispatch(config: &Config, paths: &Paths, id: i64) -> CommandResult<String> {
    let db = AsyncDatabase::open(&config.database_file(paths)).await?;
    let outcome = build_dispatcher(config, db)?.dispatch(id).await?;
    Ok(format!("Event {}: {}", id, outcome))
}

pub async fn fail(config: &Config, paths: &Paths, id: i64, message: &str) -> CommandResult<String> {
    let db = AsyncDatabase::open(&config.database_file(paths)).await?;
    let resolution = build_dispatcher(config, db)?
        .report_job_failure(id, message)
        .await?;
    Ok(render_resolution(id, &resolution))
}

pub async fn run(config: &Config, paths: &Paths) -> CommandResult<()> {
    let db = AsyncDatabase::open(&config.database_file(paths)).await?;
    let relay = build_relay(config, db.clone())?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };
    relay.run(shutdown).await;

    db.close().await?;
    Ok(())
}
