//! Integration sinks: where claimed events are handed off.

use crate::{SinkError, SinkResult};
use async_trait::async_trait;
use outbox_store::DeliverySnapshot;
use tracing::info;

/// Message used when a payload asks for a failure without saying why.
pub const DEFAULT_SIMULATED_FAILURE: &str = "simulated integration failure";

/// Trait for the external integration an outbox event is delivered to.
///
/// Delivery is at-least-once. Implementors receive the same
/// `integration_event_key` on every redelivery of an event and are expected
/// to pass it on so the consumer can dedupe.
#[async_trait]
pub trait IntegrationSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Deliver one event. Any error counts as a failed attempt.
    async fn deliver(&self, delivery: &DeliverySnapshot) -> SinkResult<()>;
}

/// Failure requested through the payload's `simulate_fail` flag, if any.
pub fn simulated_failure(delivery: &DeliverySnapshot) -> Option<SinkError> {
    let requested = delivery
        .payload
        .get("simulate_fail")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !requested {
        return None;
    }

    let message = delivery
        .payload
        .get("simulate_fail_message")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_SIMULATED_FAILURE);
    Some(SinkError::Simulated(message.to_string()))
}

/// Sink that records deliveries in the log.
///
/// Honours `simulate_fail` so retry behaviour can be exercised without a
/// remote integration.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IntegrationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, delivery: &DeliverySnapshot) -> SinkResult<()> {
        if let Some(err) = simulated_failure(delivery) {
            return Err(err);
        }

        info!(
            event_id = delivery.id,
            event_type = %delivery.event_type,
            key = %delivery.integration_event_key,
            attempt = delivery.attempt,
            payload = %delivery.payload,
            "Integration event delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn snapshot(payload: Value) -> DeliverySnapshot {
        DeliverySnapshot {
            id: 1,
            integration_event_key: "series.uploaded:1".to_string(),
            event_type: "series.uploaded".to_string(),
            payload,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn log_sink_delivers_plain_payload() {
        let sink = LogSink::new();
        assert!(sink
            .deliver(&snapshot(json!({"series_id": 1, "title": "Dunes"})))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn log_sink_honours_simulate_fail_message() {
        let sink = LogSink::new();
        let err = sink
            .deliver(&snapshot(json!({
                "simulate_fail": true,
                "simulate_fail_message": "integration is down"
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Simulated(ref m) if m == "integration is down"));
    }

    #[tokio::test]
    async fn log_sink_uses_default_simulated_message() {
        let sink = LogSink::new();
        let err = sink
            .deliver(&snapshot(json!({"simulate_fail": true, "simulate_fail_message": 5})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), DEFAULT_SIMULATED_FAILURE);
    }

    #[test]
    fn simulate_fail_false_is_ignored() {
        assert!(simulated_failure(&snapshot(json!({"simulate_fail": false}))).is_none());
        assert!(simulated_failure(&snapshot(json!({"simulate_fail": "yes"}))).is_none());
        assert!(simulated_failure(&snapshot(json!([1, 2, 3]))).is_none());
    }
}
