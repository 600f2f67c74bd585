//! HTTP webhook sink.

use crate::sink::IntegrationSink;
use crate::{SinkError, SinkResult};
use async_trait::async_trait;
use outbox_store::DeliverySnapshot;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the integration event key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Longest response body kept in a rejection error.
const MAX_ERROR_BODY: usize = 512;

/// Webhook sink configuration.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Endpoint receiving one POST per delivery.
    pub url: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: 10,
        }
    }
}

/// Request body posted to the webhook.
#[derive(Debug, Serialize)]
struct WebhookRequest<'a> {
    id: i64,
    #[serde(rename = "type")]
    event_type: &'a str,
    key: &'a str,
    attempt: u32,
    payload: &'a Value,
}

/// Sink that POSTs each delivery as JSON.
pub struct WebhookSink {
    config: WebhookConfig,
    client: Client,
}

impl WebhookSink {
    /// Create a webhook sink with its own HTTP client.
    pub fn new(config: WebhookConfig) -> SinkResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl IntegrationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, delivery: &DeliverySnapshot) -> SinkResult<()> {
        let request = WebhookRequest {
            id: delivery.id,
            event_type: &delivery.event_type,
            key: &delivery.integration_event_key,
            attempt: delivery.attempt,
            payload: &delivery.payload,
        };

        debug!(
            url = %self.config.url,
            event_id = delivery.id,
            key = %delivery.integration_event_key,
            "Posting webhook"
        );

        let response = self
            .client
            .post(&self.config.url)
            .header(IDEMPOTENCY_KEY_HEADER, &delivery.integration_event_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            warn!(
                event_id = delivery.id,
                status = status.as_u16(),
                "Webhook rejected delivery"
            );
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}
