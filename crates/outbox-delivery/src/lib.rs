//! Outbox delivery: claiming due events and handing them to an integration.
//!
//! This crate provides:
//! - [`Claimer`]: stale-processing recovery plus the atomic claim of due rows
//! - [`Dispatcher`]: per-event delivery with retry or terminal failure
//! - [`RetryPolicy`]: attempt limit, exponential backoff, stale threshold
//! - [`IntegrationSink`] with a logging sink and an HTTP webhook sink
//!
//! Delivery is at-least-once. Every delivery carries the
//! `"{type}:{id}"` integration event key so consumers can dedupe.

mod claimer;
mod dispatcher;
mod error;
mod policy;
pub mod sink;
mod webhook;

pub use claimer::Claimer;
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{RelayError, RelayResult, SinkError, SinkResult};
pub use policy::{compute_backoff, RetryPolicy, MIN_STALE_AFTER};
pub use sink::{IntegrationSink, LogSink};
pub use webhook::{WebhookConfig, WebhookSink, IDEMPOTENCY_KEY_HEADER};
