//! Configuration, filesystem paths and logging setup for the outbox relay.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, LogFormat, RetryConfig, WebhookSettings, WorkerConfig, DEFAULT_LOG_LEVEL,
    MIN_STALE_PROCESSING_SECONDS,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;
