//! Configuration management for the relay.
//!
//! Values come from `{base_dir}/config.json` when present, otherwise from
//! defaults, and are then overridden by `OUTBOX_*` environment variables.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Floor for `stale_processing_seconds`.
pub const MIN_STALE_PROCESSING_SECONDS: u64 = 60;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(CoreError::Config(format!("unknown log format: {}", other))),
        }
    }
}

/// Retry limits and backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
    pub stale_processing_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_seconds: 60,
            max_backoff_seconds: 3600,
            stale_processing_seconds: 300,
        }
    }
}

/// Relay loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub batch_limit: usize,
    pub concurrency: usize,
    /// Extra tries for a dispatch that hit a storage error.
    pub job_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            batch_limit: 50,
            concurrency: 8,
            job_retries: 3,
        }
    }
}

/// Webhook integration. With no URL, deliveries go to the log sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 10,
        }
    }
}

/// Main relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Overrides `{base_dir}/outbox.sqlite`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub webhook: WebhookSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_format: LogFormat::default(),
            database_path: None,
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
            webhook: WebhookSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from the config file, falling back to defaults,
    /// then apply environment overrides and validate.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the config file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Resolve the database file.
    pub fn database_file(&self, paths: &Paths) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| paths.database_file())
    }

    /// Override configuration from `OUTBOX_*` environment variables.
    pub fn load_from_env(&mut self) -> CoreResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OUTBOX_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("OUTBOX_LOG_FORMAT") {
            self.log_format = v.parse()?;
        }
        if let Some(v) = get("OUTBOX_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("OUTBOX_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_number("OUTBOX_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("OUTBOX_BACKOFF_BASE_SECONDS") {
            self.retry.base_backoff_seconds = parse_number("OUTBOX_BACKOFF_BASE_SECONDS", &v)?;
        }
        if let Some(v) = get("OUTBOX_BACKOFF_MAX_SECONDS") {
            self.retry.max_backoff_seconds = parse_number("OUTBOX_BACKOFF_MAX_SECONDS", &v)?;
        }
        if let Some(v) = get("OUTBOX_PROCESSING_STALE_SECONDS") {
            self.retry.stale_processing_seconds =
                parse_number("OUTBOX_PROCESSING_STALE_SECONDS", &v)?;
        }
        if let Some(v) = get("OUTBOX_POLL_INTERVAL_MS") {
            self.worker.poll_interval_ms = parse_number("OUTBOX_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("OUTBOX_BATCH_LIMIT") {
            self.worker.batch_limit = parse_number("OUTBOX_BATCH_LIMIT", &v)?;
        }
        if let Some(v) = get("OUTBOX_CONCURRENCY") {
            self.worker.concurrency = parse_number("OUTBOX_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("OUTBOX_JOB_RETRIES") {
            self.worker.job_retries = parse_number("OUTBOX_JOB_RETRIES", &v)?;
        }
        if let Some(v) = get("OUTBOX_WEBHOOK_URL") {
            self.webhook.url = Some(v);
        }
        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> CoreResult<()> {
        let retry = &self.retry;
        if retry.max_attempts < 1 {
            return Err(CoreError::Config("max_attempts must be at least 1".to_string()));
        }
        if retry.base_backoff_seconds < 1 {
            return Err(CoreError::Config(
                "base_backoff_seconds must be at least 1".to_string(),
            ));
        }
        if retry.max_backoff_seconds < retry.base_backoff_seconds {
            return Err(CoreError::Config(
                "max_backoff_seconds must not be below base_backoff_seconds".to_string(),
            ));
        }
        if retry.stale_processing_seconds < MIN_STALE_PROCESSING_SECONDS {
            return Err(CoreError::Config(format!(
                "stale_processing_seconds must be at least {}",
                MIN_STALE_PROCESSING_SECONDS
            )));
        }
        if self.worker.batch_limit < 1 {
            return Err(CoreError::Config("batch_limit must be at least 1".to_string()));
        }
        if self.worker.concurrency < 1 {
            return Err(CoreError::Config("concurrency must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> CoreResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| CoreError::Config(format!("{} must be a non-negative integer, got {:?}", name, raw)))
}
