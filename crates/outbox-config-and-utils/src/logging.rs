//! Logging initialization.
//!
//! Installs a `tracing-subscriber` fmt subscriber writing to stderr, so
//! command output on stdout stays clean. `RUST_LOG` wins over the
//! configured level.

use crate::LogFormat;
use tracing_subscriber::EnvFilter;

/// Initialize the logging system.
///
/// # Example
///
/// ```ignore
/// init_logging("info", LogFormat::Compact);
/// tracing::info!("Relay started");
/// ```
pub fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(parse_level(level).to_string().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
