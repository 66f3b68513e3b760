//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! Console output is pretty or JSON per [`LogFormat`]. When a log directory is
//! configured, a daily-rotated JSON file is written alongside. `RUST_LOG`
//! controls the filter (default: `info`).

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};
use crate::error::ConfigError;

const LOG_FILE_PREFIX: &str = "lead-agent.log";

/// Holds the non-blocking writer guard for file logging.
///
/// Keep it alive for the life of the process; dropping it flushes pending
/// entries and closes the file.
pub struct LoggingGuard {
    _guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init(config: &LogConfig) -> Result<LoggingGuard, ConfigError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::InvalidValue {
                key: "LEAD_AGENT_LOG_DIR".to_string(),
                message: format!("failed to create {}: {e}", dir.display()),
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().json().with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let (pretty, json) = match config.format {
        LogFormat::Pretty => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(pretty)
        .with(json)
        .with(file_layer)
        .try_init()
        .map_err(|e| ConfigError::InvalidValue {
            key: "RUST_LOG".to_string(),
            message: format!("failed to install subscriber: {e}"),
        })?;

    Ok(LoggingGuard { _guard: guard })
}
