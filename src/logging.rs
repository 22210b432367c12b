//! Tracing subscriber setup.
//!
//! Everything goes to stderr because stdout carries the transport protocol.
//! A daily rolling file under the logs directory is added when enabled.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;
use crate::error::{BridgeError, Result};

/// Default directive when nothing is configured.
pub const DEFAULT_FILTER: &str = "info";

/// Log file name prefix; the appender adds the date.
pub const LOG_FILE_PREFIX: &str = "voxbridge.log";

/// Keeps the file writer flushing. Hold it for the life of the process.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Pick the filter directive: configured, then `RUST_LOG`, then
/// [`DEFAULT_FILTER`]. Blank values are skipped.
pub fn filter_directive(configured: Option<&str>, rust_log: Option<&str>) -> String {
    [configured, rust_log]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|d| !d.is_empty())
        .unwrap_or(DEFAULT_FILTER)
        .to_owned()
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns [`BridgeError::Config`] for an invalid filter directive or when a
/// subscriber is already installed, and [`BridgeError::Io`] if the log
/// directory cannot be created.
pub fn init(config: &LoggingConfig) -> Result<LogGuard> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(config.filter.as_deref(), rust_log.as_deref());
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| BridgeError::Config(format!("invalid log filter {directive:?}: {e}")))?;

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = if config.file_enabled {
        std::fs::create_dir_all(&config.dir)?;
        let appender = tracing_appender::rolling::daily(&config.dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| BridgeError::Config(format!("failed to install subscriber: {e}")))?;

    Ok(LogGuard { _file: guard })
}
