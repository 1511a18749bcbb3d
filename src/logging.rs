//! Logging setup.
//!
//! Everything at the configured level goes to the log file; only errors
//! reach stderr, so a successful run stays quiet on the terminal.

use std::fs;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LogConfig;
use crate::error::ConfigError;

/// Install the global subscriber. Keep the guard alive until exit so
/// buffered file output is flushed.
pub fn init(config: &LogConfig) -> Result<WorkerGuard, ConfigError> {
    let file_filter = EnvFilter::try_new(&config.level).map_err(|e| ConfigError::InvalidValue {
        key: "LOG_LEVEL".into(),
        message: e.to_string(),
    })?;

    let dir = config
        .file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| ".".into());
    fs::create_dir_all(&dir)?;

    let file_name = config
        .file
        .file_name()
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "LOG_FILE".into(),
            message: format!("{} has no file name", config.file.display()),
        })?;

    let appender = tracing_appender::rolling::never(&dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(LevelFilter::ERROR),
        )
        .try_init()
        .map_err(|e| ConfigError::InvalidValue {
            key: "LOG_LEVEL".into(),
            message: format!("logging already initialized: {e}"),
        })?;

    info!(level = %config.level, file = %config.file.display(), "Logging initialized");
    Ok(guard)
}
