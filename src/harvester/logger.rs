//! Process-wide tracing setup
//!
//! Logs go to the console and to a daily-rolling file under the configured log
//! directory. The returned guard must stay alive for the process lifetime or
//! buffered file output is lost.

use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::harvester::config_loader::LoggingConfig;

/// Error types for logging setup
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Initialize the tracing subscriber from the logging config.
///
/// A second call (for example from tests) leaves the existing subscriber in
/// place and still hands back a live guard.
pub fn init_tracing(config: &LoggingConfig) -> LoggerResult<WorkerGuard> {
    let log_dir = Path::new(&config.log_directory);
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
    }

    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, log_dir, "unsplash_harvester.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
    let console_layer = fmt::layer();

    match tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        Ok(()) => {
            info!(
                log_level = %config.log_level,
                log_directory = %config.log_directory,
                "Logger initialized"
            );
        }
        Err(_) => {
            // Already initialized; keep the existing subscriber.
            info!("Tracing already initialized, reusing existing subscriber");
        }
    }

    Ok(guard)
}
