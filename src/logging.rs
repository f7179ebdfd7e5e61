//! Structured logging: a durable JSON file sink for the `run` subcommand,
//! plus a human-readable stderr sink used everywhere (spec §9 design notes).
//!
//! The file sink is pinned at `info` regardless of `RUST_LOG` — it's the
//! record an operator greps after the fact, so turning down verbosity for a
//! noisy interactive session shouldn't also thin out the persisted log. The
//! stderr sink honors `RUST_LOG` (default `info`) so a developer can raise
//! it for one run without touching the file.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, Result};

const LOG_FILE_PREFIX: &str = "inbox-digest";
const LOG_FILE_SUFFIX: &str = "log";

/// Keeps the file sink's background writer thread alive.
///
/// Dropping this flushes any buffered lines and stops that thread, so
/// `main` must hold one for as long as the process should keep logging to
/// disk.
pub struct LoggingGuard {
    _file_writer: WorkerGuard,
}

/// Install logging for the `run` subcommand: daily-rotated JSON lines under
/// `logs_dir`, fixed at `info`, plus stderr output governed by `RUST_LOG`.
///
/// # Errors
///
/// Returns [`Error::Io`] if `logs_dir` cannot be created, or
/// [`Error::ConfigError`] if the rotating file appender cannot be opened.
pub fn init_production(logs_dir: &Path) -> Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(Error::Io)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .build(logs_dir)
        .map_err(|e| {
            Error::ConfigError(format!(
                "failed to open rotating log file in {}: {e}",
                logs_dir.display()
            ))
        })?;
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter());

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(LoggingGuard { _file_writer: guard })
}

/// Install stderr-only logging for subcommands that don't produce a durable
/// artifact (`status`). No file is ever opened.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(console_filter())
        .with_writer(std::io::stderr)
        .init();
}

fn console_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
