//! File logging for the terminal client.
//!
//! Stdout belongs to the chat renderer, so diagnostics go to
//! `$AMAN_HOME/logs/aman.log` through a non-blocking writer.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::paths;

const DEFAULT_FILTER: &str = "aman=info,aman_core=info";
const LOG_FILE: &str = "aman.log";

/// Environment variable holding the log filter. `RUST_LOG` is the fallback.
pub const LOG_ENV: &str = "AMAN_LOG";

/// Guard of the background writer. Taking it out and dropping it flushes
/// pending lines.
static WRITER_GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

/// Flushes the log file when dropped.
pub struct LoggingHandle {
    pub log_path: PathBuf,
}

impl Drop for LoggingHandle {
    fn drop(&mut self) {
        flush();
    }
}

/// Flushes and stops the background writer.
///
/// Safe to call more than once and from any thread, including the Ctrl+C
/// handler right before a forced exit. Lines logged afterwards are dropped.
pub fn flush() {
    let guard = WRITER_GUARD
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    drop(guard);
}

/// Installs the global subscriber writing under the default logs directory.
///
/// # Errors
/// Returns an error if the log directory cannot be created or a subscriber
/// is already installed.
pub fn init_logging() -> Result<LoggingHandle> {
    init_logging_in(&paths::logs_dir())
}

/// Installs the global subscriber writing under `log_dir`.
///
/// # Errors
/// Returns an error if the log directory cannot be created or a subscriber
/// is already installed.
pub fn init_logging_in(log_dir: &Path) -> Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let (filter_source, filter) = resolve_filter();
    let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    *WRITER_GUARD.lock().unwrap_or_else(PoisonError::into_inner) = Some(guard);

    let log_path = log_dir.join(LOG_FILE);
    tracing::info!(log_path = %log_path.display(), filter = %filter_source, "Logging initialized");

    Ok(LoggingHandle { log_path })
}

fn resolve_filter() -> (String, EnvFilter) {
    for var in [LOG_ENV, "RUST_LOG"] {
        if let Ok(value) = std::env::var(var)
            && let Ok(filter) = EnvFilter::try_new(&value)
        {
            return (value, filter);
        }
    }
    (DEFAULT_FILTER.to_string(), EnvFilter::new(DEFAULT_FILTER))
}
