//! # Logging Setup
//!
//! Console output for the operator plus a JSON file rotated daily for later
//! analysis. Verbosity comes from `RUST_LOG`, falling back to `info`.

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Level used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs the global subscriber.
///
/// Log files land in `log_dir` as `{file_prefix}.YYYY-MM-DD`. The returned
/// guard flushes the file writer when dropped, so keep it alive in `main`.
///
/// # Errors
/// Fails when the directory cannot be created or a global subscriber is
/// already installed.
pub fn setup_logging(log_dir: &Path, file_prefix: &str) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, file_prefix);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    tracing_subscriber::registry()
        .with(env_filter())
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))?;

    tracing::info!(log_dir = %log_dir.display(), "Logging initialized");
    Ok(guard)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
}
