//! Diagnostic tracing for the daemon and CLI.
//!
//! Diagnostics go to stderr, filtered by `RUST_LOG`, and optionally to a log
//! file as well. Product history (starts, completions, errors) is separate
//! and lives in the state file, unaffected by `RUST_LOG`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `default_directive` applies when `RUST_LOG` is unset. When `log_file` is
/// given, events are also appended to it through a background writer; keep
/// the returned guard alive until exit so buffered lines are flushed.
///
/// # Example
/// ```bash
/// RUST_LOG=sidekick=debug sidekick run
/// ```
pub fn init(default_directive: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {}", dir.display()))?;
            let file_name = path
                .file_name()
                .with_context(|| format!("log file has no name: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(guard)
}
