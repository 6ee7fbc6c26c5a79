//! Diagnostic logging via `tracing`.
//!
//! The subscriber writes human-readable lines to stderr (warnings only unless
//! verbose) and, once a project is initialized, JSON lines to a daily-rotated
//! file under `.hive/logs/`. Filter directives come from `HIVE_LOG`, then
//! `RUST_LOG`.
//!
//! This is separate from the run event log, which is domain data.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name prefix for the rotated log.
pub const LOG_FILE: &str = "hive.log";

fn file_filter(verbose: bool) -> EnvFilter {
    std::env::var("HIVE_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(if verbose { "hive=debug" } else { "hive=info" }))
}

/// Install the global subscriber.
///
/// Returns the appender guard when file logging is active; keep it alive for
/// the process lifetime so buffered lines are flushed. Calling this twice is
/// harmless: the second call leaves the existing subscriber in place.
pub fn init(log_dir: Option<&Path>, verbose: bool) -> Option<WorkerGuard> {
    let stderr_level = if verbose { "hive=debug" } else { "hive=warn" };
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(EnvFilter::new(stderr_level));

    let (file_layer, guard) = match log_dir.filter(|d| d.is_dir()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(file_filter(verbose));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed { guard } else { None }
}
