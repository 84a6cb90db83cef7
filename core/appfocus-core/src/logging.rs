//! Tracing subscriber setup for hosts and the probe binary.
//!
//! `RUST_LOG` selects the filter (default `info`); `APPFOCUS_DEBUG_LOG=1`
//! forces `debug`. Logs go to stderr, and additionally to a daily-rolling file
//! under `log_dir` when one is given.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{FocusError, Result};

pub const DEBUG_LOG_ENV: &str = "APPFOCUS_DEBUG_LOG";

const LOG_FILE_PREFIX: &str = "appfocus";
const MAX_LOG_FILES: usize = 5;

fn debug_enabled() -> bool {
    env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn env_filter() -> EnvFilter {
    if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber. Keep the returned guard alive for the life
/// of the process so buffered file output is flushed.
///
/// A second call (another subscriber already installed) is a no-op.
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            fs_err::create_dir_all(dir).map_err(|source| FocusError::Logging {
                context: format!("creating log directory {}", dir.display()),
                source,
            })?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(MAX_LOG_FILES)
                .filename_prefix(LOG_FILE_PREFIX)
                .build(dir)
                .map_err(|err| FocusError::Logging {
                    context: format!("creating log appender in {}", dir.display()),
                    source: std::io::Error::other(err),
                })?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }

    Ok(guard)
}
