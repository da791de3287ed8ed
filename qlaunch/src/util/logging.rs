//! Logging setup.
//!
//! Logs go to `<home>/logs/qlaunch.log` through a non-blocking writer so
//! that stage output relayed on stdout/stderr stays clean.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use qlaunch_shared::{QlaunchError, QlaunchResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Keeps the appender worker alive for the process lifetime.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_FILE_NAME: &str = "qlaunch.log";

/// Default home directory (`~/.qlaunch`), falling back to the temp dir when
/// the user has no home.
pub fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".qlaunch")
}

/// Install the global tracing subscriber writing to `log_dir`.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Calling this
/// more than once (or after another subscriber was installed) is a no-op.
pub fn init_logging(log_dir: &Path) -> QlaunchResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    std::fs::create_dir_all(log_dir).map_err(|e| {
        QlaunchError::Storage(format!(
            "Failed to create log directory {}: {}",
            log_dir.display(),
            e
        ))
    })?;

    let appender = tracing_appender::rolling::never(log_dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .is_ok();

    if installed {
        let _ = LOG_GUARD.set(guard);
        tracing::debug!(log_dir = %log_dir.display(), "Logging initialized");
    }

    Ok(())
}
