//! Installation of a run log.
//!
//! Library code only emits `tracing` events inside the spans handed to it. Applications that
//! want the events persisted call [`init_run_logging`] once at startup.

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

const DEFAULT_FILTER: &str = "info";


/// Keeps the file writer alive. Buffered log lines are flushed when this is dropped.
pub struct RunLog {
    _guard: WorkerGuard,
    path: PathBuf,
    installed: bool,
}

impl RunLog {
    /// The log file of this run.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the subscriber was installed. A subscriber set earlier in the process takes precedence, in which case nothing is written to [`RunLog::path`].
    pub fn installed(&self) -> bool {
        self.installed
    }
}


/// The file name of the log of a run started now, `parcellation_<timestamp>.log`.
pub fn run_log_file_name() -> String {
    format!("parcellation_{}.log", Local::now().format("%Y%m%d_%H%M%S"))
}


/// Install a global subscriber that logs to stderr and to a timestamped file in `dir`.
///
/// The filter is read from `RUST_LOG` and defaults to `info`. Calling this again once a
/// subscriber is set does not replace it.
pub fn init_run_logging<P: AsRef<Path>>(dir: P) -> Result<RunLog> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let file_name = run_log_file_name();
    let path = dir.join(&file_name);

    let appender = tracing_appender::rolling::never(dir, &file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter());

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_filter(env_filter());

    let installed = Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    Ok(RunLog { _guard: guard, path, installed })
}
