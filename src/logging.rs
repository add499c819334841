//! Tracing setup for the command-line tool.
//!
//! Console output goes to stderr so it never interleaves with the progress
//! line on stdout. An optional daily-rotated file in `<root>/logs` keeps a
//! record that survives the power cut as far as the filesystem allows.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

/// File name prefix of rotated log files.
pub const LOG_FILE_PREFIX: &str = "crashprobe";

/// Rotated files kept on disk.
const MAX_LOG_FILES: usize = 10;

/// Logging options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// `-v` count: 0 info, 1 debug, 2+ trace.
    pub verbosity: u8,
    /// Also write to rotated files in this directory.
    pub log_dir: Option<PathBuf>,
}

impl LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[must_use]
    pub const fn default_directive(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the verbosity-derived filter.
///
/// # Errors
///
/// Fails if the log directory cannot be created, the file appender cannot
/// be built, or a subscriber is already installed.
pub fn init(config: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.default_directive()))
        .context("Failed to create env filter")?;

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = match &config.log_dir {
        Some(dir) => {
            let appender = file_appender(dir)?;
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_file(true)
                    .with_ansi(false)
                    .with_writer(appender),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if let Some(dir) = &config.log_dir {
        tracing::debug!(log_dir = %dir.display(), "file logging enabled");
    }
    Ok(())
}

fn file_appender(dir: &Path) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
        .context("Failed to create log file appender")
}

/// Path of today's log file in `dir`.
#[must_use]
pub fn current_log_path(dir: &Path) -> PathBuf {
    let today = chrono::Utc::now().format("%Y-%m-%d");
    dir.join(format!("{LOG_FILE_PREFIX}.{today}.log"))
}
