//! # Logging Setup
//!
//! Installs the global `tracing` subscriber:
//! - an `EnvFilter` built from `RUST_LOG` when set, else from the configured
//!   level;
//! - a human readable console layer;
//! - when a log directory is configured, a JSON file layer written through
//!   a non-blocking appender to `<app>-<timestamp>.log`.
//!
//! Older log files of the same application are deleted at startup, keeping
//! only the most recent previous one.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use glob::glob;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
pub struct LoggerOptions {
    /// Prefix of the log file names.
    pub app_name: String,
    /// Enables the JSON file layer.
    pub log_dir: Option<PathBuf>,
    /// Default filter directive, e.g. `info` or `lib_stream=debug,info`.
    pub level: String,
}

impl LoggerOptions {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            log_dir: None,
            level: "info".to_string(),
        }
    }
}

/// Initializes logging. The returned guard flushes the file layer on drop
/// and must be kept alive for the lifetime of the process.
pub fn init(options: &LoggerOptions) -> io::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.level))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let console_layer = fmt::layer().with_target(true);

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            rotate_logs(&options.app_name, dir);
            let file_name = log_file_name(&options.app_name);
            let appender = tracing_appender::rolling::never(dir, &file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(io::Error::other)?;

    tracing::info!(level = %options.level, log_dir = ?options.log_dir, "Logging initialized");
    Ok(guard)
}

fn log_file_name(app_name: &str) -> String {
    format!("{}-{}.log", app_name, Local::now().format("%Y%m%d_%H%M%S"))
}

/// Keeps the newest `<app>-*.log` file in `dir` and deletes the others.
/// Timestamped names sort chronologically.
pub fn rotate_logs(app_name: &str, dir: &Path) {
    let pattern = format!("{}/{}-*.log", dir.display(), app_name);
    let mut log_files: Vec<PathBuf> = match glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            eprintln!("Invalid log rotation pattern {}: {}", pattern, e);
            return;
        }
    };

    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    for old_file in log_files.iter().skip(1) {
        if let Err(e) = std::fs::remove_file(old_file) {
            eprintln!("Error deleting old log file {}: {}", old_file.display(), e);
        }
    }
}
