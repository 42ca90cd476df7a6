//! Tracing subscriber wiring.
//!
//! Logs go to stderr, and additionally to a file when one is configured.
//! The filter resolves in order: CLI `--log-level`, `SERTOP_BRIDGE_LOG`,
//! `RUST_LOG`, then `info`.

use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub const LOG_FILTER_ENV: &str = "SERTOP_BRIDGE_LOG";
pub const LOG_FILE_ENV: &str = "SERTOP_BRIDGE_LOG_FILE";

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Filter directives, e.g. `debug` or `sertop_bridge::server=trace`.
    pub filter: Option<String>,
    /// Path of an append-only log file, in addition to stderr.
    pub file_path: Option<PathBuf>,
}

impl LogConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var(LOG_FILTER_ENV) {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }
        if self.file_path.is_none()
            && let Ok(path) = std::env::var(LOG_FILE_ENV)
            && !path.trim().is_empty()
        {
            self.file_path = Some(PathBuf::from(path));
        }
        self
    }

    fn build_filter(&self) -> EnvFilter {
        match self.filter.as_deref() {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: invalid log filter '{filter}', using default");
                EnvFilter::new("info")
            }),
            None => EnvFilter::new("info"),
        }
    }
}

/// Initialize the global subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    let file_layer = config.file_path.as_ref().map(|path| {
        let parent = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("sertop-bridge.log");
        let appender = RollingFileAppender::new(Rotation::NEVER, parent, file_name);
        fmt::layer().with_ansi(false).with_writer(appender)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}
