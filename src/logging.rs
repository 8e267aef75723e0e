//! Logging initialization, mirroring the host application's own entrypoint.

use tracing_subscriber::{fmt, EnvFilter};

/// Log level passed to [`init`].
#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Initialize the `tracing` subscriber for this process.
///
/// Respects `RUST_LOG` if set, otherwise falls back to `level`.
pub fn init(level: LogLevel) {
    let level_filter = match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_filter));

    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
