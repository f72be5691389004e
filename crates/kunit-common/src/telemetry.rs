//! Logging initialization
//!
//! JSON structured logs on stdout, plus an optional rolling file under a log
//! directory. The level comes from `RUST_LOG` when set, otherwise from the
//! configured default.

use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to create the log file appender
    #[error("failed to create log appender in {dir}: {message}")]
    Appender {
        /// Directory the appender writes to
        dir: String,
        /// Underlying error
        message: String,
    },

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// How often the log file rolls over
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogRotation {
    /// New file every hour
    Hourly,
    /// New file every day
    #[default]
    Daily,
    /// Single file
    Never,
}

impl std::str::FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown log rotation '{}'", other)),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(value: LogRotation) -> Self {
        match value {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Configuration for logging initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name, used as the log file prefix
    pub service_name: String,
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Directory for rolling log files; stdout only when `None`
    pub log_dir: Option<PathBuf>,
    /// Rotation of the log file
    pub rotation: LogRotation,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "kunit-operator".to_string(),
            level: "info".to_string(),
            log_dir: None,
            rotation: LogRotation::Daily,
        }
    }
}

/// Initialize logging.
///
/// The returned guard must be held for the life of the process when a log
/// directory is configured, otherwise buffered file output is lost.
pub fn init_telemetry(config: TelemetryConfig) -> Result<Option<WorkerGuard>, TelemetryError> {
    let default_directive = format!("{},kube=info,tower=warn,hyper=warn", config.level);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true);

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(config.rotation.into())
                .filename_prefix(&config.service_name)
                .filename_suffix("log")
                .build(dir)
                .map_err(|e| TelemetryError::Appender {
                    dir: dir.display().to_string(),
                    message: e.to_string(),
                })?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(guard)
}
