//! Logging system initialization and configuration
//!
//! Uses the tracing ecosystem for structured logging:
//! - `TERMSESSION_LOG` overrides the configured filter
//! - console output in pretty, compact or JSON form
//! - optional daily-rotated log file

use crate::config;
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment variable holding a filter directive
pub const LOG_ENV_VAR: &str = "TERMSESSION_LOG";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    pub timestamps: bool,
    /// Show file and line numbers on the console
    pub file_line: bool,
    pub file_output: bool,
    /// Log file directory; defaults to the platform data dir
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            timestamps: true,
            file_line: false,
            file_output: false,
            file_path: None,
        }
    }
}

impl From<&config::LoggingConfig> for LoggingConfig {
    fn from(settings: &config::LoggingConfig) -> Self {
        Self {
            level: parse_level(&settings.level),
            format: LogFormat::from_str(&settings.format),
            timestamps: settings.timestamps,
            file_line: settings.file_line,
            file_output: settings.file_output,
            file_path: settings.file_path.as_deref().map(expand_path),
        }
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl LogFormat {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Default log directory path
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termsession")
        .join("logs")
}

/// Initialize the global subscriber.
///
/// Returns the file writer guard when file output is on; keep it alive for
/// the lifetime of the program so buffered lines are flushed. Calling this a
/// second time leaves the existing subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "termsession={}",
            config.level.as_str().to_lowercase()
        ))
    });

    let console_layer = match (config.format, config.timestamps) {
        (LogFormat::Json, _) => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_file(config.file_line)
            .with_line_number(config.file_line)
            .boxed(),
        (LogFormat::Compact, true) => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        (LogFormat::Compact, false) => fmt::layer()
            .compact()
            .without_time()
            .with_writer(std::io::stderr)
            .boxed(),
        (LogFormat::Pretty, timestamps) => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(config.file_line)
                .with_line_number(config.file_line)
                .with_ansi(true);
            if timestamps {
                layer.boxed()
            } else {
                layer.without_time().boxed()
            }
        }
    };

    let mut guard = None;
    let file_layer = if config.file_output {
        let log_dir = config.file_path.clone().unwrap_or_else(default_log_dir);

        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!("Warning: Failed to create log directory {:?}: {}", log_dir, e);
            None
        } else {
            let appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "termsession.log");
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);

            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed(),
            )
        }
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if installed.is_ok() {
        tracing::info!("Logging initialized");
        tracing::debug!(
            level = %config.level,
            format = ?config.format,
            file_output = config.file_output,
            "Logging configuration"
        );
    }

    guard
}

/// Parse log level from string
pub fn parse_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!(LogFormat::from_str("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_str("Compact"), LogFormat::Compact);
        assert_eq!(LogFormat::from_str("whatever"), LogFormat::Pretty);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("trace"), Level::TRACE);
        assert_eq!(parse_level("WARNING"), Level::WARN);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_config_from_settings() {
        let settings = config::LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
            timestamps: false,
            file_line: true,
            file_output: true,
            file_path: Some("/tmp/termsession-logs".to_string()),
        };
        let config = LoggingConfig::from(&settings);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.timestamps);
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/termsession-logs")));
    }

    #[test]
    fn test_file_output_returns_guard() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            file_output: true,
            file_path: Some(dir.path().to_path_buf()),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_some());
        assert!(init_logging(&LoggingConfig::default()).is_none());
    }
}
