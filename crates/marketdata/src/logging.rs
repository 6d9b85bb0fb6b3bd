//! `tracing-subscriber` initialization.
//!
//! Every crate in the workspace logs through `tracing`; binaries embedding the
//! engine call [`init_logging`] once at startup to pick an output format:
//!
//! - **pretty**: multi-line, coloured output for development
//! - **json**: one JSON object per event for log aggregation
//! - **compact**: single-line output

use std::fmt;
use std::str::FromStr;

use marketdata_core::{DataError, Result};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self as subscriber_fmt, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, multi-line.
    #[default]
    Pretty,
    /// Newline-delimited JSON.
    Json,
    /// Single line per event.
    Compact,
}

impl FromStr for LogFormat {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            "compact" => Ok(Self::Compact),
            other => Err(DataError::InvalidConfig(format!("unknown log format: {other}"))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
            Self::Compact => "compact",
        })
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `marketdata_cache=debug`.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Emit span open/close events.
    pub with_span_events: bool,
    /// Include file and line.
    pub with_file: bool,
    /// Include thread ids.
    pub with_thread_ids: bool,
    /// Include the event target.
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file: true,
            with_thread_ids: false,
            with_target: true,
        }
    }
}

impl LogConfig {
    /// Config with the given filter directive and default flags.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    /// Sets the output format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enables or disables span open/close events.
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Reads `RUST_LOG` for the level and `LOG_FORMAT` for the format.
    ///
    /// An unparseable `LOG_FORMAT` falls back to [`LogFormat::Pretty`].
    #[must_use]
    pub fn from_env() -> Self {
        let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let format = std::env::var("LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        Self {
            level,
            format,
            ..Default::default()
        }
    }
}

/// Installs a global subscriber built from `config`.
///
/// `RUST_LOG`, when set, takes precedence over `config.level`.
///
/// # Errors
/// Returns [`DataError::InvalidConfig`] for a bad filter directive or when a
/// global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| DataError::InvalidConfig(format!("log filter: {e}")))?;

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = subscriber_fmt::layer()
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .with_thread_ids(config.with_thread_ids)
        .with_target(config.with_target)
        .with_span_events(span_events);
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format {
        LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
    };
    installed.map_err(|e| DataError::InvalidConfig(format!("log subscriber: {e}")))?;

    tracing::info!(format = %config.format, level = %config.level, "Logging initialized");
    Ok(())
}

/// [`init_logging`] with [`LogConfig::from_env`].
///
/// # Errors
/// See [`init_logging`].
pub fn init_logging_from_env() -> Result<()> {
    init_logging(&LogConfig::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!(matches!(
            "xml".parse::<LogFormat>(),
            Err(DataError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_builder() {
        let config = LogConfig::new("marketdata_cache=debug")
            .with_format(LogFormat::Json)
            .with_span_events(true);
        assert_eq!(config.level, "marketdata_cache=debug");
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.with_span_events);
        assert!(config.with_file);
    }

    #[test]
    fn test_second_init_fails() {
        let config = LogConfig::new("warn").with_format(LogFormat::Compact);
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
