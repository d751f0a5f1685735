//! `tracing` subscriber setup for binaries and tests embedding the engine.

use std::env;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    /// Unknown names fall back to `Pretty`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    pub default_level: String,
    pub include_target: bool,
    pub include_timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            default_level: String::from("info"),
            include_target: true,
            include_timestamps: true,
        }
    }
}

impl LogConfig {
    /// Reads `LOG_FORMAT` (pretty, compact, json), `LOG_LEVEL` and
    /// `LOG_TIMESTAMPS` (`false`/`0`/`off` disables them).
    pub fn from_env() -> Self {
        Self {
            format: env::var("LOG_FORMAT")
                .map(|value| LogFormat::parse(&value))
                .unwrap_or_default(),
            default_level: env::var("LOG_LEVEL").unwrap_or_else(|_| String::from("info")),
            include_target: true,
            include_timestamps: env::var("LOG_TIMESTAMPS")
                .map(|value| !matches!(value.as_str(), "false" | "0" | "off"))
                .unwrap_or(true),
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_default_level(mut self, level: impl Into<String>) -> Self {
        self.default_level = level.into();
        self
    }
}

/// Installs the global subscriber; `RUST_LOG` takes precedence over `default_level`.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: LogConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match (config.format, config.include_timestamps) {
        (LogFormat::Json, true) => registry
            .with(fmt::layer().json().with_target(config.include_target))
            .try_init(),
        (LogFormat::Json, false) => registry
            .with(fmt::layer().json().without_time().with_target(config.include_target))
            .try_init(),
        (LogFormat::Compact, true) => registry
            .with(fmt::layer().compact().with_target(config.include_target))
            .try_init(),
        (LogFormat::Compact, false) => registry
            .with(fmt::layer().compact().without_time().with_target(config.include_target))
            .try_init(),
        (LogFormat::Pretty, true) => registry
            .with(fmt::layer().pretty().with_target(config.include_target))
            .try_init(),
        (LogFormat::Pretty, false) => registry
            .with(fmt::layer().pretty().without_time().with_target(config.include_target))
            .try_init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names_are_case_insensitive() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" compact "), LogFormat::Compact);
        assert_eq!(LogFormat::parse("fancy"), LogFormat::Pretty);
    }

    #[test]
    fn second_initialisation_is_rejected() {
        let config = LogConfig::default()
            .with_format(LogFormat::Compact)
            .with_default_level("warn");
        let _ = init_logging(config.clone());
        assert!(init_logging(config).is_err());
    }
}
