use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation and contract errors exposed by `ashare-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("date must be an ISO calendar date (YYYY-MM-DD): '{value}'")]
    InvalidDate { value: String },
    #[error("invalid source '{value}', expected one of sse, szse, eastmoney")]
    InvalidSource { value: String },
    #[error("invalid data kind '{value}'")]
    InvalidDataKind { value: String },
    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("batch concurrency must be greater than zero")]
    ZeroConcurrency,
    #[error("polling interval must be greater than zero")]
    ZeroInterval,
}

/// Top-level error type for core operations that are not fetches.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Cache(#[from] crate::cache::CacheError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Manager(#[from] crate::manager::ManagerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse failure taxonomy surfaced to callers of the fetch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Timeout,
    Network,
    RateLimit,
    Authentication,
    Parse,
    NoSourceAvailable,
    NotApplicable,
    Unknown,
}

impl ErrorClass {
    /// Best-effort classification of free-form failure text.
    ///
    /// Only a handful of substrings are recognised; anything else is `Unknown`.
    pub fn classify(message: &str) -> Self {
        let text = message.to_ascii_lowercase();
        if text.contains("timeout") || text.contains("timed out") || text.contains("abort") {
            Self::Timeout
        } else if text.contains("network") || text.contains("fetch") || text.contains("connection")
        {
            Self::Network
        } else if text.contains("rate limit") || text.contains("too many requests") {
            Self::RateLimit
        } else if text.contains("unauthorized") || text.contains("forbidden") {
            Self::Authentication
        } else {
            Self::Unknown
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::Authentication => "authentication",
            Self::Parse => "parse",
            Self::NoSourceAvailable => "no_source_available",
            Self::NotApplicable => "not_applicable",
            Self::Unknown => "unknown",
        }
    }
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure returned by data sources and the fetch service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchError {
    class: ErrorClass,
    message: String,
    http_status: Option<u16>,
    retryable: bool,
}

impl FetchError {
    fn new(class: ErrorClass, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            class,
            message: message.into(),
            http_status: None,
            retryable,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message, false)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message, true)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Network, message, true)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::RateLimit, message, true)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Authentication, message, false)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Parse, message, false)
    }

    pub fn no_source_available(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NoSourceAvailable, message, false)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unknown, message, false)
    }

    /// Builds an error whose class is inferred from the message text.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let class = ErrorClass::classify(&message);
        let retryable = matches!(
            class,
            ErrorClass::Timeout | ErrorClass::Network | ErrorClass::RateLimit
        );
        Self::new(class, message, retryable)
    }

    /// Maps an upstream HTTP status to a classified error.
    pub fn from_status(provider: &str, status: u16) -> Self {
        let message = format!("{provider} upstream returned status {status}");
        let error = match status {
            401 | 403 => Self::authentication(message),
            429 => Self::rate_limited(message),
            408 | 504 => Self::timeout(message),
            _ => Self::network(message),
        };
        error.with_status(status)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub const fn class(&self) -> ErrorClass {
        self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn code(&self) -> String {
        format!("fetch.{}", self.class.as_str())
    }
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.http_status {
            Some(status) => write!(f, "{} (fetch.{}, http {status})", self.message, self.class),
            None => write!(f, "{} (fetch.{})", self.message, self.class),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<ValidationError> for FetchError {
    fn from(error: ValidationError) -> Self {
        Self::validation(error.to_string())
    }
}
