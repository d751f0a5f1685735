//! Engine configuration: serde defaults plus `ASHARE_*` environment overrides.
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `ASHARE_CACHE_BACKEND` | `memory`, `duckdb` or `file` |
//! | `ASHARE_CACHE_PATH` | DuckDB file or cache directory |
//! | `ASHARE_CACHE_MAX_ENTRIES` | capacity before eviction |
//! | `ASHARE_CACHE_TTL_SECS` | default entry lifetime |
//! | `ASHARE_<PROVIDER>_ENABLED` | `true`/`false` per provider (`SSE`, `SZSE`, `EASTMONEY`) |
//! | `ASHARE_<PROVIDER>_PRIORITY` | selection priority, lower wins |
//! | `ASHARE_<PROVIDER>_TIMEOUT_MS` | request timeout, must be positive |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheBackendKind, CacheConfig, DEFAULT_MAX_ENTRIES, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL};
use crate::provider_policy::ProviderPolicy;
use crate::SourceKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {variable}: {reason}")]
    InvalidValue {
        variable: String,
        value: String,
        reason: String,
    },

    #[error("{variable} is required when {requirement}")]
    Missing {
        variable: String,
        requirement: String,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub backend: CacheBackendKind,
    pub default_ttl_secs: u64,
    pub max_entries: usize,
    /// `0` disables the background sweeper.
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            default_ttl_secs: DEFAULT_TTL.as_secs(),
            max_entries: DEFAULT_MAX_ENTRIES,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
        }
    }
}

impl CacheSettings {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            max_entries: self.max_entries,
        }
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Per-provider overrides; unset fields keep the provider's policy default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub enabled: bool,
    pub priority: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: None,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersSettings {
    pub sse: ProviderSettings,
    pub szse: ProviderSettings,
    pub eastmoney: ProviderSettings,
}

impl ProvidersSettings {
    pub fn get(&self, kind: SourceKind) -> &ProviderSettings {
        match kind {
            SourceKind::Sse => &self.sse,
            SourceKind::Szse => &self.szse,
            SourceKind::Eastmoney => &self.eastmoney,
        }
    }

    fn get_mut(&mut self, kind: SourceKind) -> &mut ProviderSettings {
        match kind {
            SourceKind::Sse => &mut self.sse,
            SourceKind::Szse => &mut self.szse,
            SourceKind::Eastmoney => &mut self.eastmoney,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub cache: CacheSettings,
    pub batch_concurrency: usize,
    /// `0` disables periodic health probes.
    pub health_check_interval_secs: u64,
    pub providers: ProvidersSettings,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            batch_concurrency: 3,
            health_check_interval_secs: 0,
            providers: ProvidersSettings::default(),
        }
    }
}

impl FeedConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_with(|name| env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `ASHARE_*` overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_path = lookup("ASHARE_CACHE_PATH").map(PathBuf::from);
        if let Some(backend) = lookup("ASHARE_CACHE_BACKEND") {
            self.cache.backend = match backend.trim().to_ascii_lowercase().as_str() {
                "memory" => CacheBackendKind::Memory,
                "duckdb" => CacheBackendKind::DuckDb {
                    path: cache_path.clone(),
                },
                "file" => CacheBackendKind::File {
                    dir: cache_path.clone().ok_or_else(|| ConfigError::Missing {
                        variable: String::from("ASHARE_CACHE_PATH"),
                        requirement: String::from("ASHARE_CACHE_BACKEND=file"),
                    })?,
                },
                _ => {
                    return Err(ConfigError::InvalidValue {
                        variable: String::from("ASHARE_CACHE_BACKEND"),
                        value: backend,
                        reason: String::from("expected memory, duckdb or file"),
                    })
                }
            };
        } else if let Some(path) = cache_path {
            match &mut self.cache.backend {
                CacheBackendKind::DuckDb { path: current } => *current = Some(path),
                CacheBackendKind::File { dir } => *dir = path,
                CacheBackendKind::Memory => {}
            }
        }

        if let Some(value) = lookup("ASHARE_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = parse_number("ASHARE_CACHE_MAX_ENTRIES", &value)?;
        }
        if let Some(value) = lookup("ASHARE_CACHE_TTL_SECS") {
            self.cache.default_ttl_secs = parse_number("ASHARE_CACHE_TTL_SECS", &value)?;
        }

        for kind in SourceKind::ALL {
            let prefix = format!("ASHARE_{}", kind.as_str().to_ascii_uppercase());
            let settings = self.providers.get_mut(kind);

            let variable = format!("{prefix}_ENABLED");
            if let Some(value) = lookup(&variable) {
                settings.enabled = parse_flag(&variable, &value)?;
            }
            let variable = format!("{prefix}_PRIORITY");
            if let Some(value) = lookup(&variable) {
                settings.priority = Some(parse_number(&variable, &value)?);
            }
            let variable = format!("{prefix}_TIMEOUT_MS");
            if let Some(value) = lookup(&variable) {
                settings.timeout_ms = Some(parse_number(&variable, &value)?);
            }
        }

        self.validate()
    }

    /// Rejects settings that would make a provider unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in SourceKind::ALL {
            if self.providers.get(kind).timeout_ms == Some(0) {
                return Err(ConfigError::InvalidValue {
                    variable: format!("providers.{}.timeout_ms", kind.as_str()),
                    value: String::from("0"),
                    reason: String::from("timeout must be positive"),
                });
            }
        }
        Ok(())
    }

    /// The provider's default policy with configured timeout and priority applied.
    pub fn policy_for(&self, kind: SourceKind) -> ProviderPolicy {
        let settings = self.providers.get(kind);
        let mut policy = ProviderPolicy::default_for(kind);
        if let Some(priority) = settings.priority {
            policy = policy.with_priority(priority);
        }
        if let Some(timeout_ms) = settings.timeout_ms {
            policy = policy.with_timeout(Duration::from_millis(timeout_ms));
        }
        policy
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }
}

fn parse_number<N: std::str::FromStr>(variable: &str, value: &str) -> Result<N, ConfigError>
where
    N::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|error: N::Err| ConfigError::InvalidValue {
            variable: variable.to_owned(),
            value: value.to_owned(),
            reason: error.to_string(),
        })
}

fn parse_flag(variable: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            variable: variable.to_owned(),
            value: value.to_owned(),
            reason: String::from("expected true or false"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = FeedConfig::from_json(
            r#"{"cache":{"backend":{"type":"file","dir":"/var/cache/ashare"}},"providers":{"szse":{"enabled":false}}}"#,
        )
        .expect("config");

        assert_eq!(
            config.cache.backend,
            CacheBackendKind::File {
                dir: PathBuf::from("/var/cache/ashare")
            }
        );
        assert_eq!(config.cache.default_ttl_secs, 1_800);
        assert_eq!(config.batch_concurrency, 3);
        assert!(!config.providers.szse.enabled);
        assert!(config.providers.sse.enabled);
    }

    #[test]
    fn environment_overrides_backend_and_providers() {
        let mut config = FeedConfig::default();
        config
            .apply_env_with(lookup_from(&[
                ("ASHARE_CACHE_BACKEND", "duckdb"),
                ("ASHARE_CACHE_PATH", "/tmp/quotes.duckdb"),
                ("ASHARE_CACHE_MAX_ENTRIES", "50"),
                ("ASHARE_EASTMONEY_ENABLED", "false"),
                ("ASHARE_SZSE_PRIORITY", "0"),
            ]))
            .expect("overrides");

        assert_eq!(
            config.cache.backend,
            CacheBackendKind::DuckDb {
                path: Some(PathBuf::from("/tmp/quotes.duckdb"))
            }
        );
        assert_eq!(config.cache.max_entries, 50);
        assert!(!config.providers.eastmoney.enabled);
        assert_eq!(config.policy_for(SourceKind::Szse).priority, 0);
        assert_eq!(config.policy_for(SourceKind::Sse).priority, 1);
    }

    #[test]
    fn file_backend_requires_a_path() {
        let mut config = FeedConfig::default();
        let error = config
            .apply_env_with(lookup_from(&[("ASHARE_CACHE_BACKEND", "file")]))
            .expect_err("missing path");
        assert!(matches!(error, ConfigError::Missing { .. }));
    }

    #[test]
    fn malformed_values_are_reported_with_their_variable() {
        let mut config = FeedConfig::default();
        let error = config
            .apply_env_with(lookup_from(&[("ASHARE_SSE_ENABLED", "maybe")]))
            .expect_err("bad flag");
        assert!(error.to_string().contains("ASHARE_SSE_ENABLED"));

        let error = config
            .apply_env_with(lookup_from(&[("ASHARE_CACHE_MAX_ENTRIES", "many")]))
            .expect_err("bad number");
        assert!(matches!(error, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn timeout_override_reaches_the_policy() {
        let mut config = FeedConfig::default();
        config.providers.szse.timeout_ms = Some(5_000);
        assert_eq!(
            config.policy_for(SourceKind::Szse).timeout,
            Duration::from_secs(5)
        );
        assert!(config.health_check_interval().is_none());
        assert_eq!(
            config.cache.sweep_interval(),
            Some(Duration::from_secs(3_600))
        );
    }

    #[test]
    fn zero_provider_timeout_is_rejected_from_json_and_env() {
        let error = FeedConfig::from_json(r#"{"providers":{"szse":{"timeout_ms":0}}}"#)
            .expect_err("zero timeout");
        assert!(
            matches!(&error, ConfigError::InvalidValue { variable, .. } if variable == "providers.szse.timeout_ms"),
            "{error}"
        );

        let mut config = FeedConfig::default();
        let error = config
            .apply_env_with(lookup_from(&[("ASHARE_EASTMONEY_TIMEOUT_MS", "0")]))
            .expect_err("zero timeout");
        assert!(matches!(error, ConfigError::InvalidValue { .. }));

        config
            .apply_env_with(lookup_from(&[("ASHARE_EASTMONEY_TIMEOUT_MS", "2500")]))
            .expect("positive timeout");
        assert_eq!(
            config.policy_for(SourceKind::Eastmoney).timeout,
            Duration::from_millis(2_500)
        );
    }
}
