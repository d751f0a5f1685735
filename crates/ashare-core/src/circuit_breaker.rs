//! Per-upstream circuit breaker.
//!
//! Each adapter owns one breaker sized from its [`ProviderPolicy`]. While the
//! breaker is open, calls fail fast with the remaining cooldown instead of
//! reaching the exchange; the first call after the cooldown is a trial whose
//! outcome closes or re-opens the breaker.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::provider_policy::ProviderPolicy;
use crate::SourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds for one provider's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed calls that open the breaker.
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { failures: u32 },
    Open { until: Instant },
    Trial,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    source: SourceKind,
    config: CircuitBreakerConfig,
    phase: Mutex<Phase>,
}

impl CircuitBreaker {
    pub fn new(source: SourceKind, config: CircuitBreakerConfig) -> Self {
        Self {
            source,
            config,
            phase: Mutex::new(Phase::Closed { failures: 0 }),
        }
    }

    pub fn from_policy(policy: &ProviderPolicy) -> Self {
        Self::new(policy.kind, policy.breaker)
    }

    /// `Err` carries the cooldown left before the next trial call.
    pub fn admit(&self) -> Result<(), Duration> {
        let mut phase = self.lock();
        match *phase {
            Phase::Open { until } => {
                let now = Instant::now();
                if now < until {
                    return Err(until - now);
                }
                info!(source = self.source.as_str(), "circuit breaker trial call");
                *phase = Phase::Trial;
                Ok(())
            }
            Phase::Closed { .. } | Phase::Trial => Ok(()),
        }
    }

    pub fn on_success(&self) {
        let mut phase = self.lock();
        if matches!(*phase, Phase::Trial) {
            info!(source = self.source.as_str(), "circuit breaker closed");
        }
        *phase = Phase::Closed { failures: 0 };
    }

    pub fn on_failure(&self) {
        let mut phase = self.lock();
        let failures = match *phase {
            Phase::Closed { failures } => failures.saturating_add(1),
            // A failed trial re-opens without waiting for the threshold.
            Phase::Trial => self.config.failure_threshold,
            Phase::Open { .. } => return,
        };

        if failures < self.config.failure_threshold {
            *phase = Phase::Closed { failures };
            return;
        }
        warn!(
            source = self.source.as_str(),
            failures,
            cooldown_ms = self.config.cooldown.as_millis() as u64,
            "circuit breaker opened"
        );
        *phase = Phase::Open {
            until: Instant::now() + self.config.cooldown,
        };
    }

    pub fn state(&self) -> CircuitState {
        match *self.lock() {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::Trial => CircuitState::HalfOpen,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            SourceKind::Szse,
            CircuitBreakerConfig {
                failure_threshold,
                cooldown,
            },
        )
    }

    #[test]
    fn opens_at_the_threshold_and_reports_remaining_cooldown() {
        let breaker = breaker(2, Duration::from_secs(60));

        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.admit().is_ok());
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let remaining = breaker.admit().expect_err("open");
        assert!(remaining > Duration::from_secs(59));
    }

    #[test]
    fn a_success_resets_the_failure_streak() {
        let breaker = breaker(2, Duration::from_secs(60));
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn trial_after_cooldown_closes_on_success_and_reopens_on_failure() {
        let breaker = breaker(1, Duration::from_millis(1));

        breaker.on_failure();
        std::thread::sleep(Duration::from_millis(3));
        assert!(breaker.admit().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(3));
        assert!(breaker.admit().is_ok());
        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn thresholds_follow_the_provider_policy() {
        let policy = ProviderPolicy::szse_default();
        let breaker = CircuitBreaker::from_policy(&policy);
        for _ in 1..policy.breaker.failure_threshold {
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
