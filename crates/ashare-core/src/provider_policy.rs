use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryConfig;
use crate::SourceKind;

/// Per-provider request policy: timeout, pacing quota, retries, breaker
/// thresholds and default priority.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPolicy {
    pub kind: SourceKind,
    pub timeout: Duration,
    pub quota_window: Duration,
    pub quota_limit: u32,
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub priority: u32,
}

impl ProviderPolicy {
    pub fn sse_default() -> Self {
        Self {
            kind: SourceKind::Sse,
            timeout: Duration::from_secs(10),
            quota_window: Duration::from_secs(10),
            quota_limit: 20,
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            priority: 1,
        }
    }

    /// The Shenzhen report API is markedly slower than the other upstreams.
    pub fn szse_default() -> Self {
        Self {
            kind: SourceKind::Szse,
            timeout: Duration::from_secs(30),
            quota_window: Duration::from_secs(10),
            quota_limit: 10,
            retry: RetryConfig::default(),
            // Slow pages time out in bursts; give the report API longer to recover.
            breaker: CircuitBreakerConfig {
                cooldown: Duration::from_secs(60),
                ..CircuitBreakerConfig::default()
            },
            priority: 2,
        }
    }

    pub fn eastmoney_default() -> Self {
        Self {
            kind: SourceKind::Eastmoney,
            timeout: Duration::from_secs(15),
            quota_window: Duration::from_secs(10),
            quota_limit: 20,
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            priority: 3,
        }
    }

    pub fn default_for(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Sse => Self::sse_default(),
            SourceKind::Szse => Self::szse_default(),
            SourceKind::Eastmoney => Self::eastmoney_default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn szse_has_the_longest_timeout() {
        let szse = ProviderPolicy::szse_default();
        for kind in [SourceKind::Sse, SourceKind::Eastmoney] {
            assert!(szse.timeout > ProviderPolicy::default_for(kind).timeout);
        }
    }

    #[test]
    fn default_priorities_are_distinct_and_ordered() {
        let priorities: Vec<u32> = SourceKind::ALL
            .into_iter()
            .map(|kind| ProviderPolicy::default_for(kind).priority)
            .collect();
        assert_eq!(priorities, vec![1, 2, 3]);
    }
}
