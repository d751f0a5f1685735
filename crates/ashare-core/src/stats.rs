use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::UtcDateTime;
use crate::SourceKind;

/// Weight of the newest sample in response-time moving averages.
pub(crate) const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// Exponential moving average step; the first sample seeds the average.
pub(crate) fn smoothed_latency(average_ms: f64, sample: Duration, first: bool) -> f64 {
    let sample_ms = sample.as_secs_f64() * 1_000.0;
    if first {
        sample_ms
    } else {
        RESPONSE_TIME_ALPHA * sample_ms + (1.0 - RESPONSE_TIME_ALPHA) * average_ms
    }
}

/// Per-source request counters kept by the fetch service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRequestStats {
    pub count: u64,
    pub success_count: u64,
    /// Exponential moving average (alpha 0.1) seeded by the first sample.
    pub average_response_time_ms: f64,
}

/// Counters across all fetch-service calls, reset only explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStatsAggregate {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_request_at: Option<UtcDateTime>,
    pub per_source: BTreeMap<String, SourceRequestStats>,
}

impl RequestStatsAggregate {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

/// Thread-safe recorder behind [`RequestStatsAggregate`].
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    inner: Mutex<RequestStatsAggregate>,
}

impl StatsRecorder {
    /// Records one call; `source` is `None` for cache hits and calls rejected
    /// before any source was consulted.
    pub(crate) fn record(&self, source: Option<SourceKind>, elapsed: Duration, success: bool) {
        let mut stats = self.inner.lock().expect("stats mutex poisoned");
        stats.total_requests += 1;
        if success {
            stats.successful_requests += 1;
        } else {
            stats.failed_requests += 1;
        }
        stats.last_request_at = Some(UtcDateTime::now());

        let Some(source) = source else {
            return;
        };
        let entry = stats
            .per_source
            .entry(source.as_str().to_owned())
            .or_default();
        entry.count += 1;
        if success {
            entry.success_count += 1;
        }
        entry.average_response_time_ms =
            smoothed_latency(entry.average_response_time_ms, elapsed, entry.count == 1);
    }

    pub(crate) fn snapshot(&self) -> RequestStatsAggregate {
        self.inner.lock().expect("stats mutex poisoned").clone()
    }

    pub(crate) fn reset(&self) {
        *self.inner.lock().expect("stats mutex poisoned") = RequestStatsAggregate::default();
    }
}
