//! Data source registry with health tracking and primary/fallback selection.
//!
//! Sources live in an arena keyed by [`SourceKind`]; `primary` and `fallback`
//! only ever hold keys into it. Registry, health records and the
//! primary/fallback assignment share one lock so readers never observe a
//! half-applied reassignment.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::adapters::{EastmoneyAdapter, SseAdapter, SzseAdapter};
use crate::background::BackgroundTask;
use crate::circuit_breaker::CircuitState;
use crate::data_source::DataSource;
use crate::domain::UtcDateTime;
use crate::error::ValidationError;
use crate::stats::smoothed_latency;
use crate::SourceKind;

/// Consecutive request failures after which a source is marked unhealthy.
pub const UNHEALTHY_AFTER_FAILURES: u32 = 3;

pub type HealthMonitorHandle = BackgroundTask;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("data source '{kind}' is not registered")]
    NotRegistered { kind: SourceKind },
    #[error("data source '{kind}' is unhealthy or disabled")]
    Unhealthy { kind: SourceKind },
}

/// Runtime health of one registered source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceHealthRecord {
    pub is_healthy: bool,
    pub total_requests: u64,
    pub error_count: u64,
    pub average_response_time_ms: f64,
    pub last_checked_at: Option<UtcDateTime>,
    pub consecutive_failures: u32,
    /// Upstream breaker state at the time the record was read.
    #[serde(default)]
    pub circuit: Option<CircuitState>,
}

impl Default for DataSourceHealthRecord {
    fn default() -> Self {
        Self {
            is_healthy: true,
            total_requests: 0,
            error_count: 0,
            average_response_time_ms: 0.0,
            last_checked_at: None,
            consecutive_failures: 0,
            circuit: None,
        }
    }
}

impl DataSourceHealthRecord {
    fn record_request(&mut self, elapsed: Duration, success: bool) {
        self.average_response_time_ms =
            smoothed_latency(self.average_response_time_ms, elapsed, self.total_requests == 0);
        self.total_requests += 1;

        if success {
            self.consecutive_failures = 0;
            self.is_healthy = true;
        } else {
            self.error_count += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
                self.is_healthy = false;
            }
        }
    }
}

#[derive(Default)]
struct ManagerState {
    sources: BTreeMap<SourceKind, Arc<dyn DataSource>>,
    health: BTreeMap<SourceKind, DataSourceHealthRecord>,
    primary: Option<SourceKind>,
    fallback: Vec<SourceKind>,
}

impl ManagerState {
    fn health_of(&self, kind: SourceKind) -> Option<DataSourceHealthRecord> {
        let mut record = self.health.get(&kind)?.clone();
        record.circuit = self
            .sources
            .get(&kind)
            .and_then(|source| source.circuit_state());
        Some(record)
    }

    fn is_usable(&self, kind: SourceKind) -> bool {
        let enabled = self
            .sources
            .get(&kind)
            .is_some_and(|source| source.descriptor().enabled);
        let healthy = self.health.get(&kind).is_some_and(|record| record.is_healthy);
        enabled && healthy
    }

    fn priority_of(&self, kind: SourceKind) -> u32 {
        self.sources
            .get(&kind)
            .map_or(u32::MAX, |source| source.descriptor().priority)
    }

    fn sort_fallback(&mut self) {
        let mut keyed: Vec<_> = self
            .fallback
            .iter()
            .map(|kind| (self.priority_of(*kind), *kind))
            .collect();
        keyed.sort();
        self.fallback = keyed.into_iter().map(|(_, kind)| kind).collect();
    }

    fn best(&self) -> Option<SourceKind> {
        if let Some(primary) = self.primary {
            if self.is_usable(primary) {
                return Some(primary);
            }
        }

        let mut candidates: Vec<_> = self
            .sources
            .keys()
            .copied()
            .filter(|kind| self.is_usable(*kind))
            .map(|kind| (self.priority_of(kind), kind))
            .collect();
        candidates.sort();
        candidates.first().map(|(_, kind)| *kind)
    }

    /// Replaces an unusable primary with the best remaining candidate.
    fn reselect_primary(&mut self) {
        let current = self.primary;
        if current.is_some_and(|kind| self.is_usable(kind)) {
            return;
        }
        self.primary = None;
        self.primary = self.best();
        if self.primary != current {
            info!(
                previous = ?current.map(SourceKind::as_str),
                primary = ?self.primary.map(SourceKind::as_str),
                "primary data source reassigned"
            );
        }
    }
}

/// Registry of data sources, their health and the current selection.
#[derive(Default)]
pub struct DataSourceManager {
    state: RwLock<ManagerState>,
}

impl DataSourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: Vec<Arc<dyn DataSource>>) -> Self {
        let manager = Self::new();
        for source in sources {
            manager.register(source);
        }
        manager
    }

    /// The three exchange/aggregator adapters with their default policies.
    pub fn with_default_sources() -> Self {
        Self::with_sources(vec![
            Arc::new(SseAdapter::default()),
            Arc::new(SzseAdapter::default()),
            Arc::new(EastmoneyAdapter::default()),
        ])
    }

    fn read(&self) -> RwLockReadGuard<'_, ManagerState> {
        self.state.read().expect("manager lock is not poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, ManagerState> {
        self.state.write().expect("manager lock is not poisoned")
    }

    /// Adds or replaces the source of the same kind with a fresh health record.
    pub fn register(&self, source: Arc<dyn DataSource>) {
        let kind = source.kind();
        let descriptor = source.descriptor();
        let mut state = self.write();

        state.fallback.retain(|existing| *existing != kind);
        state.sources.insert(kind, source);
        state
            .health
            .insert(kind, DataSourceHealthRecord::default());

        if descriptor.enabled {
            state.fallback.push(kind);
            state.sort_fallback();
            if state.primary.is_none() {
                state.primary = Some(kind);
            }
        } else if state.primary == Some(kind) {
            state.primary = None;
            state.reselect_primary();
        }

        info!(
            source = kind.as_str(),
            name = %descriptor.name,
            priority = descriptor.priority,
            enabled = descriptor.enabled,
            "data source registered"
        );
    }

    pub fn unregister(&self, kind: SourceKind) -> Option<Arc<dyn DataSource>> {
        let mut state = self.write();
        let removed = state.sources.remove(&kind)?;
        state.health.remove(&kind);
        state.fallback.retain(|existing| *existing != kind);
        if state.primary == Some(kind) {
            state.primary = None;
            state.reselect_primary();
        }
        info!(source = kind.as_str(), "data source unregistered");
        Some(removed)
    }

    pub fn get(&self, kind: SourceKind) -> Option<Arc<dyn DataSource>> {
        self.read().sources.get(&kind).cloned()
    }

    pub fn sources(&self) -> Vec<Arc<dyn DataSource>> {
        self.read().sources.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().sources.is_empty()
    }

    pub fn health(&self, kind: SourceKind) -> Option<DataSourceHealthRecord> {
        self.read().health_of(kind)
    }

    pub fn health_snapshot(&self) -> BTreeMap<SourceKind, DataSourceHealthRecord> {
        let state = self.read();
        state
            .health
            .keys()
            .filter_map(|kind| Some((*kind, state.health_of(*kind)?)))
            .collect()
    }

    pub fn primary(&self) -> Option<SourceKind> {
        self.read().primary
    }

    pub fn fallback(&self) -> Vec<SourceKind> {
        self.read().fallback.clone()
    }

    /// Healthy enabled primary, else the healthy enabled source with the
    /// lowest priority value (ties broken by kind order).
    pub fn select_best_data_source(&self) -> Option<Arc<dyn DataSource>> {
        let state = self.read();
        let selected = state.best();
        debug!(selected = ?selected.map(SourceKind::as_str), "data source selection");
        selected.and_then(|kind| state.sources.get(&kind).cloned())
    }

    pub fn set_primary_source(&self, kind: SourceKind) -> Result<(), ManagerError> {
        let mut state = self.write();
        if !state.sources.contains_key(&kind) {
            return Err(ManagerError::NotRegistered { kind });
        }
        if !state.is_usable(kind) {
            return Err(ManagerError::Unhealthy { kind });
        }
        state.primary = Some(kind);
        info!(primary = kind.as_str(), "primary data source set");
        Ok(())
    }

    /// Disabling drops the source from fallback (and from primary); enabling
    /// re-adds it to fallback without reclaiming primary.
    pub fn set_source_enabled(&self, kind: SourceKind, enabled: bool) -> Result<(), ManagerError> {
        let mut state = self.write();
        let source = state
            .sources
            .get(&kind)
            .cloned()
            .ok_or(ManagerError::NotRegistered { kind })?;
        source.set_enabled(enabled);

        state.fallback.retain(|existing| *existing != kind);
        if enabled {
            state.fallback.push(kind);
            state.sort_fallback();
        } else if state.primary == Some(kind) {
            state.reselect_primary();
        }
        info!(source = kind.as_str(), enabled, "data source toggled");
        Ok(())
    }

    pub fn set_source_priority(&self, kind: SourceKind, priority: u32) -> Result<(), ManagerError> {
        let mut state = self.write();
        let source = state
            .sources
            .get(&kind)
            .cloned()
            .ok_or(ManagerError::NotRegistered { kind })?;
        source.set_priority(priority);
        state.sort_fallback();
        debug!(source = kind.as_str(), priority, "data source priority updated");
        Ok(())
    }

    /// Folds one request outcome into the source's health record.
    pub fn record_request(&self, kind: SourceKind, elapsed: Duration, success: bool) {
        let mut state = self.write();
        let Some(record) = state.health.get_mut(&kind) else {
            return;
        };
        let was_healthy = record.is_healthy;
        record.record_request(elapsed, success);
        let is_healthy = record.is_healthy;

        if was_healthy != is_healthy {
            warn!(
                source = kind.as_str(),
                healthy = is_healthy,
                "data source health changed after request"
            );
            if state.primary.is_none() || state.primary == Some(kind) {
                state.reselect_primary();
            }
        }
    }

    /// Probes every registered source concurrently and updates health records.
    ///
    /// When the primary fails its probe the best remaining source is promoted.
    pub async fn check_all_data_sources_health(&self) -> BTreeMap<SourceKind, bool> {
        let sources: Vec<_> = self
            .read()
            .sources
            .iter()
            .map(|(kind, source)| (*kind, Arc::clone(source)))
            .collect();

        let mut probes = JoinSet::new();
        for (kind, source) in sources {
            probes.spawn(async move {
                let healthy = source.health_check().await;
                (kind, healthy)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((kind, healthy)) => {
                    results.insert(kind, healthy);
                }
                Err(error) => warn!(error = %error, "health probe task failed"),
            }
        }

        let checked_at = UtcDateTime::now();
        let mut state = self.write();
        for (kind, healthy) in &results {
            let Some(record) = state.health.get_mut(kind) else {
                continue;
            };
            if record.is_healthy != *healthy {
                info!(source = kind.as_str(), healthy = *healthy, "data source health changed");
            }
            record.is_healthy = *healthy;
            record.last_checked_at = Some(checked_at);
            if *healthy {
                record.consecutive_failures = 0;
            }
        }
        state.reselect_primary();

        results
    }

    /// Runs [`check_all_data_sources_health`](Self::check_all_data_sources_health)
    /// every `interval` until the handle is dropped or the manager goes away.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        interval: Duration,
    ) -> Result<HealthMonitorHandle, ValidationError> {
        if interval.is_zero() {
            return Err(ValidationError::ZeroInterval);
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        Ok(BackgroundTask::spawn("health-monitor", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the first probe
            // lands one interval after start.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let results = manager.check_all_data_sources_health().await;
                debug!(probed = results.len(), "periodic health check completed");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::data_source::{
        BoxFuture, DataSourceDescriptor, DescriptorCell, FetchOutcome, RequestConfig,
        SourceResponse,
    };
    use crate::domain::{NormalizedIndexRecord, NormalizedStockRecord};

    struct ProbeSource {
        kind: SourceKind,
        descriptor: DescriptorCell,
        healthy: AtomicBool,
        probes: AtomicUsize,
    }

    impl ProbeSource {
        fn new(kind: SourceKind, priority: u32) -> Arc<Self> {
            Arc::new(Self {
                kind,
                descriptor: DescriptorCell::new(DataSourceDescriptor {
                    name: kind.as_str().to_owned(),
                    kind,
                    base_url: String::from("http://localhost"),
                    enabled: true,
                    priority,
                    request_config: RequestConfig {
                        timeout: Duration::from_secs(1),
                        headers: BTreeMap::new(),
                    },
                }),
                healthy: AtomicBool::new(true),
                probes: AtomicUsize::new(0),
            })
        }
    }

    impl DataSource for ProbeSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn descriptor(&self) -> DataSourceDescriptor {
            self.descriptor.snapshot()
        }

        fn set_enabled(&self, enabled: bool) {
            self.descriptor.set_enabled(enabled);
        }

        fn set_priority(&self, priority: u32) {
            self.descriptor.set_priority(priority);
        }

        fn get_sse_data<'a>(
            &'a self,
            _date: &'a str,
        ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedStockRecord>>> {
            Box::pin(async { Ok(SourceResponse::ok(Vec::new())) })
        }

        fn get_szse_data<'a>(
            &'a self,
            _date: &'a str,
        ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedStockRecord>>> {
            Box::pin(async { Ok(SourceResponse::ok(Vec::new())) })
        }

        fn get_index_data<'a>(
            &'a self,
            _date: &'a str,
        ) -> BoxFuture<'a, FetchOutcome<Vec<NormalizedIndexRecord>>> {
            Box::pin(async { Ok(SourceResponse::ok(Vec::new())) })
        }

        fn health_check<'a>(&'a self) -> BoxFuture<'a, bool> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let healthy = self.healthy.load(Ordering::SeqCst);
            Box::pin(async move { healthy })
        }
    }

    fn manager_of(sources: &[Arc<ProbeSource>]) -> DataSourceManager {
        DataSourceManager::with_sources(
            sources
                .iter()
                .map(|source| Arc::clone(source) as Arc<dyn DataSource>)
                .collect(),
        )
    }

    #[test]
    fn first_enabled_source_becomes_primary_and_fallback_is_sorted() {
        let manager = manager_of(&[
            ProbeSource::new(SourceKind::Eastmoney, 3),
            ProbeSource::new(SourceKind::Sse, 1),
            ProbeSource::new(SourceKind::Szse, 2),
        ]);

        assert_eq!(manager.primary(), Some(SourceKind::Eastmoney));
        assert_eq!(
            manager.fallback(),
            vec![SourceKind::Sse, SourceKind::Szse, SourceKind::Eastmoney]
        );
    }

    #[test]
    fn selection_prefers_lowest_priority_when_primary_is_unusable() {
        let manager = manager_of(&[
            ProbeSource::new(SourceKind::Eastmoney, 3),
            ProbeSource::new(SourceKind::Szse, 2),
            ProbeSource::new(SourceKind::Sse, 1),
        ]);
        manager
            .set_source_enabled(SourceKind::Eastmoney, false)
            .expect("registered");

        let best = manager.select_best_data_source().expect("a source");
        assert_eq!(best.kind(), SourceKind::Sse);
        assert_eq!(manager.primary(), Some(SourceKind::Sse));
    }

    #[test]
    fn priority_ties_break_by_kind_order() {
        let manager = manager_of(&[
            ProbeSource::new(SourceKind::Eastmoney, 1),
            ProbeSource::new(SourceKind::Szse, 1),
        ]);
        manager.unregister(SourceKind::Eastmoney);
        manager.register(ProbeSource::new(SourceKind::Eastmoney, 1));
        manager
            .set_source_enabled(SourceKind::Szse, false)
            .expect("registered");
        manager
            .set_source_enabled(SourceKind::Szse, true)
            .expect("registered");

        assert_eq!(manager.fallback(), vec![SourceKind::Szse, SourceKind::Eastmoney]);
    }

    #[test]
    fn three_failed_requests_mark_unhealthy_and_success_restores() {
        let manager = manager_of(&[ProbeSource::new(SourceKind::Sse, 1)]);
        for _ in 0..2 {
            manager.record_request(SourceKind::Sse, Duration::from_millis(10), false);
        }
        assert!(manager.health(SourceKind::Sse).expect("record").is_healthy);

        manager.record_request(SourceKind::Sse, Duration::from_millis(10), false);
        let record = manager.health(SourceKind::Sse).expect("record");
        assert!(!record.is_healthy);
        assert_eq!(record.error_count, 3);
        assert!(manager.select_best_data_source().is_none());

        manager.record_request(SourceKind::Sse, Duration::from_millis(10), true);
        assert!(manager.health(SourceKind::Sse).expect("record").is_healthy);
    }

    #[test]
    fn response_time_average_is_seeded_then_smoothed() {
        let manager = manager_of(&[ProbeSource::new(SourceKind::Szse, 1)]);
        manager.record_request(SourceKind::Szse, Duration::from_millis(100), true);
        assert_eq!(
            manager
                .health(SourceKind::Szse)
                .expect("record")
                .average_response_time_ms,
            100.0
        );

        manager.record_request(SourceKind::Szse, Duration::from_millis(200), true);
        let average = manager
            .health(SourceKind::Szse)
            .expect("record")
            .average_response_time_ms;
        assert!((average - 110.0).abs() < 1e-9);
    }

    #[test]
    fn set_primary_rejects_missing_and_unhealthy_sources() {
        let manager = manager_of(&[ProbeSource::new(SourceKind::Sse, 1)]);
        assert_eq!(
            manager.set_primary_source(SourceKind::Szse),
            Err(ManagerError::NotRegistered {
                kind: SourceKind::Szse
            })
        );

        for _ in 0..UNHEALTHY_AFTER_FAILURES {
            manager.record_request(SourceKind::Sse, Duration::ZERO, false);
        }
        assert_eq!(
            manager.set_primary_source(SourceKind::Sse),
            Err(ManagerError::Unhealthy {
                kind: SourceKind::Sse
            })
        );
    }

    #[tokio::test]
    async fn failed_probe_of_primary_promotes_next_best() {
        let sse = ProbeSource::new(SourceKind::Sse, 1);
        let szse = ProbeSource::new(SourceKind::Szse, 2);
        let manager = manager_of(&[Arc::clone(&sse), Arc::clone(&szse)]);
        assert_eq!(manager.primary(), Some(SourceKind::Sse));

        sse.healthy.store(false, Ordering::SeqCst);
        let results = manager.check_all_data_sources_health().await;

        assert_eq!(results.get(&SourceKind::Sse), Some(&false));
        assert_eq!(results.get(&SourceKind::Szse), Some(&true));
        assert_eq!(manager.primary(), Some(SourceKind::Szse));
        assert!(manager
            .health(SourceKind::Sse)
            .expect("record")
            .last_checked_at
            .is_some());
        assert_eq!(
            manager.select_best_data_source().map(|source| source.kind()),
            Some(SourceKind::Szse)
        );
    }

    #[tokio::test]
    async fn health_monitor_probes_until_dropped() {
        let sse = ProbeSource::new(SourceKind::Sse, 1);
        let manager = Arc::new(manager_of(&[Arc::clone(&sse)]));

        let handle = manager
            .spawn_health_monitor(Duration::from_millis(10))
            .expect("non-zero interval");
        tokio::time::sleep(Duration::from_millis(55)).await;
        drop(handle);

        let probes = sse.probes.load(Ordering::SeqCst);
        assert!(probes >= 2, "expected periodic probes, saw {probes}");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(sse.probes.load(Ordering::SeqCst), probes);
    }

    #[test]
    fn zero_interval_monitor_is_rejected() {
        let manager = Arc::new(DataSourceManager::new());
        assert!(matches!(
            manager.spawn_health_monitor(Duration::ZERO),
            Err(ValidationError::ZeroInterval)
        ));
    }
}
