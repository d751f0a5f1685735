//! Cached, fault-tolerant facade over the data source manager.
//!
//! # Operations
//!
//! | Method | Description |
//! |--------|-------------|
//! | [`get_data`](DataFetchService::get_data) | Single fetch with cache, selection and stats |
//! | [`batch_get_data`](DataFetchService::batch_get_data) | Windowed concurrent fetches in request order |
//! | [`subscribe`](DataFetchService::subscribe) | Polling subscription (see [`crate::subscription`]) |
//! | [`stats`](DataFetchService::stats) | Aggregated request statistics |

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::adapters::{EastmoneyAdapter, SseAdapter, SzseAdapter};
use crate::background::BackgroundTask;
use crate::cache::{Cache, CacheStats};
use crate::config::FeedConfig;
use crate::data_source::{dispatch, DataSource};
use crate::domain::{DataKind, MarketData, TradeDate};
use crate::error::{CoreError, ErrorClass, FetchError, ValidationError};
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::manager::DataSourceManager;
use crate::stats::{RequestStatsAggregate, StatsRecorder};
use crate::SourceKind;

/// Lifetime of every successful result written by the service.
pub const RESULT_TTL: Duration = Duration::from_secs(30 * 60);

pub const DEFAULT_BATCH_CONCURRENCY: usize = 3;

/// Per-call fetch options; their serialized form is part of the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    pub use_cache: bool,
    /// Skip the cache read but still write the fresh result.
    pub force_refresh: bool,
    pub timeout: Option<Duration>,
    /// Pin a source instead of asking the manager for the best one.
    pub data_source: Option<SourceKind>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            force_refresh: false,
            timeout: None,
            data_source: None,
        }
    }
}

impl FetchOptions {
    pub fn without_cache() -> Self {
        Self {
            use_cache: false,
            ..Self::default()
        }
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_source(mut self, source: SourceKind) -> Self {
        self.data_source = Some(source);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSuccess {
    pub data: MarketData,
    pub from_cache: bool,
    /// `None` when served from cache.
    pub source: Option<SourceKind>,
    /// The answering source cannot serve this board; `data` is empty.
    pub not_applicable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub message: String,
    pub http_status: Option<u16>,
    pub classification: ErrorClass,
}

impl From<FetchError> for FetchFailure {
    fn from(error: FetchError) -> Self {
        Self {
            message: error.message().to_owned(),
            http_status: error.http_status(),
            classification: error.class(),
        }
    }
}

pub type FetchResult = Result<FetchSuccess, FetchFailure>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub kind: DataKind,
    pub date: String,
}

impl BatchRequest {
    pub fn new(kind: DataKind, date: impl Into<String>) -> Self {
        Self {
            kind,
            date: date.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    /// Requests per window; windows run one after another.
    pub concurrency: usize,
    pub continue_on_error: bool,
    pub fetch: FetchOptions,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_BATCH_CONCURRENCY,
            continue_on_error: true,
            fetch: FetchOptions::default(),
        }
    }
}

/// Progress callback: `(completed, total)`.
pub type BatchProgress<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

/// State shared between the service handle, batch windows and subscriptions.
pub(crate) struct FetchCore {
    manager: Arc<DataSourceManager>,
    cache: Arc<Cache<MarketData>>,
    stats: StatsRecorder,
}

impl FetchCore {
    pub(crate) async fn get_data(
        &self,
        kind: DataKind,
        date: &str,
        options: &FetchOptions,
    ) -> FetchResult {
        let started = Instant::now();
        if let Err(error) = TradeDate::parse(date) {
            self.stats.record(None, started.elapsed(), false);
            return Err(FetchError::from(error).into());
        }

        let key = cache_key(kind, date, options);
        if options.use_cache && !options.force_refresh {
            if let Some(data) = self.cache.get(&key).await {
                debug!(kind = kind.as_str(), date, "served from cache");
                self.stats.record(None, started.elapsed(), true);
                return Ok(FetchSuccess {
                    data,
                    from_cache: true,
                    source: None,
                    not_applicable: false,
                });
            }
        }

        let source = match self.resolve_source(options.data_source) {
            Ok(source) => source,
            Err(error) => {
                warn!(kind = kind.as_str(), date, error = %error, "no data source available");
                self.stats.record(None, started.elapsed(), false);
                return Err(error.into());
            }
        };
        let source_kind = source.kind();

        let outcome = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, dispatch(source.as_ref(), kind, date))
                .await
                .unwrap_or_else(|_| {
                    Err(FetchError::timeout(format!(
                        "{source_kind} request timed out after {} ms",
                        limit.as_millis()
                    )))
                }),
            None => dispatch(source.as_ref(), kind, date).await,
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(response) => {
                self.manager.record_request(source_kind, elapsed, true);
                self.stats.record(Some(source_kind), elapsed, true);
                if options.use_cache {
                    if let Err(error) = self
                        .cache
                        .set(&key, response.data.clone(), Some(RESULT_TTL))
                        .await
                    {
                        warn!(key = %key, error = %error, "failed to cache fetch result");
                    }
                }
                debug!(
                    kind = kind.as_str(),
                    date,
                    source = source_kind.as_str(),
                    records = response.data.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "fetch succeeded"
                );
                Ok(FetchSuccess {
                    data: response.data,
                    from_cache: false,
                    source: Some(source_kind),
                    not_applicable: response.not_applicable,
                })
            }
            Err(error) => {
                if error.class() != ErrorClass::Validation {
                    self.manager.record_request(source_kind, elapsed, false);
                }
                self.stats.record(Some(source_kind), elapsed, false);
                warn!(
                    kind = kind.as_str(),
                    date,
                    source = source_kind.as_str(),
                    class = %error.class(),
                    error = %error,
                    "fetch failed"
                );
                Err(error.into())
            }
        }
    }

    fn resolve_source(&self, pinned: Option<SourceKind>) -> Result<Arc<dyn DataSource>, FetchError> {
        match pinned {
            Some(kind) => self
                .manager
                .get(kind)
                .filter(|source| source.descriptor().enabled)
                .ok_or_else(|| {
                    FetchError::no_source_available(format!(
                        "data source '{kind}' is not registered or is disabled"
                    ))
                }),
            None => self.manager.select_best_data_source().ok_or_else(|| {
                FetchError::no_source_available("no healthy enabled data source available")
            }),
        }
    }
}

/// `"{kind}:{date}:{options as JSON}"`.
pub fn cache_key(kind: DataKind, date: &str, options: &FetchOptions) -> String {
    let options = serde_json::to_string(options).unwrap_or_default();
    format!("{kind}:{date}:{options}")
}

/// Entry point for callers: cached fetches, batches, subscriptions and stats.
pub struct DataFetchService {
    core: Arc<FetchCore>,
    batch_concurrency: usize,
    background: Vec<BackgroundTask>,
}

impl std::fmt::Debug for DataFetchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFetchService")
            .field("batch_concurrency", &self.batch_concurrency)
            .finish_non_exhaustive()
    }
}

impl DataFetchService {
    pub fn new(manager: Arc<DataSourceManager>, cache: Arc<Cache<MarketData>>) -> Self {
        Self {
            core: Arc::new(FetchCore {
                manager,
                cache,
                stats: StatsRecorder::default(),
            }),
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
            background: Vec::new(),
        }
    }

    /// Real adapters, in-memory cache, no background tasks.
    pub fn with_defaults() -> Self {
        Self::new(
            Arc::new(DataSourceManager::with_default_sources()),
            Arc::new(Cache::in_memory()),
        )
    }

    /// Builds adapters, cache backend and background tasks from configuration.
    ///
    /// The cache sweeper and health monitor are only started when called
    /// inside a tokio runtime.
    pub fn from_config(config: &FeedConfig) -> Result<Self, CoreError> {
        Self::from_config_with_client(config, Arc::new(ReqwestHttpClient::new()))
    }

    pub fn from_config_with_client(
        config: &FeedConfig,
        http_client: Arc<dyn HttpClient>,
    ) -> Result<Self, CoreError> {
        if config.batch_concurrency == 0 {
            return Err(ValidationError::ZeroConcurrency.into());
        }
        config.validate()?;

        let sources: Vec<Arc<dyn DataSource>> = vec![
            Arc::new(SseAdapter::new(
                config.policy_for(SourceKind::Sse),
                Arc::clone(&http_client),
            )),
            Arc::new(SzseAdapter::new(
                config.policy_for(SourceKind::Szse),
                Arc::clone(&http_client),
            )),
            Arc::new(EastmoneyAdapter::new(
                config.policy_for(SourceKind::Eastmoney),
                http_client,
            )),
        ];
        for source in &sources {
            source.set_enabled(config.providers.get(source.kind()).enabled);
        }
        let manager = Arc::new(DataSourceManager::with_sources(sources));

        let backend = config.cache.backend.build()?;
        let cache = Arc::new(Cache::new(backend, config.cache.cache_config()));

        let mut service = Self::new(Arc::clone(&manager), Arc::clone(&cache));
        service.batch_concurrency = config.batch_concurrency;

        let in_runtime = tokio::runtime::Handle::try_current().is_ok();
        if let Some(interval) = config.cache.sweep_interval() {
            if in_runtime {
                service.background.push(cache.spawn_sweeper(interval)?);
            } else {
                warn!("no tokio runtime; cache sweeper not started");
            }
        }
        if let Some(interval) = config.health_check_interval() {
            if in_runtime {
                service
                    .background
                    .push(manager.spawn_health_monitor(interval)?);
            } else {
                warn!("no tokio runtime; health monitor not started");
            }
        }

        info!(
            backend = cache.backend_name(),
            sources = manager.len(),
            primary = ?manager.primary().map(SourceKind::as_str),
            "fetch service configured"
        );
        Ok(service)
    }

    /// Names of the background tasks this service owns and still runs.
    pub fn background_tasks(&self) -> Vec<&'static str> {
        self.background
            .iter()
            .filter(|task| task.is_running())
            .map(BackgroundTask::name)
            .collect()
    }

    /// Stops the cache sweeper and health monitor, if any were started.
    pub fn shutdown(&mut self) {
        for task in &mut self.background {
            task.stop();
        }
        self.background.clear();
    }

    pub(crate) fn core(&self) -> Arc<FetchCore> {
        Arc::clone(&self.core)
    }

    pub fn manager(&self) -> Arc<DataSourceManager> {
        Arc::clone(&self.core.manager)
    }

    pub fn cache(&self) -> Arc<Cache<MarketData>> {
        Arc::clone(&self.core.cache)
    }

    /// Concurrency used by [`batch_options`](Self::batch_options).
    pub fn batch_concurrency(&self) -> usize {
        self.batch_concurrency
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            concurrency: self.batch_concurrency,
            ..BatchOptions::default()
        }
    }

    pub async fn get_data(&self, kind: DataKind, date: &str, options: &FetchOptions) -> FetchResult {
        self.core.get_data(kind, date, options).await
    }

    pub async fn get_sse_data(&self, date: &str, options: &FetchOptions) -> FetchResult {
        self.get_data(DataKind::SseStocks, date, options).await
    }

    pub async fn get_szse_data(&self, date: &str, options: &FetchOptions) -> FetchResult {
        self.get_data(DataKind::SzseStocks, date, options).await
    }

    pub async fn get_index_data(&self, date: &str, options: &FetchOptions) -> FetchResult {
        self.get_data(DataKind::Index, date, options).await
    }

    pub async fn get_limit_up_data(&self, date: &str, options: &FetchOptions) -> FetchResult {
        self.get_data(DataKind::LimitUp, date, options).await
    }

    pub async fn get_limit_down_data(&self, date: &str, options: &FetchOptions) -> FetchResult {
        self.get_data(DataKind::LimitDown, date, options).await
    }

    /// Runs `requests` in windows of `options.concurrency`.
    ///
    /// A window starts only after the previous one has fully completed, and
    /// results come back in request order. With `continue_on_error` off, the
    /// first failure stops further windows and the unissued requests are
    /// reported as aborted, so the output always matches the input length.
    pub async fn batch_get_data(
        &self,
        requests: &[BatchRequest],
        options: &BatchOptions,
        progress: Option<BatchProgress<'_>>,
    ) -> Vec<FetchResult> {
        let total = requests.len();
        if options.concurrency == 0 {
            let failure = FetchFailure::from(FetchError::from(ValidationError::ZeroConcurrency));
            return vec![Err(failure); total];
        }

        let mut results: Vec<FetchResult> = Vec::with_capacity(total);
        let mut completed = 0;
        let mut aborted = false;

        for window in requests.chunks(options.concurrency) {
            if aborted {
                break;
            }

            let mut tasks = JoinSet::new();
            for (offset, request) in window.iter().enumerate() {
                let core = Arc::clone(&self.core);
                let request = request.clone();
                let fetch = options.fetch.clone();
                tasks.spawn(async move {
                    let result = core.get_data(request.kind, &request.date, &fetch).await;
                    (offset, result)
                });
            }

            let mut slots: Vec<Option<FetchResult>> = vec![None; window.len()];
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((offset, result)) => slots[offset] = Some(result),
                    Err(error) => warn!(error = %error, "batch request task failed"),
                }
                completed += 1;
                if let Some(progress) = progress {
                    progress(completed, total);
                }
            }

            for slot in slots {
                let result = slot.unwrap_or_else(|| {
                    Err(FetchFailure::from(FetchError::unknown("batch request task failed")))
                });
                if result.is_err() && !options.continue_on_error {
                    aborted = true;
                }
                results.push(result);
            }
        }

        if aborted {
            let skipped = total - results.len();
            info!(skipped, "batch aborted after failure");
            let placeholder = FetchFailure::from(FetchError::unknown("batch aborted"));
            results.extend(std::iter::repeat(Err(placeholder)).take(skipped));
        }
        results
    }

    pub fn stats(&self) -> RequestStatsAggregate {
        self.core.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.core.stats.reset();
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.core.cache.stats().await
    }

    pub async fn clear_cache(&self) -> Result<(), CoreError> {
        self.core.cache.clear().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn differing_options_never_share_a_cache_key() {
        let base = FetchOptions::default();
        let keys = [
            cache_key(DataKind::SseStocks, "2024-01-05", &base),
            cache_key(DataKind::SseStocks, "2024-01-05", &base.clone().force_refresh()),
            cache_key(
                DataKind::SseStocks,
                "2024-01-05",
                &base.clone().with_source(SourceKind::Szse),
            ),
            cache_key(
                DataKind::SseStocks,
                "2024-01-05",
                &base.clone().with_timeout(Duration::from_secs(2)),
            ),
            cache_key(DataKind::SzseStocks, "2024-01-05", &base),
            cache_key(DataKind::SseStocks, "2024-01-04", &base),
        ];
        for (i, left) in keys.iter().enumerate() {
            for right in &keys[i + 1..] {
                assert_ne!(left, right);
            }
        }
        assert!(keys[0].starts_with("sse_stocks:2024-01-05:{"));
    }

    #[test]
    fn identical_options_share_a_cache_key() {
        assert_eq!(
            cache_key(DataKind::Index, "2024-01-05", &FetchOptions::default()),
            cache_key(DataKind::Index, "2024-01-05", &FetchOptions::default())
        );
    }

    #[test]
    fn failure_carries_class_and_status() {
        let failure = FetchFailure::from(FetchError::from_status("sse", 429));
        assert_eq!(failure.classification, ErrorClass::RateLimit);
        assert_eq!(failure.http_status, Some(429));
    }

    #[tokio::test]
    async fn zero_concurrency_batch_reports_validation_for_every_request() {
        let service = DataFetchService::new(
            Arc::new(DataSourceManager::new()),
            Arc::new(Cache::in_memory()),
        );
        let requests = vec![
            BatchRequest::new(DataKind::Index, "2024-01-05"),
            BatchRequest::new(DataKind::LimitUp, "2024-01-05"),
        ];
        let options = BatchOptions {
            concurrency: 0,
            ..BatchOptions::default()
        };

        let results = service.batch_get_data(&requests, &options, None).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|result| matches!(
            result,
            Err(FetchFailure {
                classification: ErrorClass::Validation,
                ..
            })
        )));
    }

    #[test]
    fn from_config_outside_runtime_skips_background_tasks() {
        let service = DataFetchService::from_config(&FeedConfig::default()).expect("service");
        assert!(service.background_tasks().is_empty());
        assert_eq!(service.manager().len(), 3);
        assert_eq!(service.manager().primary(), Some(SourceKind::Sse));
    }

    #[test]
    fn disabled_providers_stay_out_of_fallback() {
        let mut config = FeedConfig::default();
        config.providers.eastmoney.enabled = false;
        let service = DataFetchService::from_config(&config).expect("service");
        assert_eq!(
            service.manager().fallback(),
            vec![SourceKind::Sse, SourceKind::Szse]
        );
    }

    #[test]
    fn zero_provider_timeout_is_a_config_error() {
        let mut config = FeedConfig::default();
        config.providers.sse.timeout_ms = Some(0);
        let error = DataFetchService::from_config(&config).expect_err("zero timeout");
        assert!(matches!(
            error,
            CoreError::Config(crate::config::ConfigError::InvalidValue { .. })
        ));
    }
}
