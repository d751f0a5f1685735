//! Resilient A-share quote engine.
//!
//! This crate contains:
//! - Normalized stock and index records for the Shanghai and Shenzhen boards
//! - Exchange and aggregator adapters behind one data source trait
//! - Health-tracked source registry with priority fallback
//! - A TTL cache with memory, DuckDB and file backends
//! - The fetch service: caching, statistics, batching and polling subscriptions

pub mod adapters;
pub mod background;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod data_source;
pub mod domain;
pub mod error;
pub mod http_client;
pub mod jsonp;
pub mod logging;
pub mod manager;
pub mod provider_policy;
pub mod retry;
pub mod service;
pub mod source;
pub mod stats;
pub mod subscription;
pub mod throttling;

pub use adapters::{EastmoneyAdapter, SseAdapter, SzseAdapter};
pub use background::BackgroundTask;
pub use cache::{
    Cache, CacheBackend, CacheBackendKind, CacheConfig, CacheEntry, CacheError, CacheStats,
    DuckDbBackend, FileBackend, MemoryBackend,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{CacheSettings, ConfigError, FeedConfig, ProviderSettings, ProvidersSettings};
pub use data_source::{
    dispatch, BoxFuture, DataSource, DataSourceDescriptor, DescriptorCell, FetchOutcome,
    RequestConfig, SourceResponse,
};
pub use domain::{
    DataKind, MarketData, NormalizedIndexRecord, NormalizedStockRecord, TradeDate, UtcDateTime,
};
pub use error::{CoreError, ErrorClass, FetchError, ValidationError};
pub use http_client::{
    HttpClient, HttpError, HttpErrorKind, HttpRequest, HttpResponse, ReqwestHttpClient,
};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use manager::{DataSourceHealthRecord, DataSourceManager, HealthMonitorHandle, ManagerError};
pub use provider_policy::ProviderPolicy;
pub use retry::{Backoff, RetryConfig};
pub use service::{
    BatchOptions, BatchRequest, DataFetchService, FetchFailure, FetchOptions, FetchResult,
    FetchSuccess,
};
pub use source::SourceKind;
pub use stats::{RequestStatsAggregate, SourceRequestStats};
pub use subscription::{SubscribeOptions, Subscription};
