//! TTL cache with capacity eviction over pluggable storage backends.
//!
//! Entries are stored as JSON documents (see [`CacheEntry`]) so every backend
//! only has to move strings around. Expired entries are dropped lazily on
//! read and in bulk by [`Cache::clear_expired`], which the background sweeper
//! runs periodically.

mod duckdb;
mod file;
mod memory;

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use self::duckdb::DuckDbBackend;
pub use self::file::FileBackend;
pub use self::memory::MemoryBackend;
use crate::background::BackgroundTask;
use crate::data_source::BoxFuture;
use crate::domain::UtcDateTime;
use crate::error::ValidationError;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAX_ENTRIES: usize = 1_000;

pub type SweeperHandle = BackgroundTask;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache database error: {0}")]
    Database(#[from] ::duckdb::Error),

    #[error("cache entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache backend task failed: {0}")]
    Task(String),
}

/// String key/value storage underneath a [`Cache`].
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>>;

    fn store<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Returns whether a value was present.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, CacheError>>;

    fn keys<'a>(&'a self) -> BoxFuture<'a, Result<Vec<String>, CacheError>>;

    fn clear<'a>(&'a self) -> BoxFuture<'a, Result<(), CacheError>>;
}

/// Backend selection as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheBackendKind {
    Memory,
    /// `path = None` opens an in-memory database.
    DuckDb { path: Option<PathBuf> },
    File { dir: PathBuf },
}

impl Default for CacheBackendKind {
    fn default() -> Self {
        Self::Memory
    }
}

impl CacheBackendKind {
    pub fn build(&self) -> Result<Arc<dyn CacheBackend>, CacheError> {
        let backend: Arc<dyn CacheBackend> = match self {
            Self::Memory => Arc::new(MemoryBackend::new()),
            Self::DuckDb { path: Some(path) } => Arc::new(DuckDbBackend::open(path)?),
            Self::DuckDb { path: None } => Arc::new(DuckDbBackend::open_in_memory()?),
            Self::File { dir } => Arc::new(FileBackend::open(dir)?),
        };
        Ok(backend)
    }
}

/// Stored form of one cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub created_at: UtcDateTime,
    pub expires_at: UtcDateTime,
    pub access_count: u64,
    pub last_accessed_at: UtcDateTime,
    /// Serialized JSON length of `data`.
    pub size_bytes: usize,
}

impl<T> CacheEntry<T> {
    pub fn is_expired_at(&self, now: UtcDateTime) -> bool {
        self.expires_at <= now
    }
}

/// Bookkeeping fields read without deserializing the payload.
#[derive(Debug, Deserialize)]
struct EntryMeta {
    expires_at: UtcDateTime,
    last_accessed_at: UtcDateTime,
    size_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    /// Sum of `size_bytes` over readable entries.
    pub cache_size: usize,
    pub expired_entries: usize,
    /// `hits / (hits + misses)`, `0.0` before the first lookup.
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    /// `0` disables capacity eviction.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Typed cache facade over a [`CacheBackend`].
///
/// Mutations (including the access bookkeeping a hit writes back) are
/// serialized on one async mutex so eviction always sees a consistent
/// snapshot of the key set.
pub struct Cache<T> {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
    write_lock: tokio::sync::Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Cache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self {
            backend,
            config,
            write_lock: tokio::sync::Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            _payload: PhantomData,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), CacheConfig::default())
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Stores `value` under `key`, evicting the least recently accessed
    /// entries first when a new key would exceed `max_entries`.
    pub async fn set(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<(), CacheError> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let size_bytes = serde_json::to_string(&value)?.len();
        let now = UtcDateTime::now();
        let entry = CacheEntry {
            data: value,
            created_at: now,
            expires_at: now.saturating_add(ttl),
            access_count: 0,
            last_accessed_at: now,
            size_bytes,
        };
        let encoded = serde_json::to_string(&entry)?;

        let _guard = self.write_lock.lock().await;
        if self.config.max_entries > 0 && self.backend.load(key).await?.is_none() {
            self.evict_for_insert().await?;
        }
        self.backend.store(key, encoded).await
    }

    async fn evict_for_insert(&self) -> Result<(), CacheError> {
        let keys = self.backend.keys().await?;
        let overflow = (keys.len() + 1).saturating_sub(self.config.max_entries);
        if overflow == 0 {
            return Ok(());
        }

        // Unreadable entries sort first and are evicted before any valid one.
        let mut candidates = Vec::with_capacity(keys.len());
        for key in keys {
            let accessed = match self.backend.load(&key).await {
                Ok(Some(raw)) => serde_json::from_str::<EntryMeta>(&raw)
                    .ok()
                    .map(|meta| meta.last_accessed_at),
                _ => None,
            };
            candidates.push((accessed, key));
        }
        candidates.sort();

        for (_, key) in candidates.into_iter().take(overflow) {
            self.backend.remove(&key).await?;
            debug!(key = %key, "cache entry evicted");
        }
        info!(
            evicted = overflow,
            max_entries = self.config.max_entries,
            backend = self.backend.name(),
            "cache capacity eviction"
        );
        Ok(())
    }

    /// Returns the live value for `key`; expired entries are removed and count as misses.
    pub async fn get(&self, key: &str) -> Option<T> {
        let _guard = self.write_lock.lock().await;
        let value = self.lookup(key).await;
        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    async fn lookup(&self, key: &str) -> Option<T> {
        let raw = match self.backend.load(key).await {
            Ok(raw) => raw?,
            Err(error) => {
                warn!(key = %key, error = %error, "cache read failed, treating as miss");
                return None;
            }
        };

        let mut entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(error) => {
                debug!(key = %key, error = %error, "unreadable cache entry, treating as miss");
                return None;
            }
        };

        let now = UtcDateTime::now();
        if entry.is_expired_at(now) {
            if let Err(error) = self.backend.remove(key).await {
                warn!(key = %key, error = %error, "failed to drop expired cache entry");
            }
            return None;
        }

        entry.access_count = entry.access_count.saturating_add(1);
        entry.last_accessed_at = now;
        match serde_json::to_string(&entry) {
            Ok(encoded) => {
                if let Err(error) = self.backend.store(key, encoded).await {
                    warn!(key = %key, error = %error, "failed to record cache access");
                }
            }
            Err(error) => warn!(key = %key, error = %error, "failed to encode cache access"),
        }
        Some(entry.data)
    }

    /// Whether a live entry exists, without touching hit statistics.
    pub async fn exists(&self, key: &str) -> bool {
        match self.backend.load(key).await {
            Ok(Some(raw)) => serde_json::from_str::<EntryMeta>(&raw)
                .is_ok_and(|meta| meta.expires_at > UtcDateTime::now()),
            Ok(None) => false,
            Err(error) => {
                warn!(key = %key, error = %error, "cache read failed");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let _guard = self.write_lock.lock().await;
        match self.backend.remove(key).await {
            Ok(removed) => removed,
            Err(error) => {
                warn!(key = %key, error = %error, "cache delete failed");
                false
            }
        }
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        self.backend.clear().await?;
        info!(backend = self.backend.name(), "cache cleared");
        Ok(())
    }

    /// Removes expired and unreadable entries, returning how many were dropped.
    pub async fn clear_expired(&self) -> usize {
        let _guard = self.write_lock.lock().await;
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(error) => {
                warn!(error = %error, "cache sweep could not list keys");
                return 0;
            }
        };

        let now = UtcDateTime::now();
        let mut removed = 0;
        for key in keys {
            let stale = match self.backend.load(&key).await {
                Ok(Some(raw)) => serde_json::from_str::<EntryMeta>(&raw)
                    .map_or(true, |meta| meta.expires_at <= now),
                Ok(None) => false,
                Err(error) => {
                    warn!(key = %key, error = %error, "cache sweep read failed");
                    false
                }
            };
            if !stale {
                continue;
            }
            match self.backend.remove(&key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(error) => warn!(key = %key, error = %error, "cache sweep delete failed"),
            }
        }

        if removed > 0 {
            debug!(removed, backend = self.backend.name(), "expired cache entries removed");
        }
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(error) => {
                warn!(error = %error, "cache stats could not list keys");
                Vec::new()
            }
        };

        let now = UtcDateTime::now();
        let mut cache_size = 0;
        let mut expired_entries = 0;
        for key in &keys {
            let Ok(Some(raw)) = self.backend.load(key).await else {
                continue;
            };
            if let Ok(meta) = serde_json::from_str::<EntryMeta>(&raw) {
                cache_size += meta.size_bytes;
                if meta.expires_at <= now {
                    expired_entries += 1;
                }
            }
        }

        CacheStats {
            total_entries: keys.len(),
            cache_size,
            expired_entries,
            hit_rate: self.hit_rate(),
        }
    }

    fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        }
    }

    /// Runs [`clear_expired`](Self::clear_expired) every `interval` until the
    /// handle is dropped or the cache goes away.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> Result<SweeperHandle, ValidationError> {
        if interval.is_zero() {
            return Err(ValidationError::ZeroInterval);
        }

        let cache: Weak<Self> = Arc::downgrade(self);
        Ok(BackgroundTask::spawn("cache-sweeper", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.clear_expired().await;
            }
        }))
    }
}
