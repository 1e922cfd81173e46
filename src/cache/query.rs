//! Query result cache.
//!
//! Results are stored as JSON under keys from [`build_key`]. Writes are gated:
//! uncacheable categories, oversized collections and (unless configured)
//! empty results are never stored. A read of a key marked stale misses once
//! and drops the stale entry along with its marker.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::adapter::StoreAdapter;
use super::category::CacheCategory;
use super::keys::{CacheKey, build_key};
use super::stale::StaleMarkers;
use super::stats::LatencyWindow;
use super::ttl::TtlPolicyManager;

pub(crate) const METRIC_QUERY_HIT: &str = "cachekeeper_query_hit_total";
pub(crate) const METRIC_QUERY_MISS: &str = "cachekeeper_query_miss_total";

#[derive(Debug, Error)]
pub enum ComputeError<E: std::error::Error + 'static> {
    #[error("computation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Failed(E),
}

#[derive(Debug, Clone)]
pub struct QueryCacheSettings {
    pub namespace: String,
    /// Collections longer than this are not stored.
    pub max_result_size: usize,
    pub cache_empty_results: bool,
    pub compute_timeout: Duration,
    pub jitter_percent: u8,
}

impl Default for QueryCacheSettings {
    fn default() -> Self {
        Self {
            namespace: "query".to_string(),
            max_result_size: 1000,
            cache_empty_results: false,
            compute_timeout: Duration::from_secs(30),
            jitter_percent: 10,
        }
    }
}

/// Why a write was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Uncacheable,
    TooLarge,
    Empty,
    Serialization,
    StoreFailed,
}

impl SkipReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Uncacheable => "uncacheable",
            Self::TooLarge => "too_large",
            Self::Empty => "empty",
            Self::Serialization => "serialization",
            Self::StoreFailed => "store_failed",
        }
    }
}

#[derive(Debug, Default)]
struct LookupCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_misses: AtomicU64,
    writes: AtomicU64,
    skipped_writes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LookupStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_misses: u64,
    pub writes: u64,
    pub skipped_writes: u64,
}

pub struct QueryCache {
    adapter: Arc<StoreAdapter>,
    ttl: Arc<TtlPolicyManager>,
    stale: StaleMarkers,
    latencies: Arc<LatencyWindow>,
    settings: QueryCacheSettings,
    counters: LookupCounters,
}

impl QueryCache {
    pub fn new(
        adapter: Arc<StoreAdapter>,
        ttl: Arc<TtlPolicyManager>,
        stale: StaleMarkers,
        latencies: Arc<LatencyWindow>,
        settings: QueryCacheSettings,
    ) -> Self {
        Self {
            adapter,
            ttl,
            stale,
            latencies,
            settings,
            counters: LookupCounters::default(),
        }
    }

    pub fn settings(&self) -> &QueryCacheSettings {
        &self.settings
    }

    pub fn build_key(&self, query_name: &str, params: &Value, principal: Option<&str>) -> CacheKey {
        build_key(&self.settings.namespace, query_name, params, principal)
    }

    /// Cached value for `key`, or `None` on miss, stale marker or decode failure.
    pub async fn get_cached<T: DeserializeOwned>(&self, query_name: &str, key: &CacheKey) -> Option<T> {
        let started = Instant::now();
        let outcome = self.lookup(key).await;
        self.latencies.record(started.elapsed());

        match outcome {
            Some(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_QUERY_HIT, "query" => query_name.to_string()).increment(1);
                debug!(query = query_name, key = %key, "Query cache hit");
                Some(value)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_QUERY_MISS, "query" => query_name.to_string()).increment(1);
                debug!(query = query_name, key = %key, "Query cache miss");
                None
            }
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        if self.stale.take(key.as_str()).await {
            self.counters.stale_misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let raw = self.adapter.get(key.as_str()).await?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = %key, error = %err, "Cached value failed to decode; dropping entry");
                self.adapter.delete(key.as_str()).await;
                None
            }
        }
    }

    /// Store `value` under `key` with the category's jittered TTL.
    ///
    /// Returns `true` only when the value was written.
    pub async fn cache_result<T: Serialize>(
        &self,
        query_name: &str,
        key: &CacheKey,
        value: &T,
        category: &CacheCategory,
    ) -> bool {
        match self.try_store(key, value, category).await {
            Ok(()) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(reason) => {
                self.counters.skipped_writes.fetch_add(1, Ordering::Relaxed);
                debug!(
                    query = query_name,
                    key = %key,
                    category = %category,
                    reason = reason.as_str(),
                    "Query result not cached"
                );
                false
            }
        }
    }

    async fn try_store<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        category: &CacheCategory,
    ) -> Result<(), SkipReason> {
        let ttl = self
            .ttl
            .store_ttl(category, self.settings.jitter_percent)
            .ok_or(SkipReason::Uncacheable)?;
        let json = serde_json::to_value(value).map_err(|_| SkipReason::Serialization)?;
        if collection_len(&json).is_some_and(|len| len > self.settings.max_result_size) {
            return Err(SkipReason::TooLarge);
        }
        if is_empty(&json) && !self.settings.cache_empty_results {
            return Err(SkipReason::Empty);
        }
        let bytes = serde_json::to_vec(&json).map_err(|_| SkipReason::Serialization)?;
        if !self.adapter.set(key.as_str(), Bytes::from(bytes), Some(ttl)).await {
            return Err(SkipReason::StoreFailed);
        }
        self.stale.clear(key.as_str()).await;
        Ok(())
    }

    /// Cached value, or compute, store and return it.
    ///
    /// The computation is bounded by the configured compute timeout. Its
    /// errors are returned unchanged and nothing is stored.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        query_name: &str,
        key: &CacheKey,
        category: &CacheCategory,
        compute: F,
    ) -> Result<T, ComputeError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: std::error::Error + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get_cached(query_name, key).await {
            return Ok(value);
        }
        let limit = self.settings.compute_timeout;
        let value = match tokio::time::timeout(limit, compute()).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => return Err(ComputeError::Failed(err)),
            Err(_) => {
                warn!(query = query_name, timeout_ms = limit.as_millis() as u64, "Query computation timed out");
                return Err(ComputeError::Timeout(limit));
            }
        };
        self.cache_result(query_name, key, &value, category).await;
        Ok(value)
    }

    pub fn stats(&self) -> LookupStats {
        LookupStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_misses: self.counters.stale_misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            skipped_writes: self.counters.skipped_writes.load(Ordering::Relaxed),
        }
    }
}

/// A named, categorised query bound to its cache.
pub struct CachedQuery<F> {
    cache: Arc<QueryCache>,
    query_name: String,
    category: CacheCategory,
    compute: F,
}

/// Wrap `compute` so every call goes through `cache`.
pub fn cached<F>(
    cache: Arc<QueryCache>,
    query_name: impl Into<String>,
    category: CacheCategory,
    compute: F,
) -> CachedQuery<F> {
    CachedQuery {
        cache,
        query_name: query_name.into(),
        category,
        compute,
    }
}

impl<F> CachedQuery<F> {
    pub async fn call<T, E, Fut>(&self, params: Value, principal: Option<&str>) -> Result<T, ComputeError<E>>
    where
        F: Fn(Value) -> Fut,
        T: Serialize + DeserializeOwned,
        E: std::error::Error + 'static,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = self.cache.build_key(&self.query_name, &params, principal);
        self.cache
            .get_or_compute(&self.query_name, &key, &self.category, || (self.compute)(params))
            .await
    }
}

fn collection_len(value: &Value) -> Option<usize> {
    match value {
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
