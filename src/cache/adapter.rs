//! Fault-isolating front for the backing store.
//!
//! Every call is bounded by a timeout. Failures are logged at error level and
//! counted, then degraded to a neutral value: reads miss, writes report
//! `false`, deletions count zero. Callers that need to know about a failure
//! use the `try_*` variants, which log and count the same way but return the
//! error.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use tracing::{error, warn};

use super::store::{CacheStore, StoreError, StoreInfo};

pub(crate) const METRIC_STORE_ERROR: &str = "cachekeeper_store_error_total";
pub(crate) const METRIC_STORE_TIMEOUT: &str = "cachekeeper_store_timeout_total";

/// Failure counters kept by the adapter.
#[derive(Debug, Default)]
pub struct AdapterCounters {
    operations: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterCounterSnapshot {
    pub operations: u64,
    pub errors: u64,
    pub timeouts: u64,
}

impl AdapterCounters {
    pub fn snapshot(&self) -> AdapterCounterSnapshot {
        AdapterCounterSnapshot {
            operations: self.operations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

pub struct StoreAdapter {
    store: Arc<dyn CacheStore>,
    timeout: Duration,
    counters: AdapterCounters,
}

impl StoreAdapter {
    pub fn new(store: Arc<dyn CacheStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            counters: AdapterCounters::default(),
        }
    }

    pub fn counters(&self) -> AdapterCounterSnapshot {
        self.counters.snapshot()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn guarded<T, F>(&self, op: &'static str, key: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        self.counters.operations.fetch_add(1, Ordering::Relaxed);
        let outcome = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                op,
                after: self.timeout,
            }),
        };

        if let Err(err) = &outcome {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_STORE_ERROR, "op" => op).increment(1);
            if matches!(err, StoreError::Timeout { .. }) {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_STORE_TIMEOUT, "op" => op).increment(1);
            }
            error!(
                op,
                key,
                error = %err,
                "Cache store operation failed; degrading"
            );
        }
        outcome
    }

    // ========================================================================
    // Checked variants
    // ========================================================================

    pub async fn try_delete(&self, key: &str) -> Result<bool, StoreError> {
        self.guarded("delete", key, self.store.delete(key)).await
    }

    pub async fn try_scan_delete(&self, pattern: &str) -> Result<u64, StoreError> {
        self.guarded("scan_delete", pattern, self.store.scan_delete(pattern))
            .await
    }

    pub async fn try_set_add(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        self.guarded("set_add", key, self.store.set_add(key, members))
            .await
    }

    pub async fn try_info(&self) -> Result<StoreInfo, StoreError> {
        self.guarded("info", "*", self.store.info()).await
    }

    // ========================================================================
    // Degrading variants
    // ========================================================================

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.guarded("get", key, self.store.get(key))
            .await
            .unwrap_or(None)
    }

    pub async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> bool {
        if ttl.is_some_and(|ttl| ttl.is_zero()) {
            warn!(key, "Refusing to store key with zero ttl");
            return false;
        }
        self.guarded("set", key, self.store.set(key, value, ttl))
            .await
            .unwrap_or(false)
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.try_delete(key).await.unwrap_or(false)
    }

    pub async fn scan_delete(&self, pattern: &str) -> u64 {
        self.try_scan_delete(pattern).await.unwrap_or(0)
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.guarded("exists", key, self.store.exists(key))
            .await
            .unwrap_or(false)
    }

    pub async fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        self.guarded("ttl_remaining", key, self.store.ttl_remaining(key))
            .await
            .unwrap_or(None)
    }

    pub async fn increment(&self, key: &str, by: i64) -> Option<i64> {
        self.guarded("increment", key, self.store.increment(key, by))
            .await
            .ok()
    }

    pub async fn set_add(&self, key: &str, members: &[String]) -> u64 {
        self.try_set_add(key, members).await.unwrap_or(0)
    }

    pub async fn set_remove(&self, key: &str, members: &[String]) -> u64 {
        self.guarded("set_remove", key, self.store.set_remove(key, members))
            .await
            .unwrap_or(0)
    }

    pub async fn set_members(&self, key: &str) -> Vec<String> {
        self.guarded("set_members", key, self.store.set_members(key))
            .await
            .unwrap_or_default()
    }

    pub async fn set_contains(&self, key: &str, member: &str) -> bool {
        self.guarded("set_contains", key, self.store.set_contains(key, member))
            .await
            .unwrap_or(false)
    }

    pub async fn info(&self) -> StoreInfo {
        self.try_info().await.unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;

    use crate::cache::store::{CacheStore, StoreError, StoreInfo};

    /// A store whose every call fails.
    pub(crate) struct BrokenStore;

    fn down() -> StoreError {
        StoreError::Unavailable("connection refused".to_string())
    }

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _: &str) -> Result<Option<Bytes>, StoreError> {
            Err(down())
        }
        async fn set(&self, _: &str, _: Bytes, _: Option<Duration>) -> Result<bool, StoreError> {
            Err(down())
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(down())
        }
        async fn scan_delete(&self, _: &str) -> Result<u64, StoreError> {
            Err(down())
        }
        async fn exists(&self, _: &str) -> Result<bool, StoreError> {
            Err(down())
        }
        async fn ttl_remaining(&self, _: &str) -> Result<Option<Duration>, StoreError> {
            Err(down())
        }
        async fn increment(&self, _: &str, _: i64) -> Result<i64, StoreError> {
            Err(down())
        }
        async fn set_add(&self, _: &str, _: &[String]) -> Result<u64, StoreError> {
            Err(down())
        }
        async fn set_remove(&self, _: &str, _: &[String]) -> Result<u64, StoreError> {
            Err(down())
        }
        async fn set_members(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(down())
        }
        async fn set_contains(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Err(down())
        }
        async fn info(&self) -> Result<StoreInfo, StoreError> {
            Err(down())
        }
    }

    /// A store that never answers.
    pub(crate) struct HangingStore;

    async fn hang<T>() -> Result<T, StoreError> {
        std::future::pending().await
    }

    #[async_trait]
    impl CacheStore for HangingStore {
        async fn get(&self, _: &str) -> Result<Option<Bytes>, StoreError> {
            hang().await
        }
        async fn set(&self, _: &str, _: Bytes, _: Option<Duration>) -> Result<bool, StoreError> {
            hang().await
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            hang().await
        }
        async fn scan_delete(&self, _: &str) -> Result<u64, StoreError> {
            hang().await
        }
        async fn exists(&self, _: &str) -> Result<bool, StoreError> {
            hang().await
        }
        async fn ttl_remaining(&self, _: &str) -> Result<Option<Duration>, StoreError> {
            hang().await
        }
        async fn increment(&self, _: &str, _: i64) -> Result<i64, StoreError> {
            hang().await
        }
        async fn set_add(&self, _: &str, _: &[String]) -> Result<u64, StoreError> {
            hang().await
        }
        async fn set_remove(&self, _: &str, _: &[String]) -> Result<u64, StoreError> {
            hang().await
        }
        async fn set_members(&self, _: &str) -> Result<Vec<String>, StoreError> {
            hang().await
        }
        async fn set_contains(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            hang().await
        }
        async fn info(&self) -> Result<StoreInfo, StoreError> {
            hang().await
        }
    }
}
