//! Engine configuration.
//!
//! Populated from the `cache`, `ttl`, `warming` and `stats` sections of the
//! service settings. Values are validated once before the engine is built.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use super::query::QueryCacheSettings;
use super::stats::StatsThresholds;
use super::ttl::{MAX_JITTER_PERCENT, TtlError, TtlPolicyManager};
use super::warming::RetryPolicy;

const DEFAULT_STORE_CAPACITY: usize = 10_000;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;
const DEFAULT_COMPUTE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PURGE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_JITTER_PERCENT: u8 = 10;
const DEFAULT_MAX_RESULT_SIZE: usize = 1_000;
const DEFAULT_QUERY_NAMESPACE: &str = "query";
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 10_000;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 5_000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_INTER_BATCH_DELAY_MS: u64 = 100;
const DEFAULT_WARM_MAX_RETRIES: u32 = 2;
const DEFAULT_WARM_RETRY_DELAY_MS: u64 = 5_000;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;
const DEFAULT_STATS_HISTORY_LIMIT: usize = 1_440;
const DEFAULT_LATENCY_WINDOW: usize = 1_024;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid cache configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error(transparent)]
    Ttl(#[from] TtlError),
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries held by the in-process store before LRU eviction.
    pub store_capacity: usize,
    pub store_timeout_ms: u64,
    pub compute_timeout_ms: u64,
    pub purge_timeout_ms: u64,
    /// Applied to every stored TTL, at most 50.
    pub jitter_percent: u8,
    pub max_result_size: usize,
    pub cache_null_results: bool,
    pub query_namespace: String,
    /// Per-category base TTL overrides in seconds.
    pub ttl: BTreeMap<String, i64>,

    pub invalidation_enabled: bool,
    pub event_queue_limit: usize,
    pub auto_consume_interval_ms: u64,
    pub consume_batch_limit: usize,

    pub warming_enabled: bool,
    pub inter_batch_delay_ms: u64,
    pub warm_max_retries: u32,
    pub warm_retry_delay_ms: u64,

    pub stats_interval_secs: u64,
    pub stats_history_limit: usize,
    pub latency_window: usize,
    pub min_hit_rate: f64,
    pub max_memory_bytes: u64,
    pub max_evictions: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let thresholds = StatsThresholds::default();
        Self {
            store_capacity: DEFAULT_STORE_CAPACITY,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            compute_timeout_ms: DEFAULT_COMPUTE_TIMEOUT_MS,
            purge_timeout_ms: DEFAULT_PURGE_TIMEOUT_MS,
            jitter_percent: DEFAULT_JITTER_PERCENT,
            max_result_size: DEFAULT_MAX_RESULT_SIZE,
            cache_null_results: false,
            query_namespace: DEFAULT_QUERY_NAMESPACE.to_string(),
            ttl: BTreeMap::new(),
            invalidation_enabled: true,
            event_queue_limit: DEFAULT_EVENT_QUEUE_LIMIT,
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            warming_enabled: true,
            inter_batch_delay_ms: DEFAULT_INTER_BATCH_DELAY_MS,
            warm_max_retries: DEFAULT_WARM_MAX_RETRIES,
            warm_retry_delay_ms: DEFAULT_WARM_RETRY_DELAY_MS,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            stats_history_limit: DEFAULT_STATS_HISTORY_LIMIT,
            latency_window: DEFAULT_LATENCY_WINDOW,
            min_hit_rate: thresholds.min_hit_rate,
            max_memory_bytes: thresholds.max_memory_bytes,
            max_evictions: thresholds.max_evictions,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jitter_percent > MAX_JITTER_PERCENT {
            return Err(ConfigError::invalid(
                "cache.jitter_percent",
                format!("must be at most {MAX_JITTER_PERCENT}, got {}", self.jitter_percent),
            ));
        }
        let non_zero = [
            ("cache.store_timeout_ms", self.store_timeout_ms),
            ("cache.compute_timeout_ms", self.compute_timeout_ms),
            ("cache.purge_timeout_ms", self.purge_timeout_ms),
            ("cache.auto_consume_interval_ms", self.auto_consume_interval_ms),
            ("stats.interval_secs", self.stats_interval_secs),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        let non_zero_sizes = [
            ("cache.store_capacity", self.store_capacity),
            ("cache.event_queue_limit", self.event_queue_limit),
            ("cache.consume_batch_limit", self.consume_batch_limit),
            ("stats.history_limit", self.stats_history_limit),
            ("stats.latency_window", self.latency_window),
        ];
        for (key, value) in non_zero_sizes {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        if self.query_namespace.trim().is_empty() || self.query_namespace.contains(':') {
            return Err(ConfigError::invalid(
                "cache.query_namespace",
                "must be non-empty and must not contain `:`",
            ));
        }
        if !(0.0..=100.0).contains(&self.min_hit_rate) {
            return Err(ConfigError::invalid(
                "stats.min_hit_rate",
                "must be a percentage between 0 and 100",
            ));
        }
        self.ttl_manager()?;
        Ok(())
    }

    /// Built-in TTL table with the configured overrides applied.
    pub fn ttl_manager(&self) -> Result<TtlPolicyManager, ConfigError> {
        Ok(TtlPolicyManager::with_overrides(
            self.ttl.iter().map(|(name, secs)| (name.as_str(), *secs)),
        )?)
    }

    pub fn store_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.store_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn purge_timeout(&self) -> Duration {
        Duration::from_millis(self.purge_timeout_ms)
    }

    pub fn auto_consume_interval(&self) -> Duration {
        Duration::from_millis(self.auto_consume_interval_ms)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn query_settings(&self) -> QueryCacheSettings {
        QueryCacheSettings {
            namespace: self.query_namespace.clone(),
            max_result_size: self.max_result_size,
            cache_empty_results: self.cache_null_results,
            compute_timeout: Duration::from_millis(self.compute_timeout_ms),
            jitter_percent: self.jitter_percent,
        }
    }

    /// Retry policy for warming tasks that do not set their own.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_on_failure: self.warm_max_retries > 0,
            max_retries: self.warm_max_retries,
            retry_delay: Duration::from_millis(self.warm_retry_delay_ms),
        }
    }

    pub fn thresholds(&self) -> StatsThresholds {
        StatsThresholds {
            min_hit_rate: self.min_hit_rate,
            max_memory_bytes: self.max_memory_bytes,
            max_evictions: self.max_evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::category::CacheCategory;

    #[test]
    fn defaults_are_valid() {
        let config = CacheConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.jitter_percent, 10);
        assert_eq!(config.max_result_size, 1000);
        assert!(!config.cache_null_results);
        assert_eq!(config.store_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn jitter_above_fifty_is_rejected() {
        let config = CacheConfig {
            jitter_percent: 51,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "cache.jitter_percent", .. })
        ));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let config = CacheConfig {
            stats_interval_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "stats.interval_secs", .. })
        ));
    }

    #[test]
    fn ttl_overrides_flow_into_the_manager() {
        let mut config = CacheConfig::default();
        config.ttl.insert("translation".to_string(), 43_200);
        let manager = config.ttl_manager().expect("valid overrides");
        assert_eq!(manager.ttl(&CacheCategory::Translation), 43_200);
    }

    #[test]
    fn negative_or_unknown_ttl_overrides_fail() {
        let mut config = CacheConfig::default();
        config.ttl.insert("session".to_string(), -1);
        assert!(matches!(config.validate(), Err(ConfigError::Ttl(TtlError::Negative { .. }))));

        let mut config = CacheConfig::default();
        config.ttl.insert("bogus".to_string(), 10);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Ttl(TtlError::UnknownCategory(_)))
        ));
    }

    #[test]
    fn zero_retries_disable_retrying() {
        let config = CacheConfig {
            warm_max_retries: 0,
            ..Default::default()
        };
        assert!(!config.retry_policy().retry_on_failure);
    }

    #[test]
    fn capacity_clamps_to_one() {
        let config = CacheConfig {
            store_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.store_capacity_non_zero().get(), 1);
    }
}
