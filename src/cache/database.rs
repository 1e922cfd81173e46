//! Relational query result cache.
//!
//! A thin layer over [`QueryCache`] that derives the key prefix from the SQL
//! text. Keys take the form `db:{prefix}:{table}:{hash}` so a whole table can
//! be dropped with one scan.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use super::adapter::StoreAdapter;
use super::category::CacheCategory;
use super::keys::CacheKey;
use super::query::{ComputeError, LookupStats, QueryCache, QueryCacheSettings};
use super::stale::StaleMarkers;
use super::stats::{LatencyWindow, rates};
use super::ttl::TtlPolicyManager;

pub const DB_NAMESPACE: &str = "db";
pub const DEFAULT_PREFIX: &str = "select";
pub const AGGREGATE_PREFIX: &str = "count";

static TABLE_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"\bfrom\s+["`]?([a-z_][a-z0-9_]*(?:\.[a-z_][a-z0-9_]*)?)"#)
        .case_insensitive(true)
        .build()
        .expect("table regex must compile")
});

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex must compile"));

#[derive(Debug, Error)]
pub enum DatabaseCacheError {
    #[error("invalid prefix pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("prefix must be a non-empty identifier, got `{0}`")]
    InvalidPrefix(String),
}

/// Maps matching SQL to a key prefix and a TTL category.
#[derive(Debug, Clone)]
pub struct PrefixRule {
    regex: Regex,
    prefix: String,
    category: CacheCategory,
}

impl PrefixRule {
    /// `pattern` is matched case-insensitively anywhere in the SQL.
    pub fn new(pattern: &str, prefix: &str, category: CacheCategory) -> Result<Self, DatabaseCacheError> {
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DatabaseCacheError::InvalidPrefix(prefix.to_string()));
        }
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| DatabaseCacheError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self {
            regex,
            prefix: prefix.to_string(),
            category,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Aggregates are cached under `count`; everything else falls through to `select`.
pub fn default_prefix_rules() -> Vec<PrefixRule> {
    let aggregate = PrefixRule::new(
        r"^\s*select\s+(count|sum|avg|min|max)\s*\(",
        AGGREGATE_PREFIX,
        CacheCategory::Aggregate,
    );
    aggregate.into_iter().collect()
}

#[derive(Debug, Default)]
struct PrefixCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PrefixStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

pub struct DatabaseCacheLayer {
    cache: QueryCache,
    adapter: Arc<StoreAdapter>,
    rules: Vec<PrefixRule>,
    prefixes: DashMap<String, PrefixCounters>,
}

impl DatabaseCacheLayer {
    /// The namespace in `settings` is replaced with [`DB_NAMESPACE`].
    pub fn new(
        adapter: Arc<StoreAdapter>,
        ttl: Arc<TtlPolicyManager>,
        stale: StaleMarkers,
        latencies: Arc<LatencyWindow>,
        mut settings: QueryCacheSettings,
        rules: Vec<PrefixRule>,
    ) -> Self {
        settings.namespace = DB_NAMESPACE.to_string();
        Self {
            cache: QueryCache::new(adapter.clone(), ttl, stale, latencies, settings),
            adapter,
            rules,
            prefixes: DashMap::new(),
        }
    }

    /// First matching rule wins.
    fn classify(&self, sql: &str) -> (&str, CacheCategory) {
        self.rules
            .iter()
            .find(|rule| rule.regex.is_match(sql))
            .map(|rule| (rule.prefix.as_str(), rule.category.clone()))
            .unwrap_or((DEFAULT_PREFIX, CacheCategory::Record))
    }

    pub fn key_prefix(&self, sql: &str) -> &str {
        self.classify(sql).0
    }

    pub fn build_key(&self, sql: &str, params: &Value) -> CacheKey {
        let (prefix, _) = self.classify(sql);
        let query_name = format!("{prefix}:{}", table_of(sql));
        let normalized = normalize_sql(sql);
        self.cache
            .build_key(&query_name, &json!({ "sql": normalized, "params": params }), None)
    }

    pub async fn get_cached<T: DeserializeOwned>(&self, sql: &str, params: &Value) -> Option<T> {
        let (prefix, _) = self.classify(sql);
        let key = self.build_key(sql, params);
        let value = self.cache.get_cached(prefix, &key).await;
        self.record(prefix, value.is_some());
        value
    }

    pub async fn cache_result<T: Serialize>(&self, sql: &str, params: &Value, value: &T) -> bool {
        let (prefix, category) = self.classify(sql);
        let key = self.build_key(sql, params);
        self.cache.cache_result(prefix, &key, value, &category).await
    }

    /// Cached rows for `sql`, or run `execute` and store its result.
    pub async fn fetch<T, E, F, Fut>(&self, sql: &str, params: &Value, execute: F) -> Result<T, ComputeError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: std::error::Error + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get_cached(sql, params).await {
            return Ok(value);
        }
        let (prefix, category) = self.classify(sql);
        let key = self.build_key(sql, params);
        let limit = self.cache.settings().compute_timeout;
        let value = match tokio::time::timeout(limit, execute()).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => return Err(ComputeError::Failed(err)),
            Err(_) => return Err(ComputeError::Timeout(limit)),
        };
        self.cache.cache_result(prefix, &key, &value, &category).await;
        Ok(value)
    }

    /// Drop every cached result that reads from `table`.
    pub async fn invalidate_table(&self, table: &str) -> u64 {
        let pattern = format!("{DB_NAMESPACE}:*:{}:*", table.to_ascii_lowercase());
        let deleted = self.adapter.scan_delete(&pattern).await;
        info!(table, deleted, "Database cache table invalidated");
        deleted
    }

    fn record(&self, prefix: &str, hit: bool) {
        let counters = self.prefixes.entry(prefix.to_string()).or_default();
        if hit {
            counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        debug!(prefix, hit, "Database cache lookup");
    }

    pub fn prefix_stats(&self) -> BTreeMap<String, PrefixStats> {
        self.prefixes
            .iter()
            .map(|entry| {
                let hits = entry.hits.load(Ordering::Relaxed);
                let misses = entry.misses.load(Ordering::Relaxed);
                let (hit_rate, _) = rates(hits, misses);
                (entry.key().clone(), PrefixStats { hits, misses, hit_rate })
            })
            .collect()
    }

    pub fn query_stats(&self) -> LookupStats {
        self.cache.stats()
    }
}

/// Lowercased first `FROM` target, or `_` when there is none.
pub fn table_of(sql: &str) -> String {
    TABLE_RE
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_else(|| "_".to_string())
}

fn normalize_sql(sql: &str) -> String {
    WHITESPACE_RE.replace_all(sql.trim(), " ").into_owned()
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::cache::stale::DEFAULT_STALE_SET;
    use crate::cache::store::MemoryStore;

    fn layer() -> (DatabaseCacheLayer, Arc<StoreAdapter>) {
        let store = MemoryStore::new(NonZeroUsize::new(128).expect("non-zero"));
        let adapter = Arc::new(StoreAdapter::new(Arc::new(store), Duration::from_millis(200)));
        let layer = DatabaseCacheLayer::new(
            adapter.clone(),
            Arc::new(TtlPolicyManager::default()),
            StaleMarkers::new(adapter.clone(), DEFAULT_STALE_SET),
            Arc::new(LatencyWindow::new(16)),
            QueryCacheSettings::default(),
            default_prefix_rules(),
        );
        (layer, adapter)
    }

    #[test]
    fn aggregates_use_the_count_prefix() {
        let (layer, _) = layer();
        assert_eq!(layer.key_prefix("SELECT COUNT(*) FROM patients"), "count");
        assert_eq!(layer.key_prefix("  select avg(age) from patients"), "count");
        assert_eq!(layer.key_prefix("SELECT id FROM patients WHERE id = $1"), "select");
    }

    #[test]
    fn keys_carry_prefix_and_table() {
        let (layer, _) = layer();
        let key = layer.build_key("SELECT * FROM Health_Records WHERE patient_id = $1", &json!([42]));
        assert!(key.as_str().starts_with("db:select:health_records:"), "{key}");

        let no_table = layer.build_key("SELECT 1", &Value::Null);
        assert!(no_table.as_str().starts_with("db:select:_:"), "{no_table}");
    }

    #[test]
    fn whitespace_does_not_change_the_key() {
        let (layer, _) = layer();
        let a = layer.build_key("SELECT id\n  FROM patients", &json!({"a": 1}));
        let b = layer.build_key("SELECT id FROM patients", &json!({"a": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn first_matching_rule_wins() {
        let store = MemoryStore::new(NonZeroUsize::new(8).expect("non-zero"));
        let adapter = Arc::new(StoreAdapter::new(Arc::new(store), Duration::from_millis(200)));
        let mut rules = vec![PrefixRule::new(r"\bjoin\b", "join", CacheCategory::Record).expect("rule")];
        rules.extend(default_prefix_rules());
        let layer = DatabaseCacheLayer::new(
            adapter.clone(),
            Arc::new(TtlPolicyManager::default()),
            StaleMarkers::new(adapter, DEFAULT_STALE_SET),
            Arc::new(LatencyWindow::new(4)),
            QueryCacheSettings::default(),
            rules,
        );
        assert_eq!(layer.key_prefix("SELECT count(*) FROM a JOIN b ON a.id = b.id"), "join");
    }

    #[test]
    fn invalid_rules_are_rejected() {
        assert!(matches!(
            PrefixRule::new("(", "x", CacheCategory::Record),
            Err(DatabaseCacheError::InvalidPattern { .. })
        ));
        assert!(matches!(
            PrefixRule::new("x", "a:b", CacheCategory::Record),
            Err(DatabaseCacheError::InvalidPrefix(_))
        ));
    }

    #[tokio::test]
    async fn per_prefix_counters_track_hits_and_misses() {
        let (layer, _) = layer();
        let sql = "SELECT count(*) FROM patients";
        assert!(layer.get_cached::<u64>(sql, &Value::Null).await.is_none());
        assert!(layer.cache_result(sql, &Value::Null, &12_u64).await);
        assert_eq!(layer.get_cached::<u64>(sql, &Value::Null).await, Some(12));

        let stats = layer.prefix_stats();
        let count = stats.get("count").expect("count prefix");
        assert_eq!((count.hits, count.misses), (1, 1));
        assert_eq!(count.hit_rate, 50.0);
        assert!(!stats.contains_key("select"));
    }

    #[tokio::test]
    async fn invalidate_table_only_drops_that_table() {
        let (layer, adapter) = layer();
        let rows = json!([{"id": 1}]);
        layer
            .cache_result("SELECT * FROM patients", &Value::Null, &rows)
            .await;
        layer
            .cache_result("SELECT count(*) FROM patients", &Value::Null, &3)
            .await;
        layer
            .cache_result("SELECT * FROM translations", &Value::Null, &rows)
            .await;
        adapter.set("query:patients:abc", Bytes::from_static(b"1"), None).await;

        assert_eq!(layer.invalidate_table("Patients").await, 2);
        assert!(
            layer
                .get_cached::<Value>("SELECT * FROM translations", &Value::Null)
                .await
                .is_some()
        );
        assert!(adapter.exists("query:patients:abc").await);
    }

    #[tokio::test]
    async fn empty_result_sets_are_not_stored() {
        let (layer, _) = layer();
        let empty: Vec<Value> = Vec::new();
        assert!(!layer.cache_result("SELECT * FROM patients", &Value::Null, &empty).await);
    }

    #[tokio::test]
    async fn fetch_runs_the_query_once() {
        let (layer, _) = layer();
        let calls = AtomicU64::new(0);
        let counter = &calls;
        for _ in 0..3 {
            let rows: Vec<u32> = layer
                .fetch::<_, std::io::Error, _, _>("SELECT id FROM patients", &Value::Null, move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![1, 2, 3])
                })
                .await
                .expect("rows");
            assert_eq!(rows, vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
