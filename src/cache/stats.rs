//! Cache statistics: per-tier counters, latency percentiles, snapshot
//! history and tuning recommendations.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error, info};

use super::adapter::StoreAdapter;
use super::database::DatabaseCacheLayer;
use super::invalidation::InvalidationEngine;
use super::lock::mutex_lock;
use super::query::QueryCache;
use super::tasks::BackgroundTasks;
use super::warming::WarmingScheduler;

const SOURCE: &str = "cache::stats";

/// Allowed drift of `hit_rate + miss_rate` from 100.
const RATE_TOLERANCE: f64 = 0.01;

// ============================================================================
// Latency window
// ============================================================================

/// Bounded window of recent lookup latencies.
pub struct LatencyWindow {
    samples: Mutex<VecDeque<f64>>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let mut samples = mutex_lock(&self.samples, SOURCE, "latency_record");
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn percentiles(&self) -> LatencyPercentiles {
        let mut sorted: Vec<f64> = mutex_lock(&self.samples, SOURCE, "latency_percentiles")
            .iter()
            .copied()
            .collect();
        if sorted.is_empty() {
            return LatencyPercentiles::default();
        }
        sorted.sort_by(f64::total_cmp);
        LatencyPercentiles {
            p50_ms: nearest_rank(&sorted, 50.0),
            p95_ms: nearest_rank(&sorted, 95.0),
            p99_ms: nearest_rank(&sorted, 99.0),
            samples: sorted.len(),
        }
    }
}

fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub samples: usize,
}

// ============================================================================
// Sources
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub errors: u64,
}

impl std::ops::AddAssign for TierCounters {
    fn add_assign(&mut self, other: Self) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.evictions += other.evictions;
        self.invalidations += other.invalidations;
        self.errors += other.errors;
    }
}

/// Anything that reports counters into a snapshot.
#[async_trait]
pub trait StatsSource: Send + Sync {
    fn tier(&self) -> &'static str;
    async fn counters(&self) -> TierCounters;
}

#[async_trait]
impl StatsSource for QueryCache {
    fn tier(&self) -> &'static str {
        "query"
    }

    async fn counters(&self) -> TierCounters {
        let stats = self.stats();
        TierCounters {
            hits: stats.hits,
            misses: stats.misses,
            ..Default::default()
        }
    }
}

#[async_trait]
impl StatsSource for DatabaseCacheLayer {
    fn tier(&self) -> &'static str {
        "database"
    }

    async fn counters(&self) -> TierCounters {
        let stats = self.query_stats();
        TierCounters {
            hits: stats.hits,
            misses: stats.misses,
            ..Default::default()
        }
    }
}

#[async_trait]
impl StatsSource for InvalidationEngine {
    fn tier(&self) -> &'static str {
        "invalidation"
    }

    async fn counters(&self) -> TierCounters {
        let stats = self.stats();
        TierCounters {
            invalidations: stats.keys_deleted + stats.keys_marked_stale,
            ..Default::default()
        }
    }
}

#[async_trait]
impl StatsSource for WarmingScheduler {
    fn tier(&self) -> &'static str {
        "warming"
    }

    async fn counters(&self) -> TierCounters {
        TierCounters {
            errors: self.stats().tasks_failed,
            ..Default::default()
        }
    }
}

#[async_trait]
impl StatsSource for StoreAdapter {
    fn tier(&self) -> &'static str {
        "store"
    }

    async fn counters(&self) -> TierCounters {
        TierCounters {
            evictions: self.info().await.evictions,
            errors: self.counters().errors,
            ..Default::default()
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub taken_at: OffsetDateTime,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub latency: LatencyPercentiles,
    pub memory_bytes: u64,
    pub keys: u64,
    pub tiers: BTreeMap<String, TierCounters>,
}

impl CacheStatSnapshot {
    fn is_consistent(&self) -> bool {
        let sum = self.hit_rate + self.miss_rate;
        self.hit_rate.is_finite() && self.miss_rate.is_finite() && (sum - 100.0).abs() <= RATE_TOLERANCE
    }
}

/// `(hit_rate, miss_rate)` in percent. No traffic reads as all misses.
pub fn rates(hits: u64, misses: u64) -> (f64, f64) {
    let total = hits + misses;
    if total == 0 {
        return (0.0, 100.0);
    }
    let hit_rate = hits as f64 / total as f64 * 100.0;
    let miss_rate = misses as f64 / total as f64 * 100.0;
    (hit_rate, miss_rate)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    LowHitRate,
    HighMemory,
    HighEvictions,
    WarmingFailures,
    StoreErrors,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.severity, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsThresholds {
    /// Percent below which the hit rate is flagged.
    pub min_hit_rate: f64,
    pub max_memory_bytes: u64,
    /// Evictions since start above which capacity is flagged.
    pub max_evictions: u64,
}

impl Default for StatsThresholds {
    fn default() -> Self {
        Self {
            min_hit_rate: 80.0,
            max_memory_bytes: 512 * 1024 * 1024,
            max_evictions: 1000,
        }
    }
}

pub struct StatsAggregator {
    sources: Vec<Arc<dyn StatsSource>>,
    adapter: Arc<StoreAdapter>,
    latencies: Arc<LatencyWindow>,
    thresholds: StatsThresholds,
    history: Mutex<VecDeque<CacheStatSnapshot>>,
    history_limit: usize,
}

impl StatsAggregator {
    pub fn new(
        adapter: Arc<StoreAdapter>,
        latencies: Arc<LatencyWindow>,
        thresholds: StatsThresholds,
        history_limit: usize,
    ) -> Self {
        Self {
            sources: Vec::new(),
            adapter,
            latencies,
            thresholds,
            history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn StatsSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Take a snapshot and append it to history.
    ///
    /// Returns `None` and keeps history unchanged when the rates fail the
    /// consistency check.
    pub async fn collect(&self) -> Option<CacheStatSnapshot> {
        let mut tiers = BTreeMap::new();
        let mut totals = TierCounters::default();
        for source in &self.sources {
            let counters = source.counters().await;
            totals += counters;
            tiers.insert(source.tier().to_string(), counters);
        }
        let info = self.adapter.info().await;
        let (hit_rate, miss_rate) = rates(totals.hits, totals.misses);

        let snapshot = CacheStatSnapshot {
            taken_at: OffsetDateTime::now_utc(),
            hits: totals.hits,
            misses: totals.misses,
            evictions: totals.evictions,
            invalidations: totals.invalidations,
            errors: totals.errors,
            hit_rate,
            miss_rate,
            latency: self.latencies.percentiles(),
            memory_bytes: info.memory_bytes,
            keys: info.keys,
            tiers,
        };
        self.accept(snapshot)
    }

    fn accept(&self, snapshot: CacheStatSnapshot) -> Option<CacheStatSnapshot> {
        if !snapshot.is_consistent() {
            error!(
                hit_rate = snapshot.hit_rate,
                miss_rate = snapshot.miss_rate,
                "Inconsistent cache statistics snapshot discarded"
            );
            return None;
        }

        let mut history = mutex_lock(&self.history, SOURCE, "collect");
        if history.len() == self.history_limit {
            history.pop_front();
        }
        history.push_back(snapshot.clone());
        debug!(
            hits = snapshot.hits,
            misses = snapshot.misses,
            hit_rate = snapshot.hit_rate,
            "Cache statistics collected"
        );
        Some(snapshot)
    }

    pub fn latest(&self) -> Option<CacheStatSnapshot> {
        mutex_lock(&self.history, SOURCE, "latest").back().cloned()
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<CacheStatSnapshot> {
        mutex_lock(&self.history, SOURCE, "history")
            .iter()
            .cloned()
            .collect()
    }

    pub fn recommendations(&self, snapshot: &CacheStatSnapshot) -> Vec<Recommendation> {
        let mut out = Vec::new();
        let traffic = snapshot.hits + snapshot.misses;

        if traffic > 0 && snapshot.hit_rate < self.thresholds.min_hit_rate {
            out.push(Recommendation {
                kind: RecommendationKind::LowHitRate,
                severity: if snapshot.hit_rate < self.thresholds.min_hit_rate / 2.0 {
                    Severity::Critical
                } else {
                    Severity::Warning
                },
                message: format!(
                    "Hit rate {:.1}% is below the {:.0}% target; review TTLs and extend warming to hot queries",
                    snapshot.hit_rate, self.thresholds.min_hit_rate
                ),
            });
        }
        if snapshot.memory_bytes > self.thresholds.max_memory_bytes {
            out.push(Recommendation {
                kind: RecommendationKind::HighMemory,
                severity: Severity::Warning,
                message: format!(
                    "Store holds {} bytes, above the {} byte ceiling; shorten TTLs or lower max result size",
                    snapshot.memory_bytes, self.thresholds.max_memory_bytes
                ),
            });
        }
        if snapshot.evictions > self.thresholds.max_evictions {
            out.push(Recommendation {
                kind: RecommendationKind::HighEvictions,
                severity: Severity::Warning,
                message: format!(
                    "{} evictions so far; the store is undersized for the working set",
                    snapshot.evictions
                ),
            });
        }
        if let Some(warming) = snapshot.tiers.get("warming")
            && warming.errors > 0
        {
            out.push(Recommendation {
                kind: RecommendationKind::WarmingFailures,
                severity: Severity::Warning,
                message: format!("{} warming task runs failed; check warmer dependencies", warming.errors),
            });
        }
        if let Some(store) = snapshot.tiers.get("store")
            && store.errors > 0
        {
            out.push(Recommendation {
                kind: RecommendationKind::StoreErrors,
                severity: Severity::Critical,
                message: format!("{} store operations failed or timed out; the cache is degrading to misses", store.errors),
            });
        }
        out
    }

    /// Collect every `interval` until shutdown.
    pub fn spawn_collector(self: &Arc<Self>, tasks: &BackgroundTasks, interval: Duration) {
        let aggregator = Arc::clone(self);
        tasks.spawn("stats_collector", move |mut signal| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = signal.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(snapshot) = aggregator.collect().await {
                            for recommendation in aggregator.recommendations(&snapshot) {
                                info!(
                                    kind = ?recommendation.kind,
                                    severity = ?recommendation.severity,
                                    "{}",
                                    recommendation.message
                                );
                            }
                        }
                    }
                }
            }
            debug!("Stats collector stopped");
        });
    }
}
