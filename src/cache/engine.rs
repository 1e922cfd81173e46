//! The engine object: every cache component built once and wired together.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use super::adapter::StoreAdapter;
use super::config::{CacheConfig, ConfigError};
use super::database::{DatabaseCacheLayer, PrefixRule, default_prefix_rules};
use super::edge::{CdnPurger, EdgeCachePolicy, NoopPurger};
use super::events::EventQueue;
use super::invalidation::{EventContext, InvalidationEngine, InvalidationReport};
use super::query::QueryCache;
use super::rules::{InvalidationRule, RuleError, RuleRegistry};
use super::stale::{DEFAULT_STALE_SET, StaleMarkers};
use super::stats::{CacheStatSnapshot, LatencyWindow, Recommendation, StatsAggregator};
use super::store::{CacheStore, MemoryStore};
use super::tasks::BackgroundTasks;
use super::trigger::CacheTrigger;
use super::ttl::TtlPolicyManager;
use super::warming::{NoUsagePatterns, UsagePatterns, WarmError, WarmPass, Warmer, WarmingScheduler, WarmingTask};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Rule(#[from] RuleError),
}

pub struct CacheEngineBuilder {
    config: CacheConfig,
    store: Option<Arc<dyn CacheStore>>,
    purger: Option<Arc<dyn CdnPurger>>,
    usage: Option<Arc<dyn UsagePatterns>>,
    rules: Vec<InvalidationRule>,
    builtin_rules: bool,
    prefix_rules: Option<Vec<PrefixRule>>,
}

impl CacheEngineBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: None,
            purger: None,
            usage: None,
            rules: Vec::new(),
            builtin_rules: true,
            prefix_rules: None,
        }
    }

    /// Defaults to an in-process [`MemoryStore`] sized by the config.
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to [`NoopPurger`].
    pub fn purger(mut self, purger: Arc<dyn CdnPurger>) -> Self {
        self.purger = Some(purger);
        self
    }

    pub fn usage_patterns(mut self, usage: Arc<dyn UsagePatterns>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Registered after the built-in rules, so they may cascade into them.
    pub fn rule(mut self, rule: InvalidationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn without_builtin_rules(mut self) -> Self {
        self.builtin_rules = false;
        self
    }

    pub fn prefix_rules(mut self, rules: Vec<PrefixRule>) -> Self {
        self.prefix_rules = Some(rules);
        self
    }

    /// Validate configuration and rules, then wire the components.
    ///
    /// Nothing is spawned until [`CacheEngine::start`].
    pub fn build(self) -> Result<CacheEngine, EngineError> {
        let config = self.config;
        config.validate()?;

        let mut registry = if self.builtin_rules {
            RuleRegistry::with_builtin_rules()?
        } else {
            RuleRegistry::new()
        };
        registry.register_all(self.rules)?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(config.store_capacity_non_zero())));
        let adapter = Arc::new(StoreAdapter::new(store, config.store_timeout()));
        let ttl = Arc::new(config.ttl_manager()?);
        let stale = StaleMarkers::new(adapter.clone(), DEFAULT_STALE_SET);
        let tasks = Arc::new(BackgroundTasks::new());
        let latencies = Arc::new(LatencyWindow::new(config.latency_window));

        let edge = Arc::new(EdgeCachePolicy::new(
            ttl.clone(),
            self.purger.unwrap_or_else(|| Arc::new(NoopPurger)),
            tasks.clone(),
            config.purge_timeout(),
        ));
        let invalidation = Arc::new(InvalidationEngine::new(
            registry,
            adapter.clone(),
            stale.clone(),
            edge.clone(),
            tasks.clone(),
        ));
        let trigger = Arc::new(CacheTrigger::new(
            config.invalidation_enabled,
            Arc::new(EventQueue::new(config.event_queue_limit)),
            invalidation.clone(),
            config.consume_batch_limit,
        ));
        let warming = Arc::new(WarmingScheduler::new(
            config.warming_enabled,
            config.inter_batch_delay(),
            self.usage.unwrap_or_else(|| Arc::new(NoUsagePatterns)),
        ));
        let query = Arc::new(QueryCache::new(
            adapter.clone(),
            ttl.clone(),
            stale.clone(),
            latencies.clone(),
            config.query_settings(),
        ));
        let database = Arc::new(DatabaseCacheLayer::new(
            adapter.clone(),
            ttl.clone(),
            stale.clone(),
            latencies.clone(),
            config.query_settings(),
            self.prefix_rules.unwrap_or_else(default_prefix_rules),
        ));
        let stats = Arc::new(
            StatsAggregator::new(
                adapter.clone(),
                latencies,
                config.thresholds(),
                config.stats_history_limit,
            )
            .with_source(query.clone())
            .with_source(database.clone())
            .with_source(invalidation.clone())
            .with_source(warming.clone())
            .with_source(adapter.clone()),
        );

        Ok(CacheEngine {
            config,
            adapter,
            ttl,
            stale,
            invalidation,
            trigger,
            warming,
            query,
            database,
            edge,
            stats,
            tasks,
            started: AtomicBool::new(false),
        })
    }
}

pub struct CacheEngine {
    config: CacheConfig,
    adapter: Arc<StoreAdapter>,
    ttl: Arc<TtlPolicyManager>,
    stale: StaleMarkers,
    invalidation: Arc<InvalidationEngine>,
    trigger: Arc<CacheTrigger>,
    warming: Arc<WarmingScheduler>,
    query: Arc<QueryCache>,
    database: Arc<DatabaseCacheLayer>,
    edge: Arc<EdgeCachePolicy>,
    stats: Arc<StatsAggregator>,
    tasks: Arc<BackgroundTasks>,
    started: AtomicBool,
}

impl CacheEngine {
    pub fn builder(config: CacheConfig) -> CacheEngineBuilder {
        CacheEngineBuilder::new(config)
    }

    /// Spawn the background loops: statistics collection, scheduled warming
    /// and event auto-consumption. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stats
            .spawn_collector(&self.tasks, self.config.stats_interval());
        let scheduled = self.warming.spawn_schedules(&self.tasks);
        if self.config.invalidation_enabled {
            self.trigger
                .spawn_auto_consume(&self.tasks, self.config.auto_consume_interval());
        }
        info!(
            scheduled_warming_tasks = scheduled,
            rules = self.invalidation.rules().len(),
            "Cache engine started"
        );
    }

    /// Must be called before [`CacheEngine::start`] for a scheduled task to
    /// get its loop.
    pub fn register_warming_task(&self, task: WarmingTask, warmer: Arc<dyn Warmer>) -> Result<(), WarmError> {
        if self.started.load(Ordering::SeqCst) && task.schedule.is_some() {
            warn!(task = %task.name, "Warming task registered after start; its schedule will not run");
        }
        self.warming.register_task(task, warmer)
    }

    /// Run every enabled startup task in priority order.
    pub async fn warm_on_startup(&self) -> WarmPass {
        self.warming.warm(None).await
    }

    pub async fn trigger_invalidation(&self, event: &str, context: &EventContext) -> InvalidationReport {
        self.invalidation.trigger_invalidation(event, context).await
    }

    /// Latest snapshot, collecting one first when history is empty.
    pub async fn snapshot(&self) -> Option<CacheStatSnapshot> {
        match self.stats.latest() {
            Some(snapshot) => Some(snapshot),
            None => self.stats.collect().await,
        }
    }

    pub async fn recommendations(&self) -> Vec<Recommendation> {
        match self.snapshot().await {
            Some(snapshot) => self.stats.recommendations(&snapshot),
            None => Vec::new(),
        }
    }

    /// Stop every background task, aborting what is still running after `grace`.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let flushed = self.trigger.queue().len();
        let aborted = self.tasks.shutdown(grace).await;
        info!(aborted, queued_events = flushed, "Cache engine stopped");
        aborted
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<StoreAdapter> {
        &self.adapter
    }

    pub fn ttl(&self) -> &Arc<TtlPolicyManager> {
        &self.ttl
    }

    pub fn stale_markers(&self) -> &StaleMarkers {
        &self.stale
    }

    pub fn invalidation(&self) -> &Arc<InvalidationEngine> {
        &self.invalidation
    }

    pub fn trigger(&self) -> &Arc<CacheTrigger> {
        &self.trigger
    }

    pub fn warming(&self) -> &Arc<WarmingScheduler> {
        &self.warming
    }

    pub fn query(&self) -> &Arc<QueryCache> {
        &self.query
    }

    pub fn database(&self) -> &Arc<DatabaseCacheLayer> {
        &self.database
    }

    pub fn edge(&self) -> &Arc<EdgeCachePolicy> {
        &self.edge
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn tasks(&self) -> &Arc<BackgroundTasks> {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::cache::rules::InvalidationStrategy;
    use crate::cache::warming::{WarmStrategy, warm_fn};

    fn engine() -> CacheEngine {
        CacheEngine::builder(CacheConfig::default())
            .build()
            .expect("default engine")
    }

    #[tokio::test]
    async fn builtin_rules_are_wired() {
        let engine = engine();
        engine
            .adapter()
            .set("patient:42", Bytes::from_static(b"p"), None)
            .await;

        let context = EventContext::from([("patient_id".to_string(), "42".to_string())]);
        let report = engine.trigger_invalidation("patient_update", &context).await;

        assert_eq!(report.rules_applied, ["patient_update", "patient_records_update"]);
        assert!(!engine.adapter().exists("patient:42").await);
    }

    #[test]
    fn invalid_config_fails_fast() {
        let config = CacheConfig {
            jitter_percent: 80,
            ..Default::default()
        };
        assert!(matches!(
            CacheEngine::builder(config).build(),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn custom_rules_are_validated() {
        let result = CacheEngine::builder(CacheConfig::default())
            .rule(InvalidationRule::new("loop", "evt", InvalidationStrategy::Cascade).cascade(["loop"]))
            .build();
        assert!(matches!(result, Err(EngineError::Rule(RuleError::Cycle(_)))));
    }

    #[tokio::test]
    async fn snapshot_collects_on_demand() {
        let engine = engine();
        let snapshot = engine.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.hit_rate + snapshot.miss_rate, 100.0);
        assert_eq!(snapshot.tiers.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_shutdown_stops_loops() {
        let engine = engine();
        engine
            .register_warming_task(
                WarmingTask::new("hourly", 1, WarmStrategy::Eager)
                    .schedule("0 0 * * * *")
                    .expect("cron"),
                warm_fn(|_| async { Ok(1) }),
            )
            .expect("registered");

        engine.start();
        let running = engine.tasks().active();
        engine.start();
        assert_eq!(engine.tasks().active(), running);
        assert_eq!(running, 3);

        engine.shutdown(Duration::from_secs(1)).await;
        assert_eq!(engine.tasks().active(), 0);
    }

    #[tokio::test]
    async fn startup_warming_runs_registered_tasks() {
        let engine = engine();
        engine
            .register_warming_task(
                WarmingTask::new("translations", 1, WarmStrategy::Eager),
                warm_fn(|_| async { Ok(7) }),
            )
            .expect("registered");

        let pass = engine.warm_on_startup().await;
        assert_eq!(pass.results().len(), 1);
        assert_eq!(pass.results()[0].items_warmed, 7);
    }
}
