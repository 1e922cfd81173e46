//! Cache consistency and warming engine.
//!
//! - **Store**: [`CacheStore`] behind a [`StoreAdapter`] that bounds every
//!   call with a timeout and degrades failures to misses
//! - **Policy**: per-[`CacheCategory`] TTLs with jitter ([`TtlPolicyManager`])
//!   and edge headers ([`EdgeCachePolicy`])
//! - **Invalidation**: named rules dispatched on business events
//!   ([`InvalidationEngine`], fed by [`CacheTrigger`])
//! - **Warming**: prioritised tasks with retry ([`WarmingScheduler`])
//! - **Reads**: [`QueryCache`] and [`DatabaseCacheLayer`]
//! - **Stats**: rolling snapshots and recommendations ([`StatsAggregator`])
//!
//! [`CacheEngine`] builds and owns all of the above.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! store_timeout_ms = 250
//! jitter_percent = 10
//! max_result_size = 1000
//!
//! [ttl]
//! translation = 43200
//! ```

mod adapter;
mod category;
mod config;
mod database;
mod edge;
mod engine;
mod events;
mod invalidation;
mod keys;
mod lock;
mod pattern;
mod query;
mod rules;
mod stale;
mod stats;
mod store;
mod tasks;
mod trigger;
mod ttl;
mod warming;

pub use adapter::{AdapterCounterSnapshot, StoreAdapter};
pub use category::CacheCategory;
pub use config::{CacheConfig, ConfigError};
pub use database::{
    DatabaseCacheError, DatabaseCacheLayer, PrefixRule, PrefixStats, default_prefix_rules, table_of,
};
pub use edge::{
    CdnPurger, ContentCategory, EdgeCachePolicy, HttpPurger, NoopPurger, PurgeError, PurgeStats, etag,
    etag_matches,
};
pub use engine::{CacheEngine, CacheEngineBuilder, EngineError};
pub use events::{CacheEvent, Epoch, EventQueue};
pub use invalidation::{EventContext, InvalidationEngine, InvalidationReport, InvalidationStats};
pub use keys::{CacheKey, build_key, params_hash};
pub use pattern::{KeyPattern, PatternError, Rendered, has_wildcard, render_template};
pub use query::{CachedQuery, ComputeError, LookupStats, QueryCache, QueryCacheSettings, cached};
pub use rules::{InvalidationRule, InvalidationStrategy, RuleError, RuleRegistry, builtin_rules};
pub use stale::{DEFAULT_STALE_SET, StaleMarkers};
pub use stats::{
    CacheStatSnapshot, LatencyPercentiles, LatencyWindow, Recommendation, RecommendationKind, Severity,
    StatsAggregator, StatsSource, StatsThresholds, TierCounters, rates,
};
pub use store::{CacheStore, MemoryStore, StoreError, StoreInfo};
pub use tasks::{BackgroundTasks, ShutdownSignal};
pub use trigger::CacheTrigger;
pub use ttl::{CacheHeaders, TtlError, TtlPolicy, TtlPolicyManager, Visibility, expires_in, http_date};
pub use warming::{
    NoUsagePatterns, RetryPolicy, UsageHint, UsagePatterns, WarmBatch, WarmError, WarmPass, WarmResult,
    WarmStrategy, Warmer, WarmingScheduler, WarmingStats, WarmingTask, warm_fn,
};

pub(crate) mod metric_names {
    pub(crate) use super::adapter::{METRIC_STORE_ERROR, METRIC_STORE_TIMEOUT};
    pub(crate) use super::edge::METRIC_EDGE_PURGE;
    pub(crate) use super::events::{METRIC_EVENT_DROPPED, METRIC_EVENT_QUEUE_LEN};
    pub(crate) use super::invalidation::{METRIC_INVALIDATION_DISPATCH_MS, METRIC_INVALIDATION_KEYS};
    pub(crate) use super::query::{METRIC_QUERY_HIT, METRIC_QUERY_MISS};
    pub(crate) use super::warming::METRIC_WARM_TASK_MS;
}
