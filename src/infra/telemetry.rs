use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_names::{
    METRIC_EDGE_PURGE, METRIC_EVENT_DROPPED, METRIC_EVENT_QUEUE_LEN, METRIC_INVALIDATION_DISPATCH_MS,
    METRIC_INVALIDATION_KEYS, METRIC_QUERY_HIT, METRIC_QUERY_MISS, METRIC_STORE_ERROR,
    METRIC_STORE_TIMEOUT, METRIC_WARM_TASK_MS,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the engine emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_QUERY_HIT,
            Unit::Count,
            "Query cache lookups answered from the store, by namespace."
        );
        describe_counter!(
            METRIC_QUERY_MISS,
            Unit::Count,
            "Query cache lookups that fell through to compute, by namespace."
        );
        describe_counter!(
            METRIC_STORE_ERROR,
            Unit::Count,
            "Store operations that failed and were degraded, by operation."
        );
        describe_counter!(
            METRIC_STORE_TIMEOUT,
            Unit::Count,
            "Store operations that exceeded the per-call timeout, by operation."
        );
        describe_counter!(
            METRIC_INVALIDATION_KEYS,
            Unit::Count,
            "Keys deleted or marked stale by invalidation rules."
        );
        describe_histogram!(
            METRIC_INVALIDATION_DISPATCH_MS,
            Unit::Milliseconds,
            "Time to dispatch every rule bound to one event."
        );
        describe_gauge!(
            METRIC_EVENT_QUEUE_LEN,
            Unit::Count,
            "Pending cache events awaiting dispatch."
        );
        describe_counter!(
            METRIC_EVENT_DROPPED,
            Unit::Count,
            "Cache events rejected because the queue was full."
        );
        describe_histogram!(
            METRIC_WARM_TASK_MS,
            Unit::Milliseconds,
            "Warming task duration including retries, by task."
        );
        describe_counter!(
            METRIC_EDGE_PURGE,
            Unit::Count,
            "CDN purge requests, by outcome."
        );
    });
}
