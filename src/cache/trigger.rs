//! Publishing front-end for invalidation events.
//!
//! Write paths call the named helpers after a successful commit. Events are
//! queued and either consumed on the spot or by the background consumer.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::events::EventQueue;
use super::invalidation::{EventContext, InvalidationEngine, InvalidationReport};
use super::tasks::BackgroundTasks;

pub struct CacheTrigger {
    enabled: bool,
    queue: Arc<EventQueue>,
    engine: Arc<InvalidationEngine>,
    batch_limit: usize,
}

impl CacheTrigger {
    pub fn new(enabled: bool, queue: Arc<EventQueue>, engine: Arc<InvalidationEngine>, batch_limit: usize) -> Self {
        Self {
            enabled,
            queue,
            engine,
            batch_limit: batch_limit.max(1),
        }
    }

    /// Queue `event`, dispatching right away when `consume_now` is set.
    pub async fn trigger(&self, event: &str, context: EventContext, consume_now: bool) -> Vec<InvalidationReport> {
        if !self.enabled {
            debug!(event_name = event, "Cache trigger skipped: invalidation disabled");
            return Vec::new();
        }

        self.queue.publish(event, context);

        if consume_now {
            self.consume().await
        } else {
            Vec::new()
        }
    }

    /// Dispatch up to one batch of queued events in order.
    pub async fn consume(&self) -> Vec<InvalidationReport> {
        let events = self.queue.drain(self.batch_limit);
        let mut reports = Vec::with_capacity(events.len());
        for event in events {
            debug!(event_id = %event.id, event_epoch = event.epoch, "Consuming cache event");
            reports.push(
                self.engine
                    .trigger_invalidation(&event.name, &event.context)
                    .await,
            );
        }
        reports
    }

    /// Periodically drain the queue until shutdown.
    pub fn spawn_auto_consume(self: &Arc<Self>, tasks: &BackgroundTasks, interval: Duration) {
        let trigger = Arc::clone(self);
        tasks.spawn("event_consumer", move |mut signal| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = signal.cancelled() => break,
                    _ = ticker.tick() => {
                        if !trigger.queue.is_empty() {
                            let reports = trigger.consume().await;
                            debug!(events = reports.len(), "Auto-consumed cache events");
                        }
                    }
                }
            }
            // Flush what is left so committed writes are not left stale.
            let remaining = trigger.consume().await;
            info!(events = remaining.len(), "Event consumer stopped");
        });
    }

    pub async fn patient_updated(&self, patient_id: &str) -> Vec<InvalidationReport> {
        self.trigger("patient_update", context([("patient_id", patient_id)]), true)
            .await
    }

    pub async fn patient_records_updated(&self, patient_id: &str) -> Vec<InvalidationReport> {
        self.trigger(
            "patient_records_update",
            context([("patient_id", patient_id)]),
            true,
        )
        .await
    }

    pub async fn translation_updated(&self, locale: &str) -> Vec<InvalidationReport> {
        self.trigger("translation_update", context([("locale", locale)]), true)
            .await
    }

    pub async fn document_rendered(&self, document_id: &str) -> Vec<InvalidationReport> {
        self.trigger(
            "document_rendered",
            context([("document_id", document_id)]),
            true,
        )
        .await
    }

    pub async fn search_reindexed(&self) -> Vec<InvalidationReport> {
        self.trigger("search_reindex", EventContext::new(), true).await
    }

    pub async fn user_profile_updated(&self, user_id: &str) -> Vec<InvalidationReport> {
        self.trigger("user_profile_update", context([("user_id", user_id)]), true)
            .await
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }
}

fn context<const N: usize>(pairs: [(&str, &str); N]) -> EventContext {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use bytes::Bytes;

    use super::*;
    use crate::cache::adapter::StoreAdapter;
    use crate::cache::edge::{EdgeCachePolicy, NoopPurger};
    use crate::cache::rules::RuleRegistry;
    use crate::cache::stale::{DEFAULT_STALE_SET, StaleMarkers};
    use crate::cache::store::MemoryStore;
    use crate::cache::ttl::TtlPolicyManager;

    fn create_trigger(enabled: bool) -> (CacheTrigger, Arc<StoreAdapter>, Arc<BackgroundTasks>) {
        let store = MemoryStore::new(NonZeroUsize::new(64).expect("non-zero"));
        let adapter = Arc::new(StoreAdapter::new(Arc::new(store), Duration::from_millis(200)));
        let tasks = Arc::new(BackgroundTasks::new());
        let edge = Arc::new(EdgeCachePolicy::new(
            Arc::new(TtlPolicyManager::default()),
            Arc::new(NoopPurger),
            tasks.clone(),
            Duration::from_secs(1),
        ));
        let engine = Arc::new(InvalidationEngine::new(
            RuleRegistry::with_builtin_rules().expect("builtin rules"),
            adapter.clone(),
            StaleMarkers::new(adapter.clone(), DEFAULT_STALE_SET),
            edge,
            tasks.clone(),
        ));
        let queue = Arc::new(EventQueue::new(16));
        (CacheTrigger::new(enabled, queue, engine, 8), adapter, tasks)
    }

    #[tokio::test]
    async fn trigger_without_consume_only_queues() {
        let (trigger, _, _) = create_trigger(true);
        let reports = trigger
            .trigger("patient_update", context([("patient_id", "1")]), false)
            .await;
        assert!(reports.is_empty());
        assert_eq!(trigger.queue().len(), 1);
    }

    #[tokio::test]
    async fn disabled_trigger_publishes_nothing() {
        let (trigger, _, _) = create_trigger(false);
        trigger.patient_updated("1").await;
        assert!(trigger.queue().is_empty());
    }

    #[tokio::test]
    async fn helpers_consume_immediately() {
        let (trigger, adapter, _) = create_trigger(true);
        adapter.set("profile:5", Bytes::from_static(b"x"), None).await;

        let reports = trigger.user_profile_updated("5").await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].keys_deleted, 1);
        assert!(trigger.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_consumer_drains_and_flushes_on_shutdown() {
        let (trigger, adapter, tasks) = create_trigger(true);
        let trigger = Arc::new(trigger);
        adapter.set("profile:9", Bytes::from_static(b"x"), None).await;
        trigger.spawn_auto_consume(&tasks, Duration::from_secs(5));

        trigger
            .trigger("user_profile_update", context([("user_id", "9")]), false)
            .await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!adapter.exists("profile:9").await);

        adapter.set("profile:10", Bytes::from_static(b"x"), None).await;
        trigger
            .trigger("user_profile_update", context([("user_id", "10")]), false)
            .await;
        tasks.shutdown(Duration::from_secs(1)).await;
        assert!(!adapter.exists("profile:10").await);
    }
}
