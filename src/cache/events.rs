//! Invalidation events and the in-memory queue in front of the engine.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

use super::invalidation::EventContext;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";

pub(crate) const METRIC_EVENT_QUEUE_LEN: &str = "cachekeeper_event_queue_len";
pub(crate) const METRIC_EVENT_DROPPED: &str = "cachekeeper_event_dropped_total";

/// Monotonic per-process sequence number.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Identifier for log correlation.
    pub id: Uuid,
    pub epoch: Epoch,
    /// Event name rules are bound to, e.g. `patient_update`.
    pub name: String,
    pub context: EventContext,
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(name: impl Into<String>, context: EventContext, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            name: name.into(),
            context,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Bounded FIFO of pending events.
pub struct EventQueue {
    queue: Mutex<VecDeque<CacheEvent>>,
    limit: usize,
    epoch_counter: AtomicU64,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            limit: limit.max(1),
            epoch_counter: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Enqueue an event. A full queue rejects it and returns `None`.
    pub fn publish(&self, name: &str, context: EventContext) -> Option<Epoch> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        if queue.len() >= self.limit {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_EVENT_DROPPED).increment(1);
            error!(
                event_name = name,
                limit = self.limit,
                "Cache event queue full; event dropped"
            );
            return None;
        }

        let event = CacheEvent::new(name, context, self.next_epoch());
        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_name = %event.name,
            "Cache event enqueued"
        );
        let epoch = event.epoch;
        queue.push_back(event);
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        Some(epoch)
    }

    /// Up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let drained = queue.drain(..count).collect();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        drained
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
