//! Lazy-invalidation stale markers.
//!
//! Marked keys live in one shared store set. A read that finds its key marked
//! drops both the marker and the cached value and reports a miss, so a
//! refresh that fails or is not stored leaves nothing stale behind. A
//! refreshed write also clears the marker.

use std::sync::Arc;

use tracing::debug;

use super::adapter::StoreAdapter;

pub const DEFAULT_STALE_SET: &str = "cachekeeper:stale_keys";

#[derive(Clone)]
pub struct StaleMarkers {
    adapter: Arc<StoreAdapter>,
    set_key: String,
}

impl StaleMarkers {
    pub fn new(adapter: Arc<StoreAdapter>, set_key: impl Into<String>) -> Self {
        Self {
            adapter,
            set_key: set_key.into(),
        }
    }

    /// Mark keys stale; returns how many were newly marked.
    pub async fn mark(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        self.adapter.set_add(&self.set_key, keys).await
    }

    pub async fn is_stale(&self, key: &str) -> bool {
        self.adapter.set_contains(&self.set_key, key).await
    }

    /// If `key` is marked, delete its value, clear the marker and return `true`.
    pub async fn take(&self, key: &str) -> bool {
        if !self.is_stale(key).await {
            return false;
        }
        let dropped = self.adapter.delete(key).await;
        self.adapter.set_remove(&self.set_key, &[key.to_string()]).await;
        debug!(key, dropped, "Stale marker consumed on read");
        true
    }

    pub async fn clear(&self, key: &str) {
        self.adapter.set_remove(&self.set_key, &[key.to_string()]).await;
    }

    pub async fn marked(&self) -> Vec<String> {
        self.adapter.set_members(&self.set_key).await
    }
}
