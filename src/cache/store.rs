//! Key-value store contract and the in-process implementation.
//!
//! The contract mirrors a networked TTL store: byte values, integer counters,
//! string sets and glob scans. [`MemoryStore`] keeps everything in an LRU with
//! lazy expiry and is what the binary runs with unless an external store is
//! plugged in.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use thiserror::Error;
use tokio::time::Instant;

use super::lock::{rw_read, rw_write};
use super::pattern::{KeyPattern, PatternError};

const SOURCE: &str = "cache::store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("key `{key}` holds a value of the wrong type for `{op}`")]
    WrongType { key: String, op: &'static str },
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

/// Point-in-time store occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreInfo {
    pub keys: u64,
    pub memory_bytes: u64,
    pub evictions: u64,
}

/// Operations every backing store provides.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;
    /// Store `value`; `ttl = None` keeps it until evicted.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool, StoreError>;
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    /// Delete every key matching the glob; returns how many went.
    async fn scan_delete(&self, pattern: &str) -> Result<u64, StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StoreError>;
    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError>;
    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;
    async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn info(&self) -> Result<StoreInfo, StoreError>;
}

// ============================================================================
// In-process store
// ============================================================================

#[derive(Debug, Clone)]
enum Slot {
    Bytes(Bytes),
    Counter(i64),
    Set(HashSet<String>),
}

impl Slot {
    fn footprint(&self) -> usize {
        match self {
            Self::Bytes(bytes) => bytes.len(),
            Self::Counter(_) => std::mem::size_of::<i64>(),
            Self::Set(members) => members.iter().map(String::len).sum(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// LRU-bounded in-memory store with per-key expiry.
pub struct MemoryStore {
    entries: RwLock<LruCache<String, Entry>>,
    evictions: AtomicU64,
}

impl MemoryStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            evictions: AtomicU64::new(0),
        }
    }

    fn insert(&self, key: &str, entry: Entry) {
        let mut entries = rw_write(&self.entries, SOURCE, "insert");
        self.push_counted(&mut entries, key, entry, Instant::now());
    }

    /// Push into the LRU, counting an eviction when a different live key goes.
    fn push_counted(&self, entries: &mut LruCache<String, Entry>, key: &str, entry: Entry, now: Instant) {
        if let Some((evicted, old)) = entries.push(key.to_string(), entry)
            && evicted != key
            && !old.is_expired(now)
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Live entry for `key`, dropping it first if it has expired.
    fn live(&self, key: &str, op: &'static str) -> Option<Entry> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, op);
        let expired = entries.get(key)?.is_expired(now);
        if expired {
            entries.pop(key);
            return None;
        }
        entries.peek(key).cloned()
    }

    fn with_set<T>(
        &self,
        key: &str,
        op: &'static str,
        create: bool,
        f: impl FnOnce(&mut HashSet<String>) -> T,
    ) -> Result<Option<T>, StoreError> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, op);
        if entries.peek(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.pop(key);
        }
        if entries.peek(key).is_none() {
            if !create {
                return Ok(None);
            }
            let fresh = Entry {
                slot: Slot::Set(HashSet::new()),
                expires_at: None,
            };
            self.push_counted(&mut entries, key, fresh, now);
        }
        match entries.get_mut(key) {
            Some(Entry {
                slot: Slot::Set(members),
                ..
            }) => Ok(Some(f(members))),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
                op,
            }),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        match self.live(key, "get") {
            Some(Entry {
                slot: Slot::Bytes(bytes),
                ..
            }) => Ok(Some(bytes)),
            Some(Entry {
                slot: Slot::Counter(value),
                ..
            }) => Ok(Some(Bytes::from(value.to_string()))),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
                op: "get",
            }),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool, StoreError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.insert(
            key,
            Entry {
                slot: Slot::Bytes(value),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let removed = rw_write(&self.entries, SOURCE, "delete").pop(key);
        Ok(removed.is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn scan_delete(&self, pattern: &str) -> Result<u64, StoreError> {
        let matcher = KeyPattern::compile(pattern)?;
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "scan_delete");
        let doomed: Vec<(String, bool)> = entries
            .iter()
            .filter(|(key, _)| matcher.is_match(key))
            .map(|(key, entry)| (key.clone(), entry.is_expired(now)))
            .collect();
        let mut deleted = 0;
        for (key, expired) in doomed {
            entries.pop(&key);
            if !expired {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live(key, "exists").is_some())
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        Ok(self
            .live(key, "ttl_remaining")
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "increment");
        if entries.peek(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.pop(key);
        }
        match entries.get_mut(key) {
            Some(Entry {
                slot: Slot::Counter(value),
                ..
            }) => {
                *value = value.saturating_add(by);
                Ok(*value)
            }
            Some(Entry {
                slot: Slot::Bytes(bytes),
                expires_at,
            }) => {
                let current = std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .ok_or_else(|| StoreError::WrongType {
                        key: key.to_string(),
                        op: "increment",
                    })?;
                let next = current.saturating_add(by);
                let expires_at = *expires_at;
                entries.put(
                    key.to_string(),
                    Entry {
                        slot: Slot::Counter(next),
                        expires_at,
                    },
                );
                Ok(next)
            }
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
                op: "increment",
            }),
            None => {
                let fresh = Entry {
                    slot: Slot::Counter(by),
                    expires_at: None,
                };
                self.push_counted(&mut entries, key, fresh, now);
                Ok(by)
            }
        }
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        let added = self.with_set(key, "set_add", true, |set| {
            members
                .iter()
                .filter(|member| set.insert((*member).clone()))
                .count() as u64
        })?;
        Ok(added.unwrap_or(0))
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        let removed = self.with_set(key, "set_remove", false, |set| {
            members.iter().filter(|member| set.remove(*member)).count() as u64
        })?;
        Ok(removed.unwrap_or(0))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let members = self.with_set(key, "set_members", false, |set| {
            let mut members: Vec<String> = set.iter().cloned().collect();
            members.sort();
            members
        })?;
        Ok(members.unwrap_or_default())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let found = self.with_set(key, "set_contains", false, |set| set.contains(member))?;
        Ok(found.unwrap_or(false))
    }

    async fn info(&self) -> Result<StoreInfo, StoreError> {
        let now = Instant::now();
        let entries = rw_read(&self.entries, SOURCE, "info");
        let (keys, memory_bytes) = entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .fold((0_u64, 0_u64), |(keys, bytes), (key, entry)| {
                (keys + 1, bytes + (key.len() + entry.slot.footprint()) as u64)
            });
        Ok(StoreInfo {
            keys,
            memory_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}
