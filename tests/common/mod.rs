#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cachekeeper::cache::{CacheConfig, CacheEngine, CacheStore, EventContext, StoreError, StoreInfo};

/// A store whose every operation fails, for degradation paths.
#[derive(Debug, Default)]
pub struct FailingStore;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

#[async_trait]
impl CacheStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
        Err(down())
    }
    async fn set(&self, _key: &str, _value: Bytes, _ttl: Option<Duration>) -> Result<bool, StoreError> {
        Err(down())
    }
    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Err(down())
    }
    async fn scan_delete(&self, _pattern: &str) -> Result<u64, StoreError> {
        Err(down())
    }
    async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
        Err(down())
    }
    async fn ttl_remaining(&self, _key: &str) -> Result<Option<Duration>, StoreError> {
        Err(down())
    }
    async fn increment(&self, _key: &str, _by: i64) -> Result<i64, StoreError> {
        Err(down())
    }
    async fn set_add(&self, _key: &str, _members: &[String]) -> Result<u64, StoreError> {
        Err(down())
    }
    async fn set_remove(&self, _key: &str, _members: &[String]) -> Result<u64, StoreError> {
        Err(down())
    }
    async fn set_members(&self, _key: &str) -> Result<Vec<String>, StoreError> {
        Err(down())
    }
    async fn set_contains(&self, _key: &str, _member: &str) -> Result<bool, StoreError> {
        Err(down())
    }
    async fn info(&self) -> Result<StoreInfo, StoreError> {
        Err(down())
    }
}

pub fn engine() -> CacheEngine {
    CacheEngine::builder(CacheConfig::default())
        .build()
        .expect("default engine builds")
}

pub fn failing_engine() -> CacheEngine {
    CacheEngine::builder(CacheConfig::default())
        .store(Arc::new(FailingStore))
        .build()
        .expect("engine with failing store builds")
}

pub fn context(pairs: &[(&str, &str)]) -> EventContext {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
