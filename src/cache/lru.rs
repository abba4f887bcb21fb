//! Least-recently-used eviction.

use crate::cache::{Cache, CacheKey, CacheValue};
use crate::error::DbResult;
use crate::sync::lock;
use async_trait::async_trait;
use linked_hash_map::LinkedHashMap;
use std::sync::Mutex;
use tracing::trace;

pub const DEFAULT_LRU_SIZE: usize = 1024;

/// Tracks key recency and evicts the least recently used key through the
/// delegate once more than `size` keys are held.
///
/// Reads refresh recency; the key order lives in a `LinkedHashMap` whose
/// front is always the eviction candidate.
#[derive(Debug)]
pub struct LruCache {
    delegate: Box<dyn Cache>,
    keys: Mutex<LinkedHashMap<CacheKey, ()>>,
    size: usize,
}

impl LruCache {
    pub fn new(delegate: Box<dyn Cache>) -> Self {
        Self::with_size(delegate, DEFAULT_LRU_SIZE)
    }

    pub fn with_size(delegate: Box<dyn Cache>, size: usize) -> Self {
        Self {
            delegate,
            keys: Mutex::new(LinkedHashMap::new()),
            size: size.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Record `key` as most recent and return the key to evict, if any.
    fn cycle_key_list(&self, key: CacheKey) -> Option<CacheKey> {
        let mut keys = lock(&self.keys);
        keys.insert(key, ());
        if keys.len() > self.size {
            keys.pop_front().map(|(eldest, _)| eldest)
        } else {
            None
        }
    }
}

#[async_trait]
impl Cache for LruCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put_object(&self, key: CacheKey, value: CacheValue) -> DbResult<()> {
        self.delegate.put_object(key.clone(), value).await?;
        if let Some(eldest) = self.cycle_key_list(key) {
            trace!(cache_id = %self.id(), key = %eldest, "Evicting least recently used entry");
            self.delegate.remove_object(&eldest).await?;
        }
        Ok(())
    }

    async fn get_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        lock(&self.keys).get_refresh(key);
        self.delegate.get_object(key).await
    }

    async fn remove_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        lock(&self.keys).remove(key);
        self.delegate.remove_object(key).await
    }

    async fn clear(&self) -> DbResult<()> {
        lock(&self.keys).clear();
        self.delegate.clear().await
    }

    async fn size(&self) -> usize {
        self.delegate.size().await
    }
}
