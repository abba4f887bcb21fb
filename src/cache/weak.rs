//! Entries that are dropped at the first pressure event.

use crate::cache::{Cache, CacheKey, CacheValue};
use crate::error::DbResult;
use crate::sync::lock;
use async_trait::async_trait;
use linked_hash_map::LinkedHashMap;
use std::sync::Mutex;
use tracing::debug;

pub const DEFAULT_WEAK_THRESHOLD: usize = 1024;

/// Like [`SoftCache`](super::SoftCache) without the hard-link ring: once more
/// than `threshold` entries are tracked, every entry except the one just
/// written is reclaimed.
#[derive(Debug)]
pub struct WeakCache {
    delegate: Box<dyn Cache>,
    tracked: Mutex<LinkedHashMap<CacheKey, ()>>,
    threshold: usize,
}

impl WeakCache {
    pub fn new(delegate: Box<dyn Cache>) -> Self {
        Self::with_threshold(delegate, DEFAULT_WEAK_THRESHOLD)
    }

    pub fn with_threshold(delegate: Box<dyn Cache>, threshold: usize) -> Self {
        Self {
            delegate,
            tracked: Mutex::new(LinkedHashMap::new()),
            threshold: threshold.max(1),
        }
    }

    /// Force a pressure event.
    pub async fn reclaim(&self) -> DbResult<usize> {
        let victims: Vec<CacheKey> = {
            let mut tracked = lock(&self.tracked);
            let keys = tracked.keys().cloned().collect();
            tracked.clear();
            keys
        };
        self.drop_victims(&victims).await?;
        Ok(victims.len())
    }

    async fn drop_victims(&self, victims: &[CacheKey]) -> DbResult<()> {
        if victims.is_empty() {
            return Ok(());
        }
        debug!(cache_id = %self.id(), reclaimed = victims.len(), "Reclaiming weak entries");
        for victim in victims {
            self.delegate.remove_object(victim).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for WeakCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put_object(&self, key: CacheKey, value: CacheValue) -> DbResult<()> {
        self.delegate.put_object(key.clone(), value).await?;
        let victims: Vec<CacheKey> = {
            let mut tracked = lock(&self.tracked);
            tracked.insert(key.clone(), ());
            if tracked.len() > self.threshold {
                let victims = tracked.keys().filter(|k| **k != key).cloned().collect();
                tracked.clear();
                tracked.insert(key, ());
                victims
            } else {
                Vec::new()
            }
        };
        self.drop_victims(&victims).await
    }

    async fn get_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        let result = self.delegate.get_object(key).await?;
        if result.is_none() && lock(&self.tracked).remove(key).is_some() {
            self.delegate.remove_object(key).await?;
        }
        Ok(result)
    }

    async fn remove_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        lock(&self.tracked).remove(key);
        self.delegate.remove_object(key).await
    }

    async fn clear(&self) -> DbResult<()> {
        lock(&self.tracked).clear();
        self.delegate.clear().await
    }

    async fn size(&self) -> usize {
        self.delegate.size().await
    }
}
