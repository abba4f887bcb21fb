//! First-in-first-out eviction.

use crate::cache::{Cache, CacheKey, CacheValue};
use crate::error::DbResult;
use crate::sync::lock;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_FIFO_SIZE: usize = 1024;

/// Evicts the oldest inserted key once more than `size` keys are held.
/// Reads do not affect order.
#[derive(Debug)]
pub struct FifoCache {
    delegate: Box<dyn Cache>,
    keys: Mutex<VecDeque<CacheKey>>,
    size: usize,
}

impl FifoCache {
    pub fn new(delegate: Box<dyn Cache>) -> Self {
        Self::with_size(delegate, DEFAULT_FIFO_SIZE)
    }

    pub fn with_size(delegate: Box<dyn Cache>, size: usize) -> Self {
        Self {
            delegate,
            keys: Mutex::new(VecDeque::new()),
            size: size.max(1),
        }
    }

    fn cycle_key_list(&self, key: CacheKey) -> Option<CacheKey> {
        let mut keys = lock(&self.keys);
        if keys.contains(&key) {
            return None;
        }
        keys.push_back(key);
        if keys.len() > self.size {
            keys.pop_front()
        } else {
            None
        }
    }
}

#[async_trait]
impl Cache for FifoCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put_object(&self, key: CacheKey, value: CacheValue) -> DbResult<()> {
        if let Some(oldest) = self.cycle_key_list(key.clone()) {
            self.delegate.remove_object(&oldest).await?;
        }
        self.delegate.put_object(key, value).await
    }

    async fn get_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        self.delegate.get_object(key).await
    }

    async fn remove_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        lock(&self.keys).retain(|k| k != key);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PerpetualCache;
    use crate::cache::test_support::{key, value};

    #[tokio::test]
    async fn test_evicts_oldest_regardless_of_access() {
        let cache = FifoCache::with_size(Box::new(PerpetualCache::new("fifo")), 3);
        for i in 0..3 {
            cache.put_object(key(i), value(i)).await.unwrap();
        }
        assert!(cache.get_object(&key(0)).await.unwrap().is_some());
        cache.put_object(key(3), value(3)).await.unwrap();

        assert!(cache.get_object(&key(0)).await.unwrap().is_none());
        assert!(cache.get_object(&key(1)).await.unwrap().is_some());
        assert_eq!(cache.size().await, 3);
    }

    #[tokio::test]
    async fn test_reinsert_keeps_position() {
        let cache = FifoCache::with_size(Box::new(PerpetualCache::new("fifo")), 2);
        cache.put_object(key(1), value(1)).await.unwrap();
        cache.put_object(key(2), value(2)).await.unwrap();
        cache.put_object(key(1), value(11)).await.unwrap();
        cache.put_object(key(3), value(3)).await.unwrap();
        assert!(cache.get_object(&key(1)).await.unwrap().is_none());
        assert_eq!(cache.get_object(&key(2)).await.unwrap(), Some(value(2)));
    }
}
