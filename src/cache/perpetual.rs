//! Unbounded in-memory storage at the bottom of every decorator chain.

use crate::cache::{Cache, CacheKey, CacheValue};
use crate::error::DbResult;
use crate::sync::lock;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug)]
pub struct PerpetualCache {
    id: String,
    entries: Mutex<HashMap<CacheKey, CacheValue>>,
}

impl PerpetualCache {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    // Synchronous access for executors that own their cache outright.

    pub fn put(&self, key: CacheKey, value: CacheValue) {
        lock(&self.entries).insert(key, value);
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        lock(&self.entries)
            .get(key)
            .filter(|v| !v.is_null())
            .cloned()
    }

    /// Raw lookup that also reports `Null` entries.
    pub fn contains(&self, key: &CacheKey) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CacheValue> {
        lock(&self.entries).remove(key)
    }

    pub fn clear_all(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cache for PerpetualCache {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put_object(&self, key: CacheKey, value: CacheValue) -> DbResult<()> {
        self.put(key, value);
        Ok(())
    }

    async fn get_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        Ok(self.get(key))
    }

    async fn remove_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        Ok(self.remove(key))
    }

    async fn clear(&self) -> DbResult<()> {
        self.clear_all();
        Ok(())
    }

    async fn size(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::{key, value};

    #[tokio::test]
    async fn test_put_get_remove() {
        let cache = PerpetualCache::new("users");
        cache.put_object(key(1), value(1)).await.unwrap();
        assert_eq!(cache.get_object(&key(1)).await.unwrap(), Some(value(1)));
        assert_eq!(cache.size().await, 1);

        assert_eq!(cache.remove_object(&key(1)).await.unwrap(), Some(value(1)));
        assert_eq!(cache.get_object(&key(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_null_entry_reads_as_miss() {
        let cache = PerpetualCache::new("users");
        cache.put_object(key(1), CacheValue::Null).await.unwrap();
        assert_eq!(cache.get_object(&key(1)).await.unwrap(), None);
        assert!(cache.contains(&key(1)));
        assert_eq!(cache.size().await, 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = PerpetualCache::new("users");
        for i in 0..5 {
            cache.put(key(i), value(i));
        }
        cache.clear().await.unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.id(), "users");
    }
}
