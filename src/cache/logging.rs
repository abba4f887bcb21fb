//! Hit-ratio accounting.

use crate::cache::{Cache, CacheKey, CacheValue};
use crate::error::DbResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug)]
pub struct LoggingCache {
    delegate: Box<dyn Cache>,
    requests: AtomicU64,
    hits: AtomicU64,
}

impl LoggingCache {
    pub fn new(delegate: Box<dyn Cache>) -> Self {
        Self {
            delegate,
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Fraction of reads that found a value; 0.0 before the first read.
    pub fn hit_ratio(&self) -> f64 {
        let requests = self.requests();
        if requests == 0 {
            return 0.0;
        }
        self.hits() as f64 / requests as f64
    }
}

#[async_trait]
impl Cache for LoggingCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put_object(&self, key: CacheKey, value: CacheValue) -> DbResult<()> {
        self.delegate.put_object(key, value).await
    }

    async fn get_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let value = self.delegate.get_object(key).await?;
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            cache_id = %self.id(),
            hit_ratio = self.hit_ratio(),
            "Cache hit ratio"
        );
        Ok(value)
    }

    async fn remove_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        self.delegate.remove_object(key).await
    }

    async fn clear(&self) -> DbResult<()> {
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
    async fn test_hit_ratio() {
        let cache = LoggingCache::new(Box::new(PerpetualCache::new("log")));
        assert_eq!(cache.hit_ratio(), 0.0);

        cache.put_object(key(1), value(1)).await.unwrap();
        cache.get_object(&key(1)).await.unwrap();
        cache.get_object(&key(2)).await.unwrap();
        cache.get_object(&key(1)).await.unwrap();
        cache.get_object(&key(3)).await.unwrap();

        assert_eq!(cache.requests(), 4);
        assert_eq!(cache.hits(), 2);
        assert!((cache.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
