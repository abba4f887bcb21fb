//! One lock around every operation of the wrapped chain.

use crate::cache::{Cache, CacheKey, CacheValue};
use crate::error::DbResult;
use async_trait::async_trait;
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct SynchronizedCache {
    delegate: Box<dyn Cache>,
    gate: Mutex<()>,
}

impl SynchronizedCache {
    pub fn new(delegate: Box<dyn Cache>) -> Self {
        Self {
            delegate,
            gate: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Cache for SynchronizedCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put_object(&self, key: CacheKey, value: CacheValue) -> DbResult<()> {
        let _guard = self.gate.lock().await;
        self.delegate.put_object(key, value).await
    }

    async fn get_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        let _guard = self.gate.lock().await;
        self.delegate.get_object(key).await
    }

    async fn remove_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        let _guard = self.gate.lock().await;
        self.delegate.remove_object(key).await
    }

    async fn clear(&self) -> DbResult<()> {
        let _guard = self.gate.lock().await;
        self.delegate.clear().await
    }

    async fn size(&self) -> usize {
        let _guard = self.gate.lock().await;
        self.delegate.size().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::{key, value};
    use crate::cache::{LruCache, PerpetualCache};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_respect_capacity() {
        let cache = Arc::new(SynchronizedCache::new(Box::new(LruCache::with_size(
            Box::new(PerpetualCache::new("sync")),
            50,
        ))));

        let mut handles = Vec::new();
        for t in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    let n = t * 1000 + i;
                    cache.put_object(key(n), value(n)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.size().await, 50);
    }
}
