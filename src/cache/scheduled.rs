//! Full clears on a fixed interval.

use crate::cache::{Cache, CacheKey, CacheValue};
use crate::error::DbResult;
use crate::sync::lock;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_CLEAR_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Clears the delegate before any operation once `clear_interval` has
/// passed since the last clear. No background task is involved.
#[derive(Debug)]
pub struct ScheduledCache {
    delegate: Box<dyn Cache>,
    clear_interval: Duration,
    last_clear: Mutex<Instant>,
}

impl ScheduledCache {
    pub fn new(delegate: Box<dyn Cache>) -> Self {
        Self::with_interval(delegate, DEFAULT_CLEAR_INTERVAL)
    }

    pub fn with_interval(delegate: Box<dyn Cache>, clear_interval: Duration) -> Self {
        Self {
            delegate,
            clear_interval,
            last_clear: Mutex::new(Instant::now()),
        }
    }

    /// Returns true when the delegate was cleared.
    async fn clear_when_stale(&self) -> DbResult<bool> {
        let stale = {
            let mut last_clear = lock(&self.last_clear);
            if last_clear.elapsed() >= self.clear_interval {
                *last_clear = Instant::now();
                true
            } else {
                false
            }
        };
        if stale {
            debug!(cache_id = %self.id(), "Scheduled clear");
            self.delegate.clear().await?;
        }
        Ok(stale)
    }
}

#[async_trait]
impl Cache for ScheduledCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put_object(&self, key: CacheKey, value: CacheValue) -> DbResult<()> {
        self.clear_when_stale().await?;
        self.delegate.put_object(key, value).await
    }

    async fn get_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        if self.clear_when_stale().await? {
            return Ok(None);
        }
        self.delegate.get_object(key).await
    }

    async fn remove_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        self.clear_when_stale().await?;
        self.delegate.remove_object(key).await
    }

    async fn clear(&self) -> DbResult<()> {
        *lock(&self.last_clear) = Instant::now();
        self.delegate.clear().await
    }

    async fn size(&self) -> usize {
        // A failed clear only delays the next attempt; size stays accurate.
        let _ = self.clear_when_stale().await;
        self.delegate.size().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PerpetualCache;
    use crate::cache::test_support::{key, value};

    #[tokio::test]
    async fn test_clears_after_interval() {
        let cache =
            ScheduledCache::with_interval(Box::new(PerpetualCache::new("sched")), Duration::from_millis(30));
        cache.put_object(key(1), value(1)).await.unwrap();
        assert!(cache.get_object(&key(1)).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get_object(&key(1)).await.unwrap().is_none());
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn test_default_interval_keeps_entries() {
        let cache = ScheduledCache::new(Box::new(PerpetualCache::new("sched")));
        cache.put_object(key(1), value(1)).await.unwrap();
        assert_eq!(cache.size().await, 1);
    }
}
