//! Reclaimable entries with a ring of recently used keys pinned in place.
//!
//! Entries stay until a pressure event: either more than `threshold` entries
//! are tracked, or [`SoftCache::reclaim`] is called. A pressure event removes
//! entries oldest first, skipping the keys most recently returned by
//! `get_object` (the hard-link ring).

use crate::cache::{Cache, CacheKey, CacheValue};
use crate::error::DbResult;
use crate::sync::lock;
use async_trait::async_trait;
use linked_hash_map::LinkedHashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

pub const DEFAULT_HARD_LINKS: usize = 256;
pub const DEFAULT_SOFT_THRESHOLD: usize = 1024;

#[derive(Debug, Default)]
struct SoftState {
    /// Tracked keys in insertion order.
    tracked: LinkedHashMap<CacheKey, ()>,
    /// Most recently returned keys, newest at the front.
    hard_links: VecDeque<CacheKey>,
}

impl SoftState {
    fn is_pinned(&self, key: &CacheKey) -> bool {
        self.hard_links.contains(key)
    }

    /// Oldest unpinned keys, enough to bring the tracked count to `target`.
    /// `spare` is never selected.
    fn select_victims(&mut self, target: usize, spare: Option<&CacheKey>) -> Vec<CacheKey> {
        let excess = self.tracked.len().saturating_sub(target);
        let victims: Vec<CacheKey> = self
            .tracked
            .keys()
            .filter(|k| !self.is_pinned(k) && Some(*k) != spare)
            .take(excess)
            .cloned()
            .collect();
        for victim in &victims {
            self.tracked.remove(victim);
        }
        victims
    }
}

#[derive(Debug)]
pub struct SoftCache {
    delegate: Box<dyn Cache>,
    state: Mutex<SoftState>,
    hard_links: usize,
    threshold: usize,
}

impl SoftCache {
    pub fn new(delegate: Box<dyn Cache>) -> Self {
        Self::with_limits(delegate, DEFAULT_HARD_LINKS, DEFAULT_SOFT_THRESHOLD)
    }

    pub fn with_limits(delegate: Box<dyn Cache>, hard_links: usize, threshold: usize) -> Self {
        Self {
            delegate,
            state: Mutex::new(SoftState::default()),
            hard_links,
            threshold: threshold.max(1),
        }
    }

    /// Force a pressure event. Every unpinned entry is reclaimed.
    pub async fn reclaim(&self) -> DbResult<usize> {
        let victims = lock(&self.state).select_victims(0, None);
        self.drop_victims(&victims).await?;
        Ok(victims.len())
    }

    async fn drop_victims(&self, victims: &[CacheKey]) -> DbResult<()> {
        if victims.is_empty() {
            return Ok(());
        }
        debug!(cache_id = %self.id(), reclaimed = victims.len(), "Reclaiming soft entries");
        for victim in victims {
            self.delegate.remove_object(victim).await?;
        }
        Ok(())
    }

    fn pin(&self, key: &CacheKey) {
        if self.hard_links == 0 {
            return;
        }
        let mut state = lock(&self.state);
        state.hard_links.retain(|k| k != key);
        state.hard_links.push_front(key.clone());
        state.hard_links.truncate(self.hard_links);
    }
}

#[async_trait]
impl Cache for SoftCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put_object(&self, key: CacheKey, value: CacheValue) -> DbResult<()> {
        self.delegate.put_object(key.clone(), value).await?;
        let victims = {
            let mut state = lock(&self.state);
            state.tracked.insert(key.clone(), ());
            if state.tracked.len() > self.threshold {
                state.select_victims(self.threshold, Some(&key))
            } else {
                Vec::new()
            }
        };
        self.drop_victims(&victims).await
    }

    async fn get_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        let result = self.delegate.get_object(key).await?;
        match &result {
            Some(_) => self.pin(key),
            None => {
                let was_tracked = lock(&self.state).tracked.remove(key).is_some();
                if was_tracked {
                    self.delegate.remove_object(key).await?;
                }
            }
        }
        Ok(result)
    }

    async fn remove_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        {
            let mut state = lock(&self.state);
            state.tracked.remove(key);
            state.hard_links.retain(|k| k != key);
        }
        self.delegate.remove_object(key).await
    }

    async fn clear(&self) -> DbResult<()> {
        {
            let mut state = lock(&self.state);
            state.tracked.clear();
            state.hard_links.clear();
        }
        self.delegate.clear().await
    }

    async fn size(&self) -> usize {
        self.delegate.size().await
    }
}
