//! Write buffering for the second-level cache.
//!
//! A unit of work never writes a namespace cache directly. Its writes and
//! clears are staged in a [`TransactionalCache`] and only reach the shared
//! cache on commit; on rollback they are discarded. Keys the unit of work
//! missed are remembered so that their blocking locks (if the shared cache
//! blocks) are released on either outcome. Each buffer takes those locks
//! under its own [`LockOwner`] token and gives back whatever it still holds
//! when dropped, so an abandoned unit of work never strands a key.

use crate::cache::{Cache, CacheKey, CacheValue, LockOwner};
use crate::error::{DbError, DbResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct TransactionalCache {
    delegate: Arc<dyn Cache>,
    owner: LockOwner,
    clear_on_commit: bool,
    pending_writes: HashMap<CacheKey, CacheValue>,
    missed_keys: HashSet<CacheKey>,
}

impl TransactionalCache {
    pub fn new(delegate: Arc<dyn Cache>) -> Self {
        Self {
            delegate,
            owner: LockOwner::token(),
            clear_on_commit: false,
            pending_writes: HashMap::new(),
            missed_keys: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.delegate.id()
    }

    pub async fn get_object(&mut self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        // This unit of work already holds the key lock from its first miss.
        if self.missed_keys.contains(key) {
            return Ok(None);
        }
        let value = self.delegate.get_object_for(self.owner, key).await?;
        if value.is_none() {
            self.missed_keys.insert(key.clone());
        }
        if self.clear_on_commit {
            Ok(None)
        } else {
            Ok(value)
        }
    }

    /// Stage a write. Nothing reaches the shared cache before commit.
    pub fn put_object(&mut self, key: CacheKey, value: CacheValue) {
        self.pending_writes.insert(key, value);
    }

    /// Stage a full clear and drop everything staged so far.
    pub fn clear(&mut self) {
        self.clear_on_commit = true;
        self.pending_writes.clear();
    }

    pub fn has_pending(&self) -> bool {
        self.clear_on_commit || !self.pending_writes.is_empty()
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        let mut first_error = None;
        if self.clear_on_commit {
            if let Err(e) = self.delegate.clear().await {
                first_error = Some(e);
            }
        }
        let result = self.flush_pending_entries().await;
        self.reset();
        match (first_error, result) {
            (Some(e), _) | (None, Err(e)) => Err(e),
            (None, Ok(())) => Ok(()),
        }
    }

    pub async fn rollback(&mut self) {
        self.unlock_missed_entries().await;
        self.reset();
    }

    async fn flush_pending_entries(&mut self) -> DbResult<()> {
        debug!(
            cache_id = %self.id(),
            writes = self.pending_writes.len(),
            missed = self.missed_keys.len(),
            "Flushing staged cache entries"
        );
        let mut first_error: Option<DbError> = None;
        let writes = std::mem::take(&mut self.pending_writes);
        let mut written = HashSet::with_capacity(writes.len());
        for (key, value) in writes {
            written.insert(key.clone());
            if let Err(e) = self.delegate.put_object_for(self.owner, key, value).await {
                first_error.get_or_insert(e);
            }
        }
        // Missed keys that were never produced still need their locks released.
        for key in self.missed_keys.iter().filter(|k| !written.contains(*k)) {
            if let Err(e) = self
                .delegate
                .put_object_for(self.owner, key.clone(), CacheValue::Null)
                .await
            {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn unlock_missed_entries(&mut self) {
        for key in &self.missed_keys {
            if let Err(e) = self.delegate.remove_object_for(self.owner, key).await {
                warn!(
                    cache_id = %self.delegate.id(),
                    key = %key,
                    error = %e,
                    "Failed to release cache entry on rollback"
                );
            }
        }
    }

    fn reset(&mut self) {
        self.clear_on_commit = false;
        self.pending_writes.clear();
        self.missed_keys.clear();
    }
}

impl Drop for TransactionalCache {
    fn drop(&mut self) {
        if !self.missed_keys.is_empty() {
            debug!(
                cache_id = %self.id(),
                missed = self.missed_keys.len(),
                "Unit of work dropped with pending key locks"
            );
            self.delegate.release_locks_of(self.owner);
        }
    }
}

/// One [`TransactionalCache`] per namespace cache touched by a unit of work.
#[derive(Debug, Default)]
pub struct TransactionalCacheManager {
    caches: HashMap<String, TransactionalCache>,
}

impl TransactionalCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn transactional_cache(&mut self, cache: &Arc<dyn Cache>) -> &mut TransactionalCache {
        self.caches
            .entry(cache.id().to_string())
            .or_insert_with(|| TransactionalCache::new(Arc::clone(cache)))
    }

    pub fn clear(&mut self, cache: &Arc<dyn Cache>) {
        self.transactional_cache(cache).clear();
    }

    pub async fn get_object(
        &mut self,
        cache: &Arc<dyn Cache>,
        key: &CacheKey,
    ) -> DbResult<Option<CacheValue>> {
        self.transactional_cache(cache).get_object(key).await
    }

    pub fn put_object(&mut self, cache: &Arc<dyn Cache>, key: CacheKey, value: CacheValue) {
        self.transactional_cache(cache).put_object(key, value);
    }

    /// Commit every staged cache; the first failure is reported after all
    /// caches have been processed.
    pub async fn commit(&mut self) -> DbResult<()> {
        let mut first_error = None;
        for tc in self.caches.values_mut() {
            if let Err(e) = tc.commit().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn rollback(&mut self) {
        for tc in self.caches.values_mut() {
            tc.rollback().await;
        }
    }
}
