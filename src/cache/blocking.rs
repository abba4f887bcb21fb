//! Per-key locking so only one caller loads a missing entry.
//!
//! `get_object` takes the lock for its key. A hit releases it immediately; a
//! miss keeps it, so every other reader of that key waits until the loader
//! calls `put_object` (store and release) or `remove_object` (release only).
//!
//! # Concurrency
//!
//! - One `tokio::sync::Semaphore` with a single permit per key, created on
//!   first use and kept for the lifetime of the cache
//! - Held permits are parked with their [`LockOwner`]; only that owner's
//!   `put_object`, `remove_object` or `release_locks_of` releases them
//! - An owner that already holds a key does not wait on it again
//! - Waiters are served in FIFO order by the semaphore
//! - Both maps use `std::sync::Mutex` and are never locked across an await

use crate::cache::{Cache, CacheKey, CacheValue, LockOwner};
use crate::error::{DbError, DbResult};
use crate::sync::lock;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug)]
struct HeldLock {
    owner: LockOwner,
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct BlockingCache {
    delegate: Box<dyn Cache>,
    /// `None` or zero waits indefinitely.
    timeout: Option<Duration>,
    locks: Mutex<HashMap<CacheKey, Arc<Semaphore>>>,
    held: Mutex<HashMap<CacheKey, HeldLock>>,
}

impl BlockingCache {
    pub fn new(delegate: Box<dyn Cache>) -> Self {
        Self::with_timeout(delegate, None)
    }

    pub fn with_timeout(delegate: Box<dyn Cache>, timeout: Option<Duration>) -> Self {
        Self {
            delegate,
            timeout: timeout.filter(|t| !t.is_zero()),
            locks: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Number of keys whose lock is currently held.
    pub fn held_locks(&self) -> usize {
        lock(&self.held).len()
    }

    fn semaphore_for(&self, key: &CacheKey) -> Arc<Semaphore> {
        let mut locks = lock(&self.locks);
        Arc::clone(
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }

    fn holds(&self, owner: LockOwner, key: &CacheKey) -> bool {
        lock(&self.held)
            .get(key)
            .is_some_and(|held| held.owner == owner)
    }

    async fn acquire_lock(&self, owner: LockOwner, key: &CacheKey) -> DbResult<()> {
        if self.holds(owner, key) {
            return Ok(());
        }
        let semaphore = self.semaphore_for(key);
        let started = Instant::now();
        let permit = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, semaphore.acquire_owned())
                .await
                .map_err(|_| {
                    DbError::lock_timeout(
                        self.id(),
                        key.to_string(),
                        started.elapsed().as_millis() as u64,
                    )
                })?,
            None => semaphore.acquire_owned().await,
        }
        .map_err(|_| DbError::cache(self.id(), "Key lock was closed"))?;

        let waited = started.elapsed();
        if waited > Duration::from_millis(100) {
            debug!(cache_id = %self.id(), key = %key, waited_ms = waited.as_millis() as u64, "Waited for key lock");
        }
        let held = HeldLock {
            owner,
            _permit: permit,
        };
        if lock(&self.held).insert(key.clone(), held).is_some() {
            warn!(cache_id = %self.id(), key = %key, "Key lock acquired twice");
        }
        Ok(())
    }

    fn release_lock(&self, owner: LockOwner, key: &CacheKey) {
        let mut held = lock(&self.held);
        match held.get(key) {
            Some(h) if h.owner == owner => {
                held.remove(key);
            }
            Some(_) => {
                debug!(cache_id = %self.id(), key = %key, "Key lock held by another owner, not released");
            }
            None => {}
        }
    }
}

#[async_trait]
impl Cache for BlockingCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put_object(&self, key: CacheKey, value: CacheValue) -> DbResult<()> {
        self.put_object_for(LockOwner::current(), key, value).await
    }

    async fn get_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        self.get_object_for(LockOwner::current(), key).await
    }

    /// Releases the caller's key lock without touching the stored value.
    async fn remove_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        self.remove_object_for(LockOwner::current(), key).await
    }

    async fn clear(&self) -> DbResult<()> {
        self.delegate.clear().await
    }

    async fn size(&self) -> usize {
        self.delegate.size().await
    }

    async fn get_object_for(
        &self,
        owner: LockOwner,
        key: &CacheKey,
    ) -> DbResult<Option<CacheValue>> {
        self.acquire_lock(owner, key).await?;
        match self.delegate.get_object(key).await {
            Ok(Some(value)) => {
                self.release_lock(owner, key);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.release_lock(owner, key);
                Err(e)
            }
        }
    }

    async fn put_object_for(
        &self,
        owner: LockOwner,
        key: CacheKey,
        value: CacheValue,
    ) -> DbResult<()> {
        let result = self.delegate.put_object(key.clone(), value).await;
        self.release_lock(owner, &key);
        result
    }

    async fn remove_object_for(
        &self,
        owner: LockOwner,
        key: &CacheKey,
    ) -> DbResult<Option<CacheValue>> {
        self.release_lock(owner, key);
        Ok(None)
    }

    fn release_locks_of(&self, owner: LockOwner) {
        let mut held = lock(&self.held);
        let before = held.len();
        held.retain(|_, h| h.owner != owner);
        let released = before - held.len();
        if released > 0 {
            debug!(cache_id = %self.id(), released, "Released key locks of owner");
        }
    }
}
