//! Layered result caches.
//!
//! Every cache implements [`Cache`]. Storage is a [`PerpetualCache`]; behavior
//! is added by wrapping it in decorators, each adding exactly one concern:
//!
//! - `LruCache` / `FifoCache`: bounded eviction
//! - `SoftCache` / `WeakCache`: reclamation under capacity pressure
//! - `ScheduledCache`: periodic full clears
//! - `SerializedCache`: copy-on-read/write through serialization
//! - `LoggingCache`: hit-ratio accounting
//! - `SynchronizedCache`: one lock around every operation
//! - `BlockingCache`: per-key lock held from a miss until the value arrives
//!
//! [`CacheBuilder`] assembles the standard chain. [`TransactionalCache`] and
//! [`TransactionalCacheManager`] buffer writes per unit of work.

pub mod blocking;
pub mod builder;
pub mod fifo;
pub mod key;
pub mod logging;
pub mod lru;
pub mod perpetual;
pub mod scheduled;
pub mod serialized;
pub mod soft;
pub mod synchronized;
pub mod transactional;
pub mod weak;

pub use blocking::BlockingCache;
pub use builder::{CacheBuilder, CacheOptions, Eviction};
pub use fifo::FifoCache;
pub use key::CacheKey;
pub use logging::LoggingCache;
pub use lru::LruCache;
pub use perpetual::PerpetualCache;
pub use scheduled::ScheduledCache;
pub use serialized::SerializedCache;
pub use soft::SoftCache;
pub use synchronized::SynchronizedCache;
pub use transactional::{TransactionalCache, TransactionalCacheManager};
pub use weak::WeakCache;

use crate::error::DbResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies who holds a key lock in a [`BlockingCache`].
///
/// Only the owner that took a lock on a miss can release it. Unit-of-work
/// buffers carry their own token; plain [`Cache`] calls act as the current
/// tokio task, or as [`LockOwner::Unscoped`] outside of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockOwner {
    Token(u64),
    Task(tokio::task::Id),
    Unscoped,
}

impl LockOwner {
    /// A fresh token, distinct from every other owner.
    pub fn token() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self::Token(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn current() -> Self {
        tokio::task::try_id().map_or(Self::Unscoped, Self::Task)
    }
}

/// A value held by a cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheValue {
    /// Mapped result list of a query.
    Rows(Arc<Vec<JsonValue>>),
    /// Bytes written by [`SerializedCache`].
    Serialized(Vec<u8>),
    /// Marks a first-level cache entry whose query is still executing.
    ExecutionPlaceholder,
    /// Explicitly empty entry. Reads as a miss but occupies a slot.
    Null,
}

impl CacheValue {
    pub fn rows(rows: Vec<JsonValue>) -> Self {
        Self::Rows(Arc::new(rows))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The result list, if this is a real value.
    pub fn as_rows(&self) -> Option<&Arc<Vec<JsonValue>>> {
        match self {
            Self::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

/// A named key/value store.
///
/// Implementations must be safe to share across tasks. `get_object` returns
/// `None` both for absent keys and for keys holding [`CacheValue::Null`].
#[async_trait]
pub trait Cache: Send + Sync + std::fmt::Debug {
    /// Namespace this cache belongs to.
    fn id(&self) -> &str;

    async fn put_object(&self, key: CacheKey, value: CacheValue) -> DbResult<()>;

    async fn get_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>>;

    /// Remove an entry. Blocking caches also use this to release a key lock
    /// without storing anything.
    async fn remove_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>>;

    async fn clear(&self) -> DbResult<()>;

    /// Number of stored entries, including `Null` entries.
    async fn size(&self) -> usize;

    /// `get_object` on behalf of `owner`; a lock taken on a miss belongs to it.
    async fn get_object_for(
        &self,
        _owner: LockOwner,
        key: &CacheKey,
    ) -> DbResult<Option<CacheValue>> {
        self.get_object(key).await
    }

    /// `put_object` on behalf of `owner`; releases the key lock only if
    /// `owner` holds it.
    async fn put_object_for(
        &self,
        _owner: LockOwner,
        key: CacheKey,
        value: CacheValue,
    ) -> DbResult<()> {
        self.put_object(key, value).await
    }

    /// `remove_object` on behalf of `owner`.
    async fn remove_object_for(
        &self,
        _owner: LockOwner,
        key: &CacheKey,
    ) -> DbResult<Option<CacheValue>> {
        self.remove_object(key).await
    }

    /// Drop every key lock `owner` still holds. Must not block.
    fn release_locks_of(&self, _owner: LockOwner) {}
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn key(n: i64) -> CacheKey {
        CacheKey::from_values([n])
    }

    pub fn value(n: i64) -> CacheValue {
        CacheValue::rows(vec![serde_json::json!(n)])
    }
}
