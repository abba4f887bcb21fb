//! Copy-on-write and copy-on-read through serialization.
//!
//! Callers of a read-write namespace cache each get their own copy of a cached
//! result, so mutating one never leaks into another session.

use crate::cache::{Cache, CacheKey, CacheValue};
use crate::error::{DbError, DbResult};
use async_trait::async_trait;

#[derive(Debug)]
pub struct SerializedCache {
    delegate: Box<dyn Cache>,
}

impl SerializedCache {
    pub fn new(delegate: Box<dyn Cache>) -> Self {
        Self { delegate }
    }

    fn serialize(&self, value: &CacheValue) -> DbResult<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| DbError::cache(self.id(), format!("Failed to serialize value: {}", e)))
    }

    fn deserialize(&self, value: CacheValue) -> DbResult<CacheValue> {
        match value {
            CacheValue::Serialized(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                DbError::cache(self.id(), format!("Failed to deserialize value: {}", e))
            }),
            other => Err(DbError::cache(
                self.id(),
                format!("Expected serialized value, found {:?}", other),
            )),
        }
    }
}

#[async_trait]
impl Cache for SerializedCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put_object(&self, key: CacheKey, value: CacheValue) -> DbResult<()> {
        let stored = match value {
            CacheValue::Null => CacheValue::Null,
            other => CacheValue::Serialized(self.serialize(&other)?),
        };
        self.delegate.put_object(key, stored).await
    }

    async fn get_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        match self.delegate.get_object(key).await? {
            Some(value) => self.deserialize(value).map(Some),
            None => Ok(None),
        }
    }

    async fn remove_object(&self, key: &CacheKey) -> DbResult<Option<CacheValue>> {
        match self.delegate.remove_object(key).await? {
            Some(CacheValue::Null) | None => Ok(None),
            Some(value) => self.deserialize(value).map(Some),
        }
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
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reads_return_fresh_copies() {
        let cache = SerializedCache::new(Box::new(PerpetualCache::new("ser")));
        cache.put_object(key(1), value(1)).await.unwrap();

        let first = cache.get_object(&key(1)).await.unwrap().unwrap();
        let second = cache.get_object(&key(1)).await.unwrap().unwrap();
        assert_eq!(first, second);

        let (a, b) = (first.as_rows().unwrap(), second.as_rows().unwrap());
        assert!(!Arc::ptr_eq(a, b));
    }

    #[tokio::test]
    async fn test_delegate_holds_bytes() {
        let inner = PerpetualCache::new("ser");
        inner
            .put_object(key(1), CacheValue::Serialized(b"not json".to_vec()))
            .await
            .unwrap();
        let cache = SerializedCache::new(Box::new(inner));
        assert!(matches!(
            cache.get_object(&key(1)).await,
            Err(DbError::Cache { .. })
        ));
    }
}
