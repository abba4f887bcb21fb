//! Second-level (cross-session) caching.
//!
//! Reads consult the namespace cache through this session's
//! [`TransactionalCacheManager`]; writes are staged there and reach the
//! shared cache only on commit.

use crate::cache::{Cache, CacheKey, CacheValue, TransactionalCacheManager};
use crate::error::{DbError, DbResult};
use crate::executor::{DeferredValue, Executor};
use crate::models::{BatchResult, BoundSql, MappedStatement, RowBounds, StatementType, UpdateOutcome};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct CachingExecutor {
    delegate: Box<dyn Executor>,
    tcm: TransactionalCacheManager,
}

impl fmt::Debug for CachingExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingExecutor")
            .field("closed", &self.delegate.is_closed())
            .field("tcm", &self.tcm)
            .finish()
    }
}

impl CachingExecutor {
    pub fn new(delegate: Box<dyn Executor>) -> Self {
        Self {
            delegate,
            tcm: TransactionalCacheManager::new(),
        }
    }

    fn flush_cache_if_required(&mut self, ms: &MappedStatement) {
        if let Some(cache) = &ms.cache {
            if ms.flush_cache_required {
                debug!(statement_id = %ms.id, cache_id = %cache.id(), "Staging cache clear");
                self.tcm.clear(cache);
            }
        }
    }

    fn ensure_no_out_params(ms: &MappedStatement, bound: &BoundSql) -> DbResult<()> {
        if ms.statement_type == StatementType::Callable && bound.has_out_params() {
            return Err(DbError::invalid_input(format!(
                "Caching stored procedures with OUT params is not supported. \
                 Disable use_cache for statement '{}'",
                ms.id
            )));
        }
        Ok(())
    }

    async fn query_cached(
        &mut self,
        cache: &Arc<dyn Cache>,
        ms: &MappedStatement,
        bound: &mut BoundSql,
        row_bounds: RowBounds,
        key: CacheKey,
    ) -> DbResult<Arc<Vec<JsonValue>>> {
        Self::ensure_no_out_params(ms, bound)?;
        if let Some(CacheValue::Rows(rows)) = self.tcm.get_object(cache, &key).await? {
            debug!(statement_id = %ms.id, cache_id = %cache.id(), "Second-level cache hit");
            return Ok(rows);
        }
        let rows = self
            .delegate
            .query_with_key(ms, bound, row_bounds, key.clone())
            .await?;
        self.tcm
            .put_object(cache, key, CacheValue::Rows(Arc::clone(&rows)));
        Ok(rows)
    }
}

#[async_trait]
impl Executor for CachingExecutor {
    async fn update(&mut self, ms: &MappedStatement, bound: &mut BoundSql) -> DbResult<UpdateOutcome> {
        if self.delegate.is_closed() {
            return Err(DbError::closed("Executor"));
        }
        self.flush_cache_if_required(ms);
        self.delegate.update(ms, bound).await
    }

    async fn query_with_key(
        &mut self,
        ms: &MappedStatement,
        bound: &mut BoundSql,
        row_bounds: RowBounds,
        key: CacheKey,
    ) -> DbResult<Arc<Vec<JsonValue>>> {
        if self.delegate.is_closed() {
            return Err(DbError::closed("Executor"));
        }
        match ms.cache.clone() {
            Some(cache) => {
                self.flush_cache_if_required(ms);
                if ms.use_cache {
                    return self.query_cached(&cache, ms, bound, row_bounds, key).await;
                }
                self.delegate.query_with_key(ms, bound, row_bounds, key).await
            }
            None => self.delegate.query_with_key(ms, bound, row_bounds, key).await,
        }
    }

    async fn flush_statements(&mut self) -> DbResult<Vec<BatchResult>> {
        self.delegate.flush_statements().await
    }

    async fn commit(&mut self, required: bool) -> DbResult<()> {
        self.delegate.commit(required).await?;
        self.tcm.commit().await
    }

    async fn rollback(&mut self, required: bool) -> DbResult<()> {
        let result = self.delegate.rollback(required).await;
        if required {
            self.tcm.rollback().await;
        }
        result
    }

    fn create_cache_key(
        &self,
        ms: &MappedStatement,
        bound: &BoundSql,
        row_bounds: RowBounds,
    ) -> DbResult<CacheKey> {
        self.delegate.create_cache_key(ms, bound, row_bounds)
    }

    fn is_cached(&self, ms: &MappedStatement, key: &CacheKey) -> bool {
        self.delegate.is_cached(ms, key)
    }

    fn clear_local_cache(&mut self) {
        self.delegate.clear_local_cache();
    }

    fn defer_load(&mut self, key: CacheKey, target: DeferredValue) -> DbResult<()> {
        self.delegate.defer_load(key, target)
    }

    async fn close(&mut self, force_rollback: bool) {
        if self.delegate.is_closed() {
            return;
        }
        if force_rollback {
            self.tcm.rollback().await;
        } else if let Err(e) = self.tcm.commit().await {
            warn!(error = %e, "Committing second-level cache on close failed");
        }
        self.delegate.close(force_rollback).await;
    }

    fn is_closed(&self) -> bool {
        self.delegate.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBuilder, CacheOptions};
    use crate::db::memory::MemoryDriver;
    use crate::executor::base::test_support::transaction;
    use crate::executor::{BaseExecutor, ExecutorSettings, ExecutorType};
    use crate::models::{ParameterMode, SqlCommandType, StaticSqlSource};
    use serde_json::json;
    use std::time::Duration;

    const SELECT: &str = "SELECT * FROM users";

    fn caching(driver: &MemoryDriver) -> CachingExecutor {
        CachingExecutor::new(Box::new(BaseExecutor::new(
            ExecutorType::Simple,
            transaction(driver, false),
            ExecutorSettings::default(),
        )))
    }

    fn statements(cache: &Arc<dyn Cache>) -> (MappedStatement, MappedStatement) {
        let select = MappedStatement::select("users.all", StaticSqlSource::new(SELECT))
            .with_cache(Arc::clone(cache));
        let update = MappedStatement::new(
            "users.touch",
            SqlCommandType::Update,
            StaticSqlSource::new("UPDATE users SET seen = 1"),
        )
        .with_cache(Arc::clone(cache));
        (select, update)
    }

    async fn select_all(exec: &mut CachingExecutor, ms: &MappedStatement) -> Arc<Vec<JsonValue>> {
        exec.query(ms, &mut BoundSql::plain(SELECT), RowBounds::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_visible_to_other_sessions_only_after_commit() {
        let driver = MemoryDriver::new().with_rows(SELECT, vec![json!({"id": 1})]);
        let cache = CacheBuilder::new("users").build();
        let (select, _) = statements(&cache);

        let mut first = caching(&driver);
        let mut second = caching(&driver);

        select_all(&mut first, &select).await;
        select_all(&mut second, &select).await;
        assert_eq!(driver.stats().queries, 2);

        first.commit(true).await.unwrap();
        assert_eq!(cache.size().await, 1);

        let mut third = caching(&driver);
        let rows = select_all(&mut third, &select).await;
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(driver.stats().queries, 2);

        for exec in [&mut first, &mut second, &mut third] {
            exec.close(false).await;
        }
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_rows() {
        let driver = MemoryDriver::new().with_rows(SELECT, vec![json!({"id": 1})]);
        let cache = CacheBuilder::new("users").build();
        let (select, _) = statements(&cache);

        let mut exec = caching(&driver);
        select_all(&mut exec, &select).await;
        exec.rollback(true).await.unwrap();
        exec.commit(true).await.unwrap();
        assert_eq!(cache.size().await, 0);
        exec.close(false).await;
    }

    #[tokio::test]
    async fn test_update_clears_namespace_on_commit() {
        let driver = MemoryDriver::new().with_rows(SELECT, vec![json!({"id": 1})]);
        let cache = CacheBuilder::new("users").build();
        let (select, update) = statements(&cache);

        let mut exec = caching(&driver);
        select_all(&mut exec, &select).await;
        exec.commit(true).await.unwrap();
        assert_eq!(cache.size().await, 1);

        exec.update(&update, &mut BoundSql::plain("UPDATE users SET seen = 1"))
            .await
            .unwrap();
        // staged only
        assert_eq!(cache.size().await, 1);
        exec.commit(true).await.unwrap();
        assert_eq!(cache.size().await, 0);
        exec.close(false).await;
    }

    #[tokio::test]
    async fn test_close_without_force_commits_cache() {
        let driver = MemoryDriver::new().with_rows(SELECT, vec![json!({"id": 1})]);
        let cache = CacheBuilder::new("users").build();
        let (select, _) = statements(&cache);

        let mut exec = caching(&driver);
        select_all(&mut exec, &select).await;
        exec.close(false).await;
        assert_eq!(cache.size().await, 1);
        assert!(exec.is_closed());
        assert!(matches!(
            exec.query(&select, &mut BoundSql::plain(SELECT), RowBounds::default())
                .await,
            Err(DbError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn test_callable_with_out_params_rejected() {
        let driver = MemoryDriver::new();
        let cache = CacheBuilder::new("procs").build();
        let ms = MappedStatement::select(
            "procs.next",
            StaticSqlSource::new("CALL next_id(?)").with_mode("id", ParameterMode::Out),
        )
        .with_statement_type(StatementType::Callable)
        .with_cache(cache);

        let mut exec = caching(&driver);
        let mut bound = ms.bound_sql(&json!({})).unwrap();
        let err = exec
            .query(&ms, &mut bound, RowBounds::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        exec.close(true).await;
    }

    #[tokio::test]
    async fn test_blocking_cache_waiter_released_by_commit() {
        let driver = MemoryDriver::new().with_rows(SELECT, vec![json!({"id": 1})]);
        let options = CacheOptions {
            blocking: Some(true),
            ..Default::default()
        };
        let cache = CacheBuilder::from_options("users", &options).build();
        let (select, _) = statements(&cache);

        let mut producer = caching(&driver);
        select_all(&mut producer, &select).await;

        let waiter = {
            let driver = driver.clone();
            let select = select.clone();
            tokio::spawn(async move {
                let mut exec = caching(&driver);
                let rows = select_all(&mut exec, &select).await;
                exec.close(false).await;
                rows
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        producer.commit(true).await.unwrap();
        let rows = waiter.await.unwrap();
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(driver.stats().queries, 1);
        producer.close(false).await;
    }
}
