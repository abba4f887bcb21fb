//! Shared executor protocol: session cache, OUT-parameter cache, query-stack
//! depth and deferred loads.

use crate::cache::{CacheKey, CacheValue, PerpetualCache};
use crate::db::driver::{Connection, StatementId};
use crate::db::transaction::Transaction;
use crate::error::{DbError, DbResult};
use crate::executor::{
    BatchStrategy, DeferredValue, Executor, ExecutorType, ReuseStrategy, SimpleStrategy,
};
use crate::models::{
    BatchResult, BoundSql, LocalCacheScope, MappedStatement, QueryParam, Row, RowBounds,
    StatementType, UpdateOutcome,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Physical statement handling plugged into a [`BaseExecutor`].
#[async_trait]
pub trait ExecutionStrategy: Send + fmt::Debug {
    async fn do_update(
        &mut self,
        tx: &mut Transaction,
        ms: &MappedStatement,
        bound: &mut BoundSql,
    ) -> DbResult<UpdateOutcome>;

    /// Fetch raw rows. Callables write their OUT values into `bound`.
    async fn do_query(
        &mut self,
        tx: &mut Transaction,
        ms: &MappedStatement,
        bound: &mut BoundSql,
    ) -> DbResult<Vec<Row>>;

    /// Execute or discard pending work and close cached statements.
    async fn do_flush_statements(
        &mut self,
        tx: &mut Transaction,
        is_rollback: bool,
    ) -> DbResult<Vec<BatchResult>>;
}

/// Per-session executor settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub local_cache_scope: LocalCacheScope,
    /// Appended to every cache key when set.
    pub environment_id: Option<String>,
}

#[derive(Debug)]
struct DeferredLoad {
    key: CacheKey,
    target: DeferredValue,
}

impl DeferredLoad {
    fn can_load(&self, cache: &PerpetualCache) -> bool {
        matches!(cache.get(&self.key), Some(CacheValue::Rows(_)))
    }

    fn load(&self, cache: &PerpetualCache) {
        if let Some(CacheValue::Rows(rows)) = cache.get(&self.key) {
            self.target.set(rows);
        }
    }
}

pub struct BaseExecutor {
    transaction: Transaction,
    strategy: Box<dyn ExecutionStrategy>,
    settings: ExecutorSettings,
    local_cache: PerpetualCache,
    local_output_cache: HashMap<CacheKey, Vec<QueryParam>>,
    deferred_loads: VecDeque<DeferredLoad>,
    query_stack: usize,
    closed: bool,
}

impl fmt::Debug for BaseExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseExecutor")
            .field("strategy", &self.strategy)
            .field("settings", &self.settings)
            .field("local_cache_size", &self.local_cache.len())
            .field("query_stack", &self.query_stack)
            .field("closed", &self.closed)
            .finish()
    }
}

impl BaseExecutor {
    pub fn new(executor_type: ExecutorType, transaction: Transaction, settings: ExecutorSettings) -> Self {
        let strategy: Box<dyn ExecutionStrategy> = match executor_type {
            ExecutorType::Simple => Box::new(SimpleStrategy::new()),
            ExecutorType::Reuse => Box::new(ReuseStrategy::new()),
            ExecutorType::Batch => Box::new(BatchStrategy::new()),
        };
        Self::with_strategy(transaction, strategy, settings)
    }

    pub fn with_strategy(
        transaction: Transaction,
        strategy: Box<dyn ExecutionStrategy>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            transaction,
            strategy,
            settings,
            local_cache: PerpetualCache::new("LocalCache"),
            local_output_cache: HashMap::new(),
            deferred_loads: VecDeque::new(),
            query_stack: 0,
            closed: false,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Number of entries in the session cache.
    pub fn local_cache_size(&self) -> usize {
        self.local_cache.len()
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.closed {
            return Err(DbError::closed("Executor"));
        }
        Ok(())
    }

    fn restore_output_parameters(&self, ms: &MappedStatement, key: &CacheKey, bound: &mut BoundSql) {
        if ms.statement_type == StatementType::Callable {
            if let Some(values) = self.local_output_cache.get(key) {
                bound.set_out_values(values);
            }
        }
    }

    async fn query_from_database(
        &mut self,
        ms: &MappedStatement,
        bound: &mut BoundSql,
        row_bounds: RowBounds,
        key: CacheKey,
    ) -> DbResult<Arc<Vec<JsonValue>>> {
        self.local_cache
            .put(key.clone(), CacheValue::ExecutionPlaceholder);
        let result = self.fetch_and_map(ms, bound, row_bounds).await;
        self.local_cache.remove(&key);

        let rows = Arc::new(result?);
        self.local_cache
            .put(key.clone(), CacheValue::Rows(Arc::clone(&rows)));
        if ms.statement_type == StatementType::Callable {
            self.local_output_cache.insert(key, bound.out_values());
        }
        Ok(rows)
    }

    async fn fetch_and_map(
        &mut self,
        ms: &MappedStatement,
        bound: &mut BoundSql,
        row_bounds: RowBounds,
    ) -> DbResult<Vec<JsonValue>> {
        let rows = self
            .strategy
            .do_query(&mut self.transaction, ms, bound)
            .await?;
        let rows = row_bounds.apply(rows);
        let mapper = Arc::clone(&ms.result_mapper);
        mapper.map_rows(self, rows).await
    }

    fn drain_deferred_loads(&mut self) {
        while let Some(load) = self.deferred_loads.pop_front() {
            load.load(&self.local_cache);
        }
    }
}

#[async_trait]
impl Executor for BaseExecutor {
    async fn update(&mut self, ms: &MappedStatement, bound: &mut BoundSql) -> DbResult<UpdateOutcome> {
        self.ensure_open()?;
        debug!(statement_id = %ms.id, command = %ms.command_type, "Executing update");
        self.clear_local_cache();
        self.strategy
            .do_update(&mut self.transaction, ms, bound)
            .await
    }

    async fn query_with_key(
        &mut self,
        ms: &MappedStatement,
        bound: &mut BoundSql,
        row_bounds: RowBounds,
        key: CacheKey,
    ) -> DbResult<Arc<Vec<JsonValue>>> {
        self.ensure_open()?;
        debug!(statement_id = %ms.id, depth = self.query_stack, "Executing query");
        if self.query_stack == 0 && ms.flush_cache_required {
            self.clear_local_cache();
        }

        self.query_stack += 1;
        let result = match self.local_cache.get(&key) {
            Some(CacheValue::Rows(rows)) => {
                debug!(statement_id = %ms.id, "Session cache hit");
                self.restore_output_parameters(ms, &key, bound);
                Ok(rows)
            }
            Some(CacheValue::ExecutionPlaceholder) => Err(DbError::invalid_input(format!(
                "Query '{}' is already executing for this key; use defer_load for circular references",
                ms.id
            ))),
            _ => self.query_from_database(ms, bound, row_bounds, key).await,
        };
        self.query_stack -= 1;

        let rows = result?;
        if self.query_stack == 0 {
            self.drain_deferred_loads();
            if self.settings.local_cache_scope == LocalCacheScope::Statement {
                self.clear_local_cache();
            }
        }
        Ok(rows)
    }

    async fn flush_statements(&mut self) -> DbResult<Vec<BatchResult>> {
        self.ensure_open()?;
        self.strategy
            .do_flush_statements(&mut self.transaction, false)
            .await
    }

    async fn commit(&mut self, required: bool) -> DbResult<()> {
        self.ensure_open()?;
        self.clear_local_cache();
        self.strategy
            .do_flush_statements(&mut self.transaction, false)
            .await?;
        if required {
            self.transaction.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self, required: bool) -> DbResult<()> {
        self.ensure_open()?;
        self.clear_local_cache();
        let flushed = self
            .strategy
            .do_flush_statements(&mut self.transaction, true)
            .await;
        let rolled_back = if required {
            self.transaction.rollback().await
        } else {
            Ok(())
        };
        flushed.and(rolled_back)
    }

    fn create_cache_key(
        &self,
        ms: &MappedStatement,
        bound: &BoundSql,
        row_bounds: RowBounds,
    ) -> DbResult<CacheKey> {
        self.ensure_open()?;
        let mut key = CacheKey::new();
        key.update(ms.id.as_str());
        key.update(row_bounds.offset);
        key.update(row_bounds.limit);
        key.update(bound.sql.as_str());
        for binding in bound.bindings.iter().filter(|b| b.mode.is_input()) {
            key.update(binding.value.clone());
        }
        if let Some(env) = &self.settings.environment_id {
            key.update(env.as_str());
        }
        Ok(key)
    }

    fn is_cached(&self, _ms: &MappedStatement, key: &CacheKey) -> bool {
        self.local_cache.contains(key)
    }

    fn clear_local_cache(&mut self) {
        if !self.closed {
            self.local_cache.clear_all();
            self.local_output_cache.clear();
        }
    }

    fn defer_load(&mut self, key: CacheKey, target: DeferredValue) -> DbResult<()> {
        self.ensure_open()?;
        let load = DeferredLoad { key, target };
        if load.can_load(&self.local_cache) {
            load.load(&self.local_cache);
        } else {
            self.deferred_loads.push_back(load);
        }
        Ok(())
    }

    async fn close(&mut self, force_rollback: bool) {
        if self.closed {
            return;
        }
        if let Err(e) = self.rollback(force_rollback).await {
            warn!(error = %e, "Rollback on close failed");
        }
        if let Err(e) = self.transaction.close().await {
            warn!(error = %e, "Closing transaction failed");
        }
        self.local_cache.clear_all();
        self.local_output_cache.clear();
        self.deferred_loads.clear();
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Run a query on a prepared statement. Callables with OUT parameters go
/// through `call` and write their OUT values into `bound`.
pub(super) async fn execute_query(
    conn: &mut dyn Connection,
    statement: StatementId,
    ms: &MappedStatement,
    bound: &mut BoundSql,
) -> DbResult<Vec<Row>> {
    let params = bound.bind_values();
    if ms.statement_type == StatementType::Callable && bound.has_out_params() {
        let out_count = bound.bindings.iter().filter(|b| b.mode.is_output()).count();
        let result = conn.call(statement, &params, out_count).await?;
        bound.set_out_values(&result.out_values);
        return Ok(result.rows);
    }
    conn.query(statement, &params).await
}

/// Run an update on a prepared statement. A callable with OUT parameters
/// reports zero affected rows.
pub(super) async fn execute_update(
    conn: &mut dyn Connection,
    statement: StatementId,
    ms: &MappedStatement,
    bound: &mut BoundSql,
) -> DbResult<u64> {
    let params = bound.bind_values();
    if ms.statement_type == StatementType::Callable && bound.has_out_params() {
        let out_count = bound.bindings.iter().filter(|b| b.mode.is_output()).count();
        let result = conn.call(statement, &params, out_count).await?;
        bound.set_out_values(&result.out_values);
        return Ok(0);
    }
    conn.update(statement, &params).await
}

/// Close a statement, logging failures.
pub(super) async fn close_statement(conn: &mut dyn Connection, statement: StatementId) {
    if let Err(e) = conn.close_statement(statement).await {
        debug!(statement, error = %e, "Closing statement failed");
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::transaction;
    use super::*;
    use crate::db::memory::MemoryDriver;
    use crate::models::{ParameterMode, SqlCommandType, StaticSqlSource};
    use crate::models::ResultMapper;
    use serde_json::json;

    const SELECT_USER: &str = "SELECT * FROM users WHERE id = ?";

    fn driver() -> MemoryDriver {
        MemoryDriver::new().with_rows(SELECT_USER, vec![json!({"id": 1, "name": "ann"})])
    }

    fn executor(driver: &MemoryDriver, scope: LocalCacheScope) -> BaseExecutor {
        BaseExecutor::new(
            ExecutorType::Simple,
            transaction(driver, false),
            ExecutorSettings {
                local_cache_scope: scope,
                environment_id: None,
            },
        )
    }

    fn select_user() -> MappedStatement {
        MappedStatement::select("users.find", StaticSqlSource::new(SELECT_USER).with_param("id"))
    }

    fn bound(ms: &MappedStatement, id: i64) -> BoundSql {
        ms.bound_sql(&json!({"id": id})).unwrap()
    }

    #[tokio::test]
    async fn test_session_cache_hit_then_miss_after_clear() {
        let driver = driver();
        let mut exec = executor(&driver, LocalCacheScope::Session);
        let ms = select_user();

        let first = exec
            .query(&ms, &mut bound(&ms, 1), RowBounds::default())
            .await
            .unwrap();
        let second = exec
            .query(&ms, &mut bound(&ms, 1), RowBounds::default())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(driver.stats().queries, 1);

        exec.clear_local_cache();
        exec.query(&ms, &mut bound(&ms, 1), RowBounds::default())
            .await
            .unwrap();
        assert_eq!(driver.stats().queries, 2);
    }

    #[tokio::test]
    async fn test_different_parameters_miss() {
        let driver = driver();
        let mut exec = executor(&driver, LocalCacheScope::Session);
        let ms = select_user();

        exec.query(&ms, &mut bound(&ms, 1), RowBounds::default())
            .await
            .unwrap();
        exec.query(&ms, &mut bound(&ms, 2), RowBounds::default())
            .await
            .unwrap();
        assert_eq!(driver.stats().queries, 2);
        assert_eq!(exec.local_cache_size(), 2);
    }

    #[tokio::test]
    async fn test_statement_scope_clears_after_each_query() {
        let driver = driver();
        let mut exec = executor(&driver, LocalCacheScope::Statement);
        let ms = select_user();

        for _ in 0..2 {
            exec.query(&ms, &mut bound(&ms, 1), RowBounds::default())
                .await
                .unwrap();
        }
        assert_eq!(driver.stats().queries, 2);
        assert_eq!(exec.local_cache_size(), 0);
    }

    #[tokio::test]
    async fn test_update_clears_session_cache() {
        let driver = driver();
        let mut exec = executor(&driver, LocalCacheScope::Session);
        let ms = select_user();
        let update = MappedStatement::new(
            "users.rename",
            SqlCommandType::Update,
            StaticSqlSource::new("UPDATE users SET name = 'bob'"),
        );

        exec.query(&ms, &mut bound(&ms, 1), RowBounds::default())
            .await
            .unwrap();
        let outcome = exec
            .update(&update, &mut update.bound_sql(&json!({})).unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Affected(1));
        exec.query(&ms, &mut bound(&ms, 1), RowBounds::default())
            .await
            .unwrap();
        assert_eq!(driver.stats().queries, 2);
    }

    #[tokio::test]
    async fn test_flush_cache_select_always_executes() {
        let driver = driver();
        let mut exec = executor(&driver, LocalCacheScope::Session);
        let ms = select_user().with_flush_cache(true);

        for _ in 0..2 {
            exec.query(&ms, &mut bound(&ms, 1), RowBounds::default())
                .await
                .unwrap();
        }
        assert_eq!(driver.stats().queries, 2);
    }

    #[tokio::test]
    async fn test_row_bounds_are_applied_and_keyed() {
        let sql = "SELECT n FROM numbers";
        let driver = MemoryDriver::new().with_rows(sql, (0..10).map(|n| json!({"n": n})).collect());
        let mut exec = executor(&driver, LocalCacheScope::Session);
        let ms = MappedStatement::select("numbers.all", StaticSqlSource::new(sql));

        let page = exec
            .query(&ms, &mut BoundSql::plain(sql), RowBounds::new(2, 3))
            .await
            .unwrap();
        let ns: Vec<i64> = page.iter().filter_map(|r| r["n"].as_i64()).collect();
        assert_eq!(ns, vec![2, 3, 4]);

        let all = exec
            .query(&ms, &mut BoundSql::plain(sql), RowBounds::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(driver.stats().queries, 2);
    }

    #[tokio::test]
    async fn test_environment_id_is_part_of_the_key() {
        let driver = driver();
        let ms = select_user();
        let plain = executor(&driver, LocalCacheScope::Session);
        let with_env = BaseExecutor::new(
            ExecutorType::Simple,
            transaction(&driver, false),
            ExecutorSettings {
                local_cache_scope: LocalCacheScope::Session,
                environment_id: Some("prod".into()),
            },
        );
        let b = bound(&ms, 1);
        let a = plain.create_cache_key(&ms, &b, RowBounds::default()).unwrap();
        let e = with_env.create_cache_key(&ms, &b, RowBounds::default()).unwrap();
        assert_ne!(a, e);
        assert_eq!(e.update_count(), a.update_count() + 1);
    }

    #[tokio::test]
    async fn test_cached_output_parameters_are_restored() {
        let sql = "CALL next_id(?, ?)";
        let driver = MemoryDriver::new().with_out_values(sql, vec![QueryParam::Int(42)]);
        let mut exec = executor(&driver, LocalCacheScope::Session);
        let ms = MappedStatement::select(
            "ids.next",
            StaticSqlSource::new(sql)
                .with_param("seq")
                .with_mode("id", ParameterMode::Out),
        )
        .with_statement_type(StatementType::Callable);

        let mut first = ms.bound_sql(&json!({"seq": "users"})).unwrap();
        exec.query(&ms, &mut first, RowBounds::default()).await.unwrap();
        assert_eq!(first.out_values(), vec![QueryParam::Int(42)]);

        let mut second = ms.bound_sql(&json!({"seq": "users"})).unwrap();
        exec.query(&ms, &mut second, RowBounds::default()).await.unwrap();
        assert_eq!(second.out_values(), vec![QueryParam::Int(42)]);
        assert_eq!(driver.stats().calls, 1);
    }

    /// Maps each row and loads `child` for it through the executor.
    #[derive(Debug)]
    struct WithOrders {
        child: MappedStatement,
    }

    #[async_trait]
    impl ResultMapper for WithOrders {
        async fn map_rows(
            &self,
            executor: &mut dyn Executor,
            rows: Vec<Row>,
        ) -> DbResult<Vec<JsonValue>> {
            let mut mapped = Vec::new();
            for mut row in rows {
                let id = row.get("id").cloned().unwrap_or(JsonValue::Null);
                let mut bound = self.child.bound_sql(&json!({"user_id": id}))?;
                let orders = executor
                    .query(&self.child, &mut bound, RowBounds::default())
                    .await?;
                row.insert("orders".into(), JsonValue::Array(orders.to_vec()));
                mapped.push(JsonValue::Object(row));
            }
            Ok(mapped)
        }
    }

    #[tokio::test]
    async fn test_nested_query_through_executor() {
        let orders_sql = "SELECT * FROM orders WHERE user_id = ?";
        let driver = driver().with_rows(orders_sql, vec![json!({"order": 7})]);
        let mut exec = executor(&driver, LocalCacheScope::Statement);
        let child = MappedStatement::select(
            "orders.by_user",
            StaticSqlSource::new(orders_sql).with_param("user_id"),
        );
        let ms = select_user().with_result_mapper(Arc::new(WithOrders { child }));

        let rows = exec
            .query(&ms, &mut bound(&ms, 1), RowBounds::default())
            .await
            .unwrap();
        assert_eq!(rows[0]["orders"][0]["order"], 7);
        assert_eq!(driver.stats().queries, 2);
        // statement scope clears only once the outermost query is done
        assert_eq!(exec.local_cache_size(), 0);
    }

    /// Defers a load of the statement's own key, which is still executing.
    #[derive(Debug)]
    struct SelfReference {
        target: DeferredValue,
    }

    #[async_trait]
    impl ResultMapper for SelfReference {
        async fn map_rows(
            &self,
            executor: &mut dyn Executor,
            rows: Vec<Row>,
        ) -> DbResult<Vec<JsonValue>> {
            let ms = select_user();
            let b = ms.bound_sql(&json!({"id": 1}))?;
            let key = executor.create_cache_key(&ms, &b, RowBounds::default())?;
            assert!(executor.is_cached(&ms, &key));
            executor.defer_load(key, self.target.clone())?;
            assert!(!self.target.is_loaded());
            Ok(rows.into_iter().map(JsonValue::Object).collect())
        }
    }

    #[tokio::test]
    async fn test_deferred_load_drains_after_outermost_query() {
        let driver = driver();
        let mut exec = executor(&driver, LocalCacheScope::Session);
        let target = DeferredValue::new();
        let ms = select_user().with_result_mapper(Arc::new(SelfReference {
            target: target.clone(),
        }));

        exec.query(&ms, &mut bound(&ms, 1), RowBounds::default())
            .await
            .unwrap();
        let loaded = target.get().unwrap();
        assert_eq!(loaded[0]["name"], "ann");
    }

    #[tokio::test]
    async fn test_defer_load_of_cached_key_is_immediate() {
        let driver = driver();
        let mut exec = executor(&driver, LocalCacheScope::Session);
        let ms = select_user();
        let b = bound(&ms, 1);
        let key = exec.create_cache_key(&ms, &b, RowBounds::default()).unwrap();
        exec.query_with_key(&ms, &mut b.clone(), RowBounds::default(), key.clone())
            .await
            .unwrap();

        let target = DeferredValue::new();
        exec.defer_load(key, target.clone()).unwrap();
        assert!(target.is_loaded());
    }

    #[tokio::test]
    async fn test_failed_query_leaves_no_placeholder() {
        let driver = driver();
        driver.fail_on(SELECT_USER);
        let mut exec = executor(&driver, LocalCacheScope::Session);
        let ms = select_user();

        let err = exec
            .query(&ms, &mut bound(&ms, 1), RowBounds::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Database { .. }));
        assert_eq!(exec.local_cache_size(), 0);
        // the statement is closed even though execution failed
        assert_eq!(driver.stats().statement_closes, 1);
    }

    #[tokio::test]
    async fn test_commit_and_rollback_follow_required_flag() {
        let driver = driver();
        let mut exec = executor(&driver, LocalCacheScope::Session);
        let ms = select_user();

        exec.query(&ms, &mut bound(&ms, 1), RowBounds::default())
            .await
            .unwrap();
        exec.commit(false).await.unwrap();
        assert_eq!(driver.stats().commits, 0);
        assert_eq!(exec.local_cache_size(), 0);

        exec.commit(true).await.unwrap();
        assert_eq!(driver.stats().commits, 1);

        exec.query(&ms, &mut bound(&ms, 1), RowBounds::default())
            .await
            .unwrap();
        exec.rollback(true).await.unwrap();
        assert_eq!(driver.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_closed_executor_rejects_everything() {
        let driver = driver();
        let mut exec = executor(&driver, LocalCacheScope::Session);
        let ms = select_user();
        exec.query(&ms, &mut bound(&ms, 1), RowBounds::default())
            .await
            .unwrap();

        exec.close(true).await;
        assert!(exec.is_closed());
        assert_eq!(driver.stats().rollbacks, 1);
        assert_eq!(driver.open_connections(), 0);

        let err = exec
            .query(&ms, &mut bound(&ms, 1), RowBounds::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Closed { .. }));
        assert!(exec.flush_statements().await.is_err());
        assert!(exec.commit(true).await.is_err());
        assert!(exec.defer_load(CacheKey::new(), DeferredValue::new()).is_err());

        // closing twice is harmless
        exec.close(false).await;
    }
}
