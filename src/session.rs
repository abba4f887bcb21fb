//! Caller-facing units of work.
//!
//! A [`Configuration`] holds mapped statements and namespace caches. A
//! [`SessionFactory`] pairs it with a data source and opens [`Session`]s;
//! each session owns one executor and one transaction.
//!
//! A session tracks whether it has written anything. `commit()` and
//! `rollback()` only reach the database when it has (or when forced), and
//! `close()` rolls back uncommitted writes.

use crate::cache::Cache;
use crate::config::DataSourceConfig;
use crate::db::driver::Driver;
use crate::db::pool::{DataSource, PooledDataSource, UnpooledDataSource};
use crate::db::transaction::Transaction;
use crate::error::{DbError, DbResult, ErrorContext};
use crate::executor::{BaseExecutor, CachingExecutor, Executor, ExecutorSettings, ExecutorType};
use crate::models::{
    BatchResult, LocalCacheScope, MappedStatement, RowBounds, SqlCommandType, UpdateOutcome,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Statement registry and session defaults.
#[derive(Debug, Clone)]
pub struct Configuration {
    statements: HashMap<String, Arc<MappedStatement>>,
    caches: HashMap<String, Arc<dyn Cache>>,
    cache_enabled: bool,
    local_cache_scope: LocalCacheScope,
    environment_id: Option<String>,
    default_executor_type: ExecutorType,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            statements: HashMap::new(),
            caches: HashMap::new(),
            cache_enabled: true,
            local_cache_scope: LocalCacheScope::Session,
            environment_id: None,
            default_executor_type: ExecutorType::Simple,
        }
    }
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable second-level caching for new sessions.
    #[must_use]
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_local_cache_scope(mut self, scope: LocalCacheScope) -> Self {
        self.local_cache_scope = scope;
        self
    }

    #[must_use]
    pub fn with_environment_id(mut self, id: impl Into<String>) -> Self {
        self.environment_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_default_executor_type(mut self, executor_type: ExecutorType) -> Self {
        self.default_executor_type = executor_type;
        self
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    pub fn local_cache_scope(&self) -> LocalCacheScope {
        self.local_cache_scope
    }

    pub fn default_executor_type(&self) -> ExecutorType {
        self.default_executor_type
    }

    pub fn add_cache(&mut self, cache: Arc<dyn Cache>) -> DbResult<()> {
        let id = cache.id().to_string();
        if self.caches.contains_key(&id) {
            return Err(DbError::invalid_input(format!(
                "Caches collection already contains value for {}",
                id
            )));
        }
        self.caches.insert(id, cache);
        Ok(())
    }

    pub fn cache(&self, id: &str) -> Option<Arc<dyn Cache>> {
        self.caches.get(id).cloned()
    }

    pub fn add_mapped_statement(&mut self, ms: MappedStatement) -> DbResult<()> {
        if self.statements.contains_key(&ms.id) {
            return Err(DbError::invalid_input(format!(
                "Mapped statements collection already contains value for {}",
                ms.id
            )));
        }
        self.statements.insert(ms.id.clone(), Arc::new(ms));
        Ok(())
    }

    pub fn has_statement(&self, id: &str) -> bool {
        self.statements.contains_key(id)
    }

    pub fn mapped_statement(&self, id: &str) -> DbResult<Arc<MappedStatement>> {
        self.statements
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::statement_not_found(id))
    }

    pub fn statement_ids(&self) -> impl Iterator<Item = &str> {
        self.statements.keys().map(String::as_str)
    }

    fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            local_cache_scope: self.local_cache_scope,
            environment_id: self.environment_id.clone(),
        }
    }
}

/// Opens sessions over one data source.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    configuration: Arc<Configuration>,
    data_source: Arc<dyn DataSource>,
}

impl SessionFactory {
    pub fn new(configuration: Configuration, data_source: Arc<dyn DataSource>) -> Self {
        Self {
            configuration: Arc::new(configuration),
            data_source,
        }
    }

    /// Build the data source described by `config` on `driver`. Pooled data
    /// sources spawn their eviction task here when one is configured.
    pub fn from_data_source_config(
        configuration: Configuration,
        driver: Arc<dyn Driver>,
        config: &DataSourceConfig,
    ) -> Self {
        let data_source: Arc<dyn DataSource> = if config.pooled {
            Arc::new(PooledDataSource::new(
                driver,
                config.connection.clone(),
                config.pool_options.clone(),
            ))
        } else {
            Arc::new(UnpooledDataSource::new(driver, config.connection.clone()))
        };
        Self::new(configuration, data_source)
    }

    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.data_source
    }

    pub fn open_session(&self, executor_type: ExecutorType, autocommit: bool) -> Session {
        let transaction = Transaction::new(Arc::clone(&self.data_source), autocommit);
        let base = BaseExecutor::new(
            executor_type,
            transaction,
            self.configuration.executor_settings(),
        );
        let executor: Box<dyn Executor> = if self.configuration.cache_enabled {
            Box::new(CachingExecutor::new(Box::new(base)))
        } else {
            Box::new(base)
        };
        debug!(%executor_type, autocommit, "Opened session");
        Session {
            configuration: Arc::clone(&self.configuration),
            executor,
            autocommit,
            dirty: false,
        }
    }

    /// Session with the configured executor type and manual commit.
    pub fn open_default_session(&self) -> Session {
        self.open_session(self.configuration.default_executor_type, false)
    }
}

/// One unit of work. Not shareable between tasks; open one per task.
pub struct Session {
    configuration: Arc<Configuration>,
    executor: Box<dyn Executor>,
    autocommit: bool,
    dirty: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("autocommit", &self.autocommit)
            .field("dirty", &self.dirty)
            .field("closed", &self.executor.is_closed())
            .finish()
    }
}

fn context(activity: &str, ms: &MappedStatement, sql: Option<&str>) -> ErrorContext {
    let mut context = ErrorContext::new().activity(activity).statement(&ms.id);
    if let Some(resource) = &ms.resource {
        context = context.resource(resource);
    }
    if let Some(sql) = sql {
        context = context.sql(sql);
    }
    context
}

/// Write `value` at a dotted property path, creating objects on the way.
fn write_property(target: &mut JsonValue, property: &str, value: JsonValue) {
    let mut current = target;
    let mut parts = property.split('.').peekable();
    while let Some(part) = parts.next() {
        if current.is_null() {
            *current = JsonValue::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            debug!(property, "Parameter is not an object; OUT value dropped");
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map.entry(part.to_string()).or_insert(JsonValue::Null);
    }
}

impl Session {
    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_closed(&self) -> bool {
        self.executor.is_closed()
    }

    fn is_commit_or_rollback_required(&self, force: bool) -> bool {
        (!self.autocommit && self.dirty) || force
    }

    pub async fn select_list(&mut self, id: &str, parameter: &JsonValue) -> DbResult<Vec<JsonValue>> {
        self.select_list_with_bounds(id, parameter, RowBounds::default())
            .await
    }

    pub async fn select_list_with_bounds(
        &mut self,
        id: &str,
        parameter: &JsonValue,
        row_bounds: RowBounds,
    ) -> DbResult<Vec<JsonValue>> {
        let ms = self.configuration.mapped_statement(id)?;
        let mut bound = ms
            .bound_sql(parameter)
            .map_err(|e| e.with_context(context("binding parameters", &ms, None)))?;
        let rows = self
            .executor
            .query(&ms, &mut bound, row_bounds)
            .await
            .map_err(|e| e.with_context(context("querying database", &ms, Some(&bound.sql))))?;
        Ok(Arc::unwrap_or_clone(rows))
    }

    /// At most one row; more is an error.
    pub async fn select_one(&mut self, id: &str, parameter: &JsonValue) -> DbResult<Option<JsonValue>> {
        let mut rows = self.select_list(id, parameter).await?;
        match rows.len() {
            0 | 1 => Ok(rows.pop()),
            count => Err(DbError::too_many_results(id, count)),
        }
    }

    pub async fn insert(&mut self, id: &str, parameter: &JsonValue) -> DbResult<UpdateOutcome> {
        self.update(id, parameter).await
    }

    pub async fn delete(&mut self, id: &str, parameter: &JsonValue) -> DbResult<UpdateOutcome> {
        self.update(id, parameter).await
    }

    pub async fn update(&mut self, id: &str, parameter: &JsonValue) -> DbResult<UpdateOutcome> {
        let ms = self.configuration.mapped_statement(id)?;
        self.dirty = true;
        let mut bound = ms
            .bound_sql(parameter)
            .map_err(|e| e.with_context(context("binding parameters", &ms, None)))?;
        self.executor
            .update(&ms, &mut bound)
            .await
            .map_err(|e| e.with_context(context("updating database", &ms, Some(&bound.sql))))
    }

    /// Run a callable statement and write its OUT values back into
    /// `parameter`. Select callables return their rows; others return none.
    pub async fn call(&mut self, id: &str, parameter: &mut JsonValue) -> DbResult<Vec<JsonValue>> {
        let ms = self.configuration.mapped_statement(id)?;
        let mut bound = ms
            .bound_sql(parameter)
            .map_err(|e| e.with_context(context("binding parameters", &ms, None)))?;

        let rows = if ms.command_type == SqlCommandType::Select {
            let rows = self
                .executor
                .query(&ms, &mut bound, RowBounds::default())
                .await
                .map_err(|e| e.with_context(context("calling procedure", &ms, Some(&bound.sql))))?;
            Arc::unwrap_or_clone(rows)
        } else {
            self.dirty = true;
            self.executor
                .update(&ms, &mut bound)
                .await
                .map_err(|e| e.with_context(context("calling procedure", &ms, Some(&bound.sql))))?;
            Vec::new()
        };

        for binding in bound.bindings.iter().filter(|b| b.mode.is_output()) {
            write_property(parameter, &binding.property, binding.value.to_json());
        }
        Ok(rows)
    }

    /// Execute pending batched statements.
    pub async fn flush_statements(&mut self) -> DbResult<Vec<BatchResult>> {
        self.executor
            .flush_statements()
            .await
            .map_err(|e| e.with_context(ErrorContext::new().activity("flushing statements")))
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        self.commit_with(false).await
    }

    /// Commit; `force` commits even when nothing was written.
    pub async fn commit_with(&mut self, force: bool) -> DbResult<()> {
        let required = self.is_commit_or_rollback_required(force);
        self.executor
            .commit(required)
            .await
            .map_err(|e| e.with_context(ErrorContext::new().activity("committing transaction")))?;
        self.dirty = false;
        Ok(())
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        self.rollback_with(false).await
    }

    pub async fn rollback_with(&mut self, force: bool) -> DbResult<()> {
        let required = self.is_commit_or_rollback_required(force);
        self.executor
            .rollback(required)
            .await
            .map_err(|e| e.with_context(ErrorContext::new().activity("rolling back transaction")))?;
        self.dirty = false;
        Ok(())
    }

    /// Clear the session cache.
    pub fn clear_cache(&mut self) {
        self.executor.clear_local_cache();
    }

    /// Roll back uncommitted writes and return the connection.
    pub async fn close(&mut self) {
        let force_rollback = self.is_commit_or_rollback_required(false);
        self.executor.close(force_rollback).await;
        self.dirty = false;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Staged cache writes are discarded and held cache key locks are
        // released as the executor drops. Pooled connections roll back on return.
        if !self.executor.is_closed() {
            warn!(dirty = self.dirty, "Session dropped without close()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDriver;
    use crate::models::{ConnectionSpec, ParameterMode, QueryParam, StatementType, StaticSqlSource};
    use serde_json::json;

    const SELECT: &str = "SELECT * FROM users WHERE team = ?";

    fn configuration() -> Configuration {
        let mut configuration = Configuration::new();
        configuration
            .add_mapped_statement(MappedStatement::select(
                "users.by_team",
                StaticSqlSource::new(SELECT).with_param("team"),
            ))
            .unwrap();
        configuration
            .add_mapped_statement(MappedStatement::new(
                "users.insert",
                SqlCommandType::Insert,
                StaticSqlSource::new("INSERT INTO users (name) VALUES (?)").with_param("name"),
            ))
            .unwrap();
        configuration
            .add_mapped_statement(
                MappedStatement::select(
                    "users.next_id",
                    StaticSqlSource::new("CALL next_id(?, ?)")
                        .with_param("seq")
                        .with_mode("result.id", ParameterMode::Out),
                )
                .with_statement_type(StatementType::Callable),
            )
            .unwrap();
        configuration
    }

    fn factory(driver: &MemoryDriver) -> SessionFactory {
        SessionFactory::new(
            configuration(),
            Arc::new(UnpooledDataSource::new(
                Arc::new(driver.clone()),
                ConnectionSpec::new("memory://test"),
            )),
        )
    }

    #[tokio::test]
    async fn test_select_one_rejects_many_rows() {
        let driver = MemoryDriver::new().with_rows(SELECT, vec![json!({"id": 1}), json!({"id": 2})]);
        let mut session = factory(&driver).open_default_session();

        let err = session
            .select_one("users.by_team", &json!({"team": "a"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::TooManyResults { count: 2, .. }));
        session.close().await;
    }

    #[tokio::test]
    async fn test_select_one_empty_is_none() {
        let driver = MemoryDriver::new();
        let mut session = factory(&driver).open_default_session();
        let row = session
            .select_one("users.by_team", &json!({"team": "a"}))
            .await
            .unwrap();
        assert!(row.is_none());
        session.close().await;
    }

    #[tokio::test]
    async fn test_unknown_statement() {
        let driver = MemoryDriver::new();
        let mut session = factory(&driver).open_default_session();
        let err = session.select_list("nope", &json!({})).await.unwrap_err();
        assert!(matches!(err, DbError::StatementNotFound { .. }));
        session.close().await;
    }

    #[tokio::test]
    async fn test_errors_carry_statement_context() {
        let driver = MemoryDriver::new();
        driver.fail_on(SELECT);
        let mut session = factory(&driver).open_default_session();

        let err = session
            .select_list("users.by_team", &json!({"team": "a"}))
            .await
            .unwrap_err();
        let context = err.context().unwrap();
        assert_eq!(context.statement_id.as_deref(), Some("users.by_team"));
        assert_eq!(context.sql.as_deref(), Some(SELECT));
        assert!(matches!(err.root(), DbError::Database { .. }));
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_rolls_back_dirty_session() {
        let driver = MemoryDriver::new();
        let mut session = factory(&driver).open_default_session();
        session
            .insert("users.insert", &json!({"name": "ann"}))
            .await
            .unwrap();
        assert!(session.is_dirty());
        session.close().await;

        let stats = driver.stats();
        assert_eq!((stats.begins, stats.commits, stats.rollbacks), (1, 0, 1));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_commit_only_when_dirty_unless_forced() {
        let driver = MemoryDriver::new();
        let mut session = factory(&driver).open_default_session();
        session
            .select_list("users.by_team", &json!({"team": "a"}))
            .await
            .unwrap();
        session.commit().await.unwrap();
        assert_eq!(driver.stats().commits, 0);

        session.commit_with(true).await.unwrap();
        assert_eq!(driver.stats().commits, 1);

        session
            .insert("users.insert", &json!({"name": "ann"}))
            .await
            .unwrap();
        session.commit().await.unwrap();
        assert_eq!(driver.stats().commits, 2);
        assert!(!session.is_dirty());
        session.close().await;
    }

    #[tokio::test]
    async fn test_call_writes_out_values_back() {
        let driver = MemoryDriver::new().with_out_values("CALL next_id(?, ?)", vec![QueryParam::Int(7)]);
        let factory = SessionFactory::new(
            configuration().with_cache_enabled(false),
            Arc::new(UnpooledDataSource::new(
                Arc::new(driver.clone()),
                ConnectionSpec::new("memory://test"),
            )),
        );
        let mut session = factory.open_default_session();

        let mut parameter = json!({"seq": "users"});
        session.call("users.next_id", &mut parameter).await.unwrap();
        assert_eq!(parameter["result"]["id"], 7);
        session.close().await;
    }

    #[test]
    fn test_duplicate_statement_rejected() {
        let mut configuration = configuration();
        let err = configuration
            .add_mapped_statement(MappedStatement::select(
                "users.by_team",
                StaticSqlSource::new(SELECT),
            ))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_write_property_nested_path() {
        let mut value = json!({"a": 1});
        write_property(&mut value, "b.c", json!(2));
        assert_eq!(value, json!({"a": 1, "b": {"c": 2}}));

        let mut scalar = json!(5);
        write_property(&mut scalar, "x", json!(1));
        assert_eq!(scalar, json!(5));
    }
}
