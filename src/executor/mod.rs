//! Statement executors.
//!
//! An executor turns a logical statement execution into physical statement
//! executions on its transaction's connection:
//! - `BaseExecutor` owns the session cache, the OUT-parameter cache, the
//!   query-stack depth and the deferred-load queue, and delegates physical
//!   work to an [`ExecutionStrategy`]
//! - `SimpleStrategy` prepares and closes a statement per call
//! - `ReuseStrategy` keeps statements by SQL until the next flush
//! - `BatchStrategy` coalesces updates and executes them on flush
//! - `CachingExecutor` decorates any executor with a second-level cache

mod base;
mod batch;
mod caching;
mod reuse;
mod simple;

pub use base::{BaseExecutor, ExecutionStrategy, ExecutorSettings};
pub use batch::BatchStrategy;
pub use caching::CachingExecutor;
pub use reuse::ReuseStrategy;
pub use simple::SimpleStrategy;

use crate::cache::CacheKey;
use crate::error::DbResult;
use crate::models::{BatchResult, BoundSql, MappedStatement, RowBounds, UpdateOutcome};
use crate::sync::lock;
use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Physical execution strategy of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorType {
    #[default]
    Simple,
    Reuse,
    Batch,
}

impl fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Reuse => write!(f, "reuse"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

/// Receives a nested result list once the query it depends on has
/// finished. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct DeferredValue {
    inner: Arc<Mutex<Option<Arc<Vec<JsonValue>>>>>,
}

impl DeferredValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<Vec<JsonValue>>> {
        lock(&self.inner).clone()
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.inner).is_some()
    }

    pub(crate) fn set(&self, rows: Arc<Vec<JsonValue>>) {
        *lock(&self.inner) = Some(rows);
    }
}

/// Executes mapped statements for one unit of work.
///
/// Every operation fails with a closed error once `close()` has run.
#[async_trait]
pub trait Executor: Send {
    /// Run an insert, update or delete. OUT values of callables are
    /// written back into `bound`.
    async fn update(&mut self, ms: &MappedStatement, bound: &mut BoundSql)
    -> DbResult<UpdateOutcome>;

    async fn query(
        &mut self,
        ms: &MappedStatement,
        bound: &mut BoundSql,
        row_bounds: RowBounds,
    ) -> DbResult<Arc<Vec<JsonValue>>> {
        let key = self.create_cache_key(ms, bound, row_bounds)?;
        self.query_with_key(ms, bound, row_bounds, key).await
    }

    async fn query_with_key(
        &mut self,
        ms: &MappedStatement,
        bound: &mut BoundSql,
        row_bounds: RowBounds,
        key: CacheKey,
    ) -> DbResult<Arc<Vec<JsonValue>>>;

    async fn flush_statements(&mut self) -> DbResult<Vec<BatchResult>>;

    async fn commit(&mut self, required: bool) -> DbResult<()>;

    async fn rollback(&mut self, required: bool) -> DbResult<()>;

    fn create_cache_key(
        &self,
        ms: &MappedStatement,
        bound: &BoundSql,
        row_bounds: RowBounds,
    ) -> DbResult<CacheKey>;

    /// Whether the session cache holds `key`, including queries still
    /// executing.
    fn is_cached(&self, ms: &MappedStatement, key: &CacheKey) -> bool;

    fn clear_local_cache(&mut self);

    /// Fill `target` with the result cached under `key`, now if available,
    /// otherwise once the outermost query returns.
    fn defer_load(&mut self, key: CacheKey, target: DeferredValue) -> DbResult<()>;

    /// Roll back (when forced), release statements and return the
    /// connection. Secondary errors are logged, not returned.
    async fn close(&mut self, force_rollback: bool);

    fn is_closed(&self) -> bool;
}
