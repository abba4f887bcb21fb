//! Mapped statements and their resolved form.
//!
//! A `MappedStatement` is the registered, immutable description of one SQL
//! statement: how it is executed, whether it reads or writes, how its rows are
//! mapped and which namespace cache (if any) it participates in. Resolving it
//! against a parameter object yields a `BoundSql`.

use crate::cache::Cache;
use crate::error::{DbError, DbResult};
use crate::executor::Executor;
use crate::models::param::{ParameterBinding, ParameterMode, QueryParam};
use crate::models::result::Row;
use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;

/// How the statement is sent to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementType {
    /// Plain SQL text without parameters, executed unprepared.
    Statement,
    #[default]
    Prepared,
    /// Stored procedure call; may return OUT parameters.
    Callable,
}

/// What the statement does to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlCommandType {
    #[default]
    Unknown,
    Insert,
    Update,
    Delete,
    Select,
    Flush,
}

impl fmt::Display for SqlCommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Select => "select",
            Self::Flush => "flush",
        };
        write!(f, "{}", name)
    }
}

/// Lifetime of first-level cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LocalCacheScope {
    /// Entries live until the session commits, rolls back, updates or clears.
    #[default]
    Session,
    /// Entries are dropped as soon as the outermost query returns.
    Statement,
}

/// Offset/limit window applied to fetched rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBounds {
    pub offset: usize,
    pub limit: usize,
}

impl RowBounds {
    pub const NO_ROW_OFFSET: usize = 0;
    pub const NO_ROW_LIMIT: usize = i32::MAX as usize;

    pub const DEFAULT: RowBounds = RowBounds {
        offset: Self::NO_ROW_OFFSET,
        limit: Self::NO_ROW_LIMIT,
    };

    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn is_default(&self) -> bool {
        *self == Self::DEFAULT
    }

    /// Skip `offset` rows, then keep at most `limit`.
    pub fn apply<T>(&self, rows: Vec<T>) -> Vec<T> {
        if self.is_default() {
            return rows;
        }
        rows.into_iter().skip(self.offset).take(self.limit).collect()
    }
}

impl Default for RowBounds {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Resolved SQL text plus its ordered parameter bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundSql {
    pub sql: String,
    pub bindings: Vec<ParameterBinding>,
}

impl BoundSql {
    pub fn new(sql: impl Into<String>, bindings: Vec<ParameterBinding>) -> Self {
        Self {
            sql: sql.into(),
            bindings,
        }
    }

    /// SQL without parameters.
    pub fn plain(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }

    /// Values in binding order. OUT parameters are bound as NULL.
    pub fn bind_values(&self) -> Vec<QueryParam> {
        self.bindings
            .iter()
            .map(|b| {
                if b.mode.is_input() {
                    b.value.clone()
                } else {
                    QueryParam::Null
                }
            })
            .collect()
    }

    pub fn has_out_params(&self) -> bool {
        self.bindings.iter().any(|b| b.mode.is_output())
    }

    /// Current values of OUT and INOUT bindings, in binding order.
    pub fn out_values(&self) -> Vec<QueryParam> {
        self.bindings
            .iter()
            .filter(|b| b.mode.is_output())
            .map(|b| b.value.clone())
            .collect()
    }

    /// Overwrite OUT and INOUT bindings with `values`, in binding order.
    pub fn set_out_values(&mut self, values: &[QueryParam]) {
        let outputs = self.bindings.iter_mut().filter(|b| b.mode.is_output());
        for (binding, value) in outputs.zip(values) {
            binding.value = value.clone();
        }
    }
}

/// Produces the `BoundSql` of a statement for one parameter object.
pub trait SqlSource: Send + Sync + fmt::Debug {
    fn bound_sql(&self, parameter: &JsonValue) -> DbResult<BoundSql>;
}

/// SQL text with positional placeholders and a fixed list of properties
/// read from the parameter object.
///
/// A scalar parameter object feeds every property. For object parameters,
/// dotted properties (`user.id`) walk nested objects and missing properties
/// bind as NULL.
#[derive(Debug, Clone)]
pub struct StaticSqlSource {
    sql: String,
    properties: Vec<(String, ParameterMode)>,
}

impl StaticSqlSource {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            properties: Vec::new(),
        }
    }

    /// Append an IN property.
    pub fn with_param(self, property: impl Into<String>) -> Self {
        self.with_mode(property, ParameterMode::In)
    }

    /// Append a property with an explicit mode.
    pub fn with_mode(mut self, property: impl Into<String>, mode: ParameterMode) -> Self {
        self.properties.push((property.into(), mode));
        self
    }

    fn lookup<'a>(parameter: &'a JsonValue, property: &str) -> Option<&'a JsonValue> {
        match parameter {
            JsonValue::Object(_) => property
                .split('.')
                .try_fold(parameter, |value, part| value.get(part)),
            JsonValue::Null => None,
            scalar => Some(scalar),
        }
    }
}

impl SqlSource for StaticSqlSource {
    fn bound_sql(&self, parameter: &JsonValue) -> DbResult<BoundSql> {
        let bindings = self
            .properties
            .iter()
            .map(|(property, mode)| {
                let value = match mode {
                    ParameterMode::Out => QueryParam::Null,
                    _ => Self::lookup(parameter, property)
                        .map(QueryParam::from_json)
                        .unwrap_or(QueryParam::Null),
                };
                ParameterBinding {
                    property: property.clone(),
                    mode: *mode,
                    value,
                }
            })
            .collect();
        Ok(BoundSql::new(self.sql.clone(), bindings))
    }
}

/// Turns fetched rows into result objects.
///
/// The executor that ran the query is handed in so mappers can issue nested
/// queries (which run with a query stack depth above zero) or register
/// deferred loads.
#[async_trait]
pub trait ResultMapper: Send + Sync + fmt::Debug {
    async fn map_rows(&self, executor: &mut dyn Executor, rows: Vec<Row>)
    -> DbResult<Vec<JsonValue>>;
}

/// Default mapper: each row becomes a JSON object keyed by column name.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowMapper;

#[async_trait]
impl ResultMapper for RowMapper {
    async fn map_rows(
        &self,
        _executor: &mut dyn Executor,
        rows: Vec<Row>,
    ) -> DbResult<Vec<JsonValue>> {
        Ok(rows.into_iter().map(JsonValue::Object).collect())
    }
}

/// A registered statement.
#[derive(Debug, Clone)]
pub struct MappedStatement {
    pub id: String,
    /// Where the statement was declared; reported in error context.
    pub resource: Option<String>,
    pub statement_type: StatementType,
    pub command_type: SqlCommandType,
    pub sql_source: Arc<dyn SqlSource>,
    pub result_mapper: Arc<dyn ResultMapper>,
    /// Namespace (second-level) cache.
    pub cache: Option<Arc<dyn Cache>>,
    /// Clear caches before this statement runs. Defaults to true for writes.
    pub flush_cache_required: bool,
    /// Consult the namespace cache. Defaults to true for selects.
    pub use_cache: bool,
}

impl MappedStatement {
    pub fn new(
        id: impl Into<String>,
        command_type: SqlCommandType,
        sql_source: impl SqlSource + 'static,
    ) -> Self {
        let is_select = command_type == SqlCommandType::Select;
        Self {
            id: id.into(),
            resource: None,
            statement_type: StatementType::Prepared,
            command_type,
            sql_source: Arc::new(sql_source),
            result_mapper: Arc::new(RowMapper),
            cache: None,
            flush_cache_required: !is_select,
            use_cache: is_select,
        }
    }

    /// Shorthand for a select over static SQL.
    pub fn select(id: impl Into<String>, sql_source: impl SqlSource + 'static) -> Self {
        Self::new(id, SqlCommandType::Select, sql_source)
    }

    pub fn with_statement_type(mut self, statement_type: StatementType) -> Self {
        self.statement_type = statement_type;
        self
    }

    pub fn with_result_mapper(mut self, mapper: Arc<dyn ResultMapper>) -> Self {
        self.result_mapper = mapper;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_flush_cache(mut self, flush: bool) -> Self {
        self.flush_cache_required = flush;
        self
    }

    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Resolve the statement for `parameter`.
    pub fn bound_sql(&self, parameter: &JsonValue) -> DbResult<BoundSql> {
        let bound = self.sql_source.bound_sql(parameter)?;
        if bound.has_out_params() && self.statement_type != StatementType::Callable {
            return Err(DbError::invalid_input(format!(
                "Statement '{}' declares OUT parameters but is not callable",
                self.id
            )));
        }
        Ok(bound)
    }
}
