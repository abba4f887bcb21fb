//! Data models shared by the cache, driver and executor layers.

pub mod connection;
pub mod param;
pub mod result;
pub mod statement;

pub use connection::{ConnectionSpec, DatabaseType};
pub use param::{ParameterBinding, ParameterMode, QueryParam};
pub use result::{BatchResult, Row, UpdateOutcome};
pub use statement::{
    BoundSql, LocalCacheScope, MappedStatement, ResultMapper, RowBounds, RowMapper,
    SqlCommandType, SqlSource, StatementType, StaticSqlSource,
};
