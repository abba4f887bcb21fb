//! Error types for the statement runtime.
//!
//! This module defines all error types using `thiserror`. Errors raised while a
//! session is working on a statement can carry an [`ErrorContext`] describing
//! what was being done, attached explicitly with [`DbError::with_context`].

use crate::models::BatchResult;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Timed out after {waited_ms}ms waiting for lock on key '{key}' in cache '{cache_id}'")]
    LockTimeout {
        cache_id: String,
        key: String,
        waited_ms: u64,
    },

    #[error("Pool '{pool}' exhausted after {waited_ms}ms: {reason}")]
    PoolExhausted {
        pool: String,
        waited_ms: u64,
        reason: String,
    },

    #[error(
        "Batch statement '{statement_id}' (batch index #{}) failed after {} completed entries: {source}",
        .index + 1,
        .successful.len()
    )]
    BatchPartialFailure {
        statement_id: String,
        /// Zero-based position of the failing entry.
        index: usize,
        /// Entries that ran before the failure. They will be rolled back
        /// with the transaction.
        successful: Vec<BatchResult>,
        failed: Box<BatchResult>,
        source: Box<DbError>,
    },

    #[error("{resource} is closed")]
    Closed { resource: String },

    #[error("Invalid connection: {message}")]
    InvalidConnection { message: String },

    #[error("Cache '{cache_id}': {message}")]
    Cache { cache_id: String, message: String },

    #[error("Expected one result (or null) from '{statement_id}' but found {count}")]
    TooManyResults { statement_id: String, count: usize },

    #[error("Mapped statement not found: {statement_id}")]
    StatementNotFound { statement_id: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("{source} ({context})")]
    Contextual {
        context: Box<ErrorContext>,
        source: Box<DbError>,
    },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a lock timeout error for a blocking cache.
    pub fn lock_timeout(cache_id: impl Into<String>, key: impl Into<String>, waited_ms: u64) -> Self {
        Self::LockTimeout {
            cache_id: cache_id.into(),
            key: key.into(),
            waited_ms,
        }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(pool: impl Into<String>, waited_ms: u64, reason: impl Into<String>) -> Self {
        Self::PoolExhausted {
            pool: pool.into(),
            waited_ms,
            reason: reason.into(),
        }
    }

    /// Create an error for use of a closed executor, connection or statement.
    pub fn closed(resource: impl Into<String>) -> Self {
        Self::Closed {
            resource: resource.into(),
        }
    }

    /// Create an invalid connection error.
    pub fn invalid_connection(message: impl Into<String>) -> Self {
        Self::InvalidConnection {
            message: message.into(),
        }
    }

    /// Create a cache error.
    pub fn cache(cache_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cache {
            cache_id: cache_id.into(),
            message: message.into(),
        }
    }

    /// Create a too many results error.
    pub fn too_many_results(statement_id: impl Into<String>, count: usize) -> Self {
        Self::TooManyResults {
            statement_id: statement_id.into(),
            count,
        }
    }

    /// Create a statement not found error.
    pub fn statement_not_found(statement_id: impl Into<String>) -> Self {
        Self::StatementNotFound {
            statement_id: statement_id.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach a context to this error. An error that already carries one
    /// keeps it: the innermost context is the most precise.
    pub fn with_context(self, context: ErrorContext) -> Self {
        match self {
            Self::Contextual { .. } => self,
            other => Self::Contextual {
                context: Box::new(context),
                source: Box::new(other),
            },
        }
    }

    /// The error with any context wrapper removed.
    pub fn root(&self) -> &DbError {
        match self {
            Self::Contextual { source, .. } => source.root(),
            other => other,
        }
    }

    /// The attached context, if any.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Contextual { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self.root() {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => {
                Some("Return connections promptly or raise the pool's max_active")
            }
            Self::LockTimeout { .. } => {
                Some("The session loading this key did not commit or roll back in time")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::Connection { .. } | Self::Timeout { .. } | Self::PoolExhausted { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => {
                DbError::pool_exhausted("sqlx", 0, "driver pool acquire timed out")
            }
            sqlx::Error::PoolClosed => DbError::closed("Driver pool"),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::database(
                format!("Type not found: {}", type_name),
                None,
                "Check the column types referenced by the statement",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::database(
                format!("Column not found: {}", col),
                None,
                "Check the column names referenced by the statement",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// What a session was doing when an error occurred.
///
/// Built by the session layer for every statement it runs and attached to
/// errors on the way out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn activity(mut self, activity: impl Into<String>) -> Self {
        self.activity = Some(activity.into());
        self
    }

    pub fn statement(mut self, statement_id: impl Into<String>) -> Self {
        self.statement_id = Some(statement_id.into());
        self
    }

    pub fn sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [
            self.resource.as_ref().map(|v| format!("resource: {}", v)),
            self.activity.as_ref().map(|v| format!("while {}", v)),
            self.statement_id.as_ref().map(|v| format!("statement: {}", v)),
            self.sql
                .as_ref()
                .map(|v| format!("sql: {}", v.split_whitespace().collect::<Vec<_>>().join(" "))),
        ];
        let rendered: Vec<String> = parts.into_iter().flatten().collect();
        write!(f, "{}", rendered.join("; "))
    }
}
