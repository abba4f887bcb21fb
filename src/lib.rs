//! sqlsession Library
//!
//! A statement execution runtime for SQL databases (SQLite, PostgreSQL,
//! MySQL): executors with a session cache, a transactional second-level
//! cache built from composable decorators, and a bounded connection pool.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod models;
pub mod session;
pub(crate) mod sync;

pub use config::Config;
pub use error::{DbError, DbResult};
pub use session::{Configuration, Session, SessionFactory};
