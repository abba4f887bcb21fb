//! Database access layer.
//!
//! This module provides connection handling below the executors:
//! - Driver and connection capability traits, with the sqlx-backed driver
//! - An in-memory scripted driver for running executors without a server
//! - Pooled and unpooled data sources
//! - Lazy per-unit-of-work transactions
//! - Row decoding and parameter binding per backend

pub mod driver;
#[macro_use]
pub mod macros;
pub mod memory;
pub mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use driver::{CallResult, Connection, Driver, RawConnection, SqlxDriver, StatementId};
pub use memory::{Execution, MemoryDriver, MemoryStats};
pub use pool::{DataSource, PoolStatus, PooledConnection, PooledDataSource, UnpooledDataSource};
pub use transaction::Transaction;
