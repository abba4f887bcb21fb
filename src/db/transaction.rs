//! Unit-of-work connection handling.
//!
//! A [`Transaction`] borrows nothing until the first statement runs: the
//! connection is taken from the data source lazily and handed back on
//! `close()`. Without autocommit every statement runs inside an explicit
//! transaction that is opened on demand, so the next statement after a
//! commit or rollback starts a fresh one.

use crate::db::driver::Connection;
use crate::db::pool::DataSource;
use crate::error::{DbError, DbResult};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct Transaction {
    data_source: Arc<dyn DataSource>,
    autocommit: bool,
    connection: Option<Box<dyn Connection>>,
    closed: bool,
}

impl Transaction {
    pub fn new(data_source: Arc<dyn DataSource>, autocommit: bool) -> Self {
        Self {
            data_source,
            autocommit,
            connection: None,
            closed: false,
        }
    }

    pub fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    /// Whether a connection has been taken from the data source.
    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// The connection for the next statement, opening it (and the
    /// surrounding transaction) if needed.
    pub async fn connection(&mut self) -> DbResult<&mut Box<dyn Connection>> {
        if self.closed {
            return Err(DbError::closed("Transaction"));
        }
        if self.connection.is_none() {
            let conn = self.data_source.get_connection().await?;
            debug!(autocommit = self.autocommit, "Opened connection for transaction");
            self.connection = Some(conn);
        }
        let autocommit = self.autocommit;
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| DbError::internal("Transaction lost its connection"))?;
        if !autocommit && !conn.in_transaction() {
            conn.begin().await?;
        }
        Ok(conn)
    }

    /// The connection if one is already open. Never opens or begins.
    pub fn existing_connection(&mut self) -> Option<&mut Box<dyn Connection>> {
        self.connection.as_mut()
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        match self.connection.as_mut() {
            Some(conn) if !self.autocommit && conn.in_transaction() => {
                debug!("Committing transaction");
                conn.commit().await
            }
            _ => Ok(()),
        }
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        match self.connection.as_mut() {
            Some(conn) if !self.autocommit && conn.in_transaction() => {
                debug!("Rolling back transaction");
                conn.rollback().await
            }
            _ => Ok(()),
        }
    }

    /// Return the connection to its data source. Idempotent.
    pub async fn close(&mut self) -> DbResult<()> {
        self.closed = true;
        if let Some(mut conn) = self.connection.take() {
            if conn.in_transaction() {
                if let Err(e) = conn.rollback().await {
                    warn!(error = %e, "Rollback before closing transaction failed");
                }
            }
            conn.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use crate::db::memory::MemoryDriver;
    use crate::db::pool::{PooledDataSource, UnpooledDataSource};
    use crate::models::{ConnectionSpec, StatementType};

    fn unpooled(driver: &MemoryDriver) -> Arc<dyn DataSource> {
        Arc::new(UnpooledDataSource::new(
            Arc::new(driver.clone()),
            ConnectionSpec::new("memory://test"),
        ))
    }

    #[tokio::test]
    async fn test_connection_is_lazy() {
        let driver = MemoryDriver::new();
        let mut tx = Transaction::new(unpooled(&driver), false);
        tx.commit().await.unwrap();
        tx.rollback().await.unwrap();
        tx.close().await.unwrap();
        assert_eq!(driver.stats().connects, 0);
    }

    #[tokio::test]
    async fn test_manual_commit_begins_on_demand() {
        let driver = MemoryDriver::new();
        let mut tx = Transaction::new(unpooled(&driver), false);

        let conn = tx.connection().await.unwrap();
        assert!(conn.in_transaction());
        tx.commit().await.unwrap();

        // next statement starts a new transaction
        tx.connection().await.unwrap();
        tx.rollback().await.unwrap();
        tx.close().await.unwrap();

        let stats = driver.stats();
        assert_eq!((stats.begins, stats.commits, stats.rollbacks), (2, 1, 1));
        assert_eq!(driver.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_autocommit_never_begins() {
        let driver = MemoryDriver::new();
        let mut tx = Transaction::new(unpooled(&driver), true);
        let conn = tx.connection().await.unwrap();
        conn.prepare("SELECT 1", StatementType::Prepared).await.unwrap();
        tx.commit().await.unwrap();
        tx.close().await.unwrap();
        assert_eq!(driver.stats().begins, 0);
        assert_eq!(driver.stats().commits, 0);
    }

    #[tokio::test]
    async fn test_close_returns_pooled_connection() {
        let driver = MemoryDriver::new();
        let pool = Arc::new(PooledDataSource::new(
            Arc::new(driver.clone()),
            ConnectionSpec::new("memory://test"),
            PoolOptions::default(),
        ));
        let mut tx = Transaction::new(pool.clone(), false);
        tx.connection().await.unwrap();
        tx.close().await.unwrap();

        assert_eq!(pool.status().idle, 1);
        assert_eq!(driver.stats().rollbacks, 1);
        assert!(matches!(
            tx.connection().await,
            Err(DbError::Closed { .. })
        ));
    }
}
