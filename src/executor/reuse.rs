use crate::db::driver::{Connection, StatementId};
use crate::db::transaction::Transaction;
use crate::error::DbResult;
use crate::executor::base::{ExecutionStrategy, close_statement, execute_query, execute_update};
use crate::models::{BatchResult, BoundSql, MappedStatement, Row, UpdateOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

/// Keeps one prepared statement per SQL text until the next flush, commit
/// or rollback.
#[derive(Debug, Default)]
pub struct ReuseStrategy {
    statements: HashMap<String, StatementId>,
}

impl ReuseStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of statements currently held open.
    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    async fn prepare(&mut self, conn: &mut dyn Connection, ms: &MappedStatement, sql: &str) -> DbResult<StatementId> {
        if !conn.is_closed() {
            if let Some(&statement) = self.statements.get(sql) {
                debug!(statement_id = %ms.id, statement, "Reusing prepared statement");
                return Ok(statement);
            }
        }
        let statement = conn.prepare(sql, ms.statement_type).await?;
        self.statements.insert(sql.to_string(), statement);
        Ok(statement)
    }
}

#[async_trait]
impl ExecutionStrategy for ReuseStrategy {
    async fn do_update(
        &mut self,
        tx: &mut Transaction,
        ms: &MappedStatement,
        bound: &mut BoundSql,
    ) -> DbResult<UpdateOutcome> {
        let conn = tx.connection().await?;
        let sql = bound.sql.clone();
        let statement = self.prepare(&mut **conn, ms, &sql).await?;
        execute_update(&mut **conn, statement, ms, bound)
            .await
            .map(UpdateOutcome::Affected)
    }

    async fn do_query(
        &mut self,
        tx: &mut Transaction,
        ms: &MappedStatement,
        bound: &mut BoundSql,
    ) -> DbResult<Vec<Row>> {
        let conn = tx.connection().await?;
        let sql = bound.sql.clone();
        let statement = self.prepare(&mut **conn, ms, &sql).await?;
        execute_query(&mut **conn, statement, ms, bound).await
    }

    async fn do_flush_statements(
        &mut self,
        tx: &mut Transaction,
        _is_rollback: bool,
    ) -> DbResult<Vec<BatchResult>> {
        let statements: Vec<StatementId> = self.statements.drain().map(|(_, s)| s).collect();
        if let Some(conn) = tx.existing_connection() {
            for statement in statements {
                close_statement(&mut **conn, statement).await;
            }
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDriver;
    use crate::executor::base::test_support::transaction;
    use crate::models::{SqlCommandType, StaticSqlSource};
    use serde_json::json;

    #[tokio::test]
    async fn test_statements_reused_until_flush() {
        let driver = MemoryDriver::new();
        let mut tx = transaction(&driver, false);
        let mut strategy = ReuseStrategy::new();
        let insert = MappedStatement::new(
            "t.insert",
            SqlCommandType::Insert,
            StaticSqlSource::new("INSERT INTO t VALUES (?)").with_param("v"),
        );
        let select = MappedStatement::select("t.all", StaticSqlSource::new("SELECT * FROM t"));

        for v in 0..3 {
            let mut bound = insert.bound_sql(&json!({ "v": v })).unwrap();
            strategy.do_update(&mut tx, &insert, &mut bound).await.unwrap();
        }
        let mut bound = select.bound_sql(&json!({})).unwrap();
        strategy.do_query(&mut tx, &select, &mut bound).await.unwrap();

        assert_eq!(driver.stats().prepares, 2);
        assert_eq!(driver.stats().updates, 3);
        assert_eq!(strategy.cached_statements(), 2);

        strategy.do_flush_statements(&mut tx, false).await.unwrap();
        assert_eq!(strategy.cached_statements(), 0);
        assert_eq!(driver.stats().statement_closes, 2);

        let mut bound = insert.bound_sql(&json!({ "v": 9 })).unwrap();
        strategy.do_update(&mut tx, &insert, &mut bound).await.unwrap();
        assert_eq!(driver.stats().prepares, 3);
        tx.close().await.unwrap();
    }
}
