use crate::db::transaction::Transaction;
use crate::error::DbResult;
use crate::executor::base::{ExecutionStrategy, close_statement, execute_query, execute_update};
use crate::models::{BatchResult, BoundSql, MappedStatement, Row, UpdateOutcome};
use async_trait::async_trait;

/// Prepares a statement for every call and closes it afterwards, whether
/// the call succeeded or not.
#[derive(Debug, Default)]
pub struct SimpleStrategy;

impl SimpleStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionStrategy for SimpleStrategy {
    async fn do_update(
        &mut self,
        tx: &mut Transaction,
        ms: &MappedStatement,
        bound: &mut BoundSql,
    ) -> DbResult<UpdateOutcome> {
        let conn = tx.connection().await?;
        let statement = conn.prepare(&bound.sql, ms.statement_type).await?;
        let result = execute_update(&mut **conn, statement, ms, bound).await;
        close_statement(&mut **conn, statement).await;
        result.map(UpdateOutcome::Affected)
    }

    async fn do_query(
        &mut self,
        tx: &mut Transaction,
        ms: &MappedStatement,
        bound: &mut BoundSql,
    ) -> DbResult<Vec<Row>> {
        let conn = tx.connection().await?;
        let statement = conn.prepare(&bound.sql, ms.statement_type).await?;
        let result = execute_query(&mut **conn, statement, ms, bound).await;
        close_statement(&mut **conn, statement).await;
        result
    }

    async fn do_flush_statements(
        &mut self,
        _tx: &mut Transaction,
        _is_rollback: bool,
    ) -> DbResult<Vec<BatchResult>> {
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
    async fn test_statement_per_call() {
        let driver = MemoryDriver::new().with_update_count("DELETE FROM t WHERE id = ?", 2);
        let mut tx = transaction(&driver, true);
        let mut strategy = SimpleStrategy::new();
        let ms = MappedStatement::new(
            "t.delete",
            SqlCommandType::Delete,
            StaticSqlSource::new("DELETE FROM t WHERE id = ?").with_param("id"),
        );

        for id in 0..3 {
            let mut bound = ms.bound_sql(&json!({ "id": id })).unwrap();
            let outcome = strategy.do_update(&mut tx, &ms, &mut bound).await.unwrap();
            assert_eq!(outcome, UpdateOutcome::Affected(2));
        }

        let stats = driver.stats();
        assert_eq!(stats.prepares, 3);
        assert_eq!(stats.statement_closes, 3);
        assert!(strategy.do_flush_statements(&mut tx, false).await.unwrap().is_empty());
        tx.close().await.unwrap();
    }
}
