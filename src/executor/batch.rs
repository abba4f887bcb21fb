//! Update batching.
//!
//! Consecutive updates with the same SQL text and the same statement id are
//! appended to one batch entry; anything else starts a new entry. Nothing
//! reaches the database until a flush, which runs the entries in order.
//! Queries flush first so they observe pending writes. Callables with OUT
//! parameters are refused because a batch has nowhere to return them.

use crate::db::driver::StatementId;
use crate::db::transaction::Transaction;
use crate::error::{DbError, DbResult};
use crate::executor::base::{ExecutionStrategy, close_statement, execute_query};
use crate::models::{BatchResult, BoundSql, MappedStatement, Row, StatementType, UpdateOutcome};
use async_trait::async_trait;
use tracing::{debug, warn};

#[derive(Debug)]
struct BatchEntry {
    statement: StatementId,
    result: BatchResult,
}

#[derive(Debug, Default)]
pub struct BatchStrategy {
    entries: Vec<BatchEntry>,
}

impl BatchStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending batch entries.
    pub fn pending_entries(&self) -> usize {
        self.entries.len()
    }

    async fn close_all(tx: &mut Transaction, statements: impl IntoIterator<Item = StatementId>) {
        if let Some(conn) = tx.existing_connection() {
            for statement in statements {
                close_statement(&mut **conn, statement).await;
            }
        }
    }
}

#[async_trait]
impl ExecutionStrategy for BatchStrategy {
    async fn do_update(
        &mut self,
        tx: &mut Transaction,
        ms: &MappedStatement,
        bound: &mut BoundSql,
    ) -> DbResult<UpdateOutcome> {
        if ms.statement_type == StatementType::Callable && bound.has_out_params() {
            return Err(DbError::invalid_input(format!(
                "Batching stored procedures with OUT params is not supported. \
                 Use a simple or reuse executor for statement '{}'",
                ms.id
            )));
        }
        let params = bound.bind_values();
        match self.entries.last_mut() {
            Some(last) if last.result.sql == bound.sql && last.result.statement_id == ms.id => {
                last.result.add_parameters(params);
            }
            _ => {
                let conn = tx.connection().await?;
                let statement = conn.prepare(&bound.sql, ms.statement_type).await?;
                let mut result = BatchResult::new(ms.id.clone(), bound.sql.clone());
                result.add_parameters(params);
                self.entries.push(BatchEntry { statement, result });
            }
        }
        debug!(statement_id = %ms.id, entries = self.entries.len(), "Batched update");
        Ok(UpdateOutcome::Batched)
    }

    async fn do_query(
        &mut self,
        tx: &mut Transaction,
        ms: &MappedStatement,
        bound: &mut BoundSql,
    ) -> DbResult<Vec<Row>> {
        self.do_flush_statements(tx, false).await?;
        let conn = tx.connection().await?;
        let statement = conn.prepare(&bound.sql, ms.statement_type).await?;
        let result = execute_query(&mut **conn, statement, ms, bound).await;
        close_statement(&mut **conn, statement).await;
        result
    }

    async fn do_flush_statements(
        &mut self,
        tx: &mut Transaction,
        is_rollback: bool,
    ) -> DbResult<Vec<BatchResult>> {
        let entries = std::mem::take(&mut self.entries);
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        if is_rollback {
            debug!(entries = entries.len(), "Discarding batch on rollback");
            Self::close_all(tx, entries.iter().map(|e| e.statement).collect::<Vec<_>>()).await;
            return Ok(Vec::new());
        }

        let mut completed: Vec<BatchResult> = Vec::with_capacity(entries.len());
        let mut remaining = entries.into_iter().enumerate();
        while let Some((index, entry)) = remaining.next() {
            let conn = tx.connection().await?;
            let outcome = conn.execute_batch(entry.statement, &entry.result.parameters).await;
            close_statement(&mut **conn, entry.statement).await;

            match outcome {
                Ok(counts) => {
                    let mut result = entry.result;
                    result.update_counts = counts;
                    completed.push(result);
                }
                Err(source) => {
                    warn!(
                        statement_id = %entry.result.statement_id,
                        index,
                        completed = completed.len(),
                        error = %source,
                        "Batch entry failed"
                    );
                    Self::close_all(tx, remaining.map(|(_, e)| e.statement)).await;
                    return Err(DbError::BatchPartialFailure {
                        statement_id: entry.result.statement_id.clone(),
                        index,
                        successful: completed,
                        failed: Box::new(entry.result),
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(completed)
    }
}
