//! Scripted in-memory driver.
//!
//! Answers queries from canned rows keyed by SQL text and counts every call,
//! so executor, pool and session behavior can be observed without a server.
//! All connections opened by one [`MemoryDriver`] share its script and its
//! counters.

use crate::db::driver::{CallResult, Connection, Driver, StatementId};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionSpec, QueryParam, Row, StatementType};
use crate::sync::lock;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Snapshot of the driver's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub connects: u64,
    pub prepares: u64,
    pub statement_closes: u64,
    pub queries: u64,
    pub updates: u64,
    pub batches: u64,
    pub calls: u64,
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub pings: u64,
    pub closes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    prepares: AtomicU64,
    statement_closes: AtomicU64,
    queries: AtomicU64,
    updates: AtomicU64,
    batches: AtomicU64,
    calls: AtomicU64,
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    pings: AtomicU64,
    closes: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MemoryStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MemoryStats {
            connects: get(&self.connects),
            prepares: get(&self.prepares),
            statement_closes: get(&self.statement_closes),
            queries: get(&self.queries),
            updates: get(&self.updates),
            batches: get(&self.batches),
            calls: get(&self.calls),
            begins: get(&self.begins),
            commits: get(&self.commits),
            rollbacks: get(&self.rollbacks),
            pings: get(&self.pings),
            closes: get(&self.closes),
        }
    }
}

/// One statement execution as seen by the driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    pub connection: u64,
    pub sql: String,
    pub params: Vec<QueryParam>,
}

#[derive(Debug, Default)]
struct Script {
    rows: HashMap<String, Vec<Row>>,
    update_counts: HashMap<String, u64>,
    out_values: HashMap<String, Vec<QueryParam>>,
    failing: HashSet<String>,
}

#[derive(Debug, Default)]
struct Shared {
    counters: Counters,
    script: Mutex<Script>,
    executions: Mutex<Vec<Execution>>,
    fail_connects: AtomicBool,
    fail_pings: AtomicBool,
    latency_ms: AtomicU64,
    next_connection: AtomicU64,
    open: AtomicU64,
}

/// Driver whose connections answer from a shared script.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    shared: Arc<Shared>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows returned by queries whose SQL equals `sql`. Unscripted queries
    /// return no rows.
    pub fn with_rows(self, sql: impl Into<String>, rows: Vec<JsonValue>) -> Self {
        let rows = rows
            .into_iter()
            .map(|row| match row {
                JsonValue::Object(map) => map,
                other => {
                    let mut map = Row::new();
                    map.insert("value".to_string(), other);
                    map
                }
            })
            .collect();
        lock(&self.shared.script).rows.insert(sql.into(), rows);
        self
    }

    /// Affected row count reported for `sql`. Unscripted updates report 1.
    pub fn with_update_count(self, sql: impl Into<String>, count: u64) -> Self {
        lock(&self.shared.script)
            .update_counts
            .insert(sql.into(), count);
        self
    }

    /// OUT values produced when `sql` is called.
    pub fn with_out_values(self, sql: impl Into<String>, values: Vec<QueryParam>) -> Self {
        lock(&self.shared.script).out_values.insert(sql.into(), values);
        self
    }

    /// Every execution of `sql` fails with a database error.
    pub fn fail_on(&self, sql: impl Into<String>) {
        lock(&self.shared.script).failing.insert(sql.into());
    }

    pub fn fail_connects(&self, fail: bool) {
        self.shared.fail_connects.store(fail, Ordering::SeqCst);
    }

    pub fn fail_pings(&self, fail: bool) {
        self.shared.fail_pings.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to every statement execution.
    pub fn set_latency(&self, latency: Duration) {
        self.shared
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn stats(&self) -> MemoryStats {
        self.shared.counters.snapshot()
    }

    /// Executions in the order they ran.
    pub fn executions(&self) -> Vec<Execution> {
        lock(&self.shared.executions).clone()
    }

    /// Physical connections opened and not yet closed.
    pub fn open_connections(&self) -> u64 {
        self.shared.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(&self, spec: &ConnectionSpec) -> DbResult<Box<dyn Connection>> {
        if self.shared.fail_connects.load(Ordering::SeqCst) {
            return Err(DbError::connection(
                format!("Connection refused: {}", spec.masked_url()),
                "Check that the server is running and accessible",
            ));
        }
        Counters::bump(&self.shared.counters.connects);
        self.shared.open.fetch_add(1, Ordering::SeqCst);
        let id = self.shared.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            statements: HashMap::new(),
            next_statement: 1,
            in_transaction: false,
            closed: false,
        }))
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    statements: HashMap<StatementId, (String, StatementType)>,
    next_statement: StatementId,
    in_transaction: bool,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> DbResult<()> {
        if self.closed {
            return Err(DbError::closed(format!("Connection {}", self.id)));
        }
        Ok(())
    }

    /// Record an execution of `statement` and return its SQL.
    async fn execute(&mut self, statement: StatementId, params: &[QueryParam]) -> DbResult<String> {
        self.ensure_open()?;
        let sql = self
            .statements
            .get(&statement)
            .map(|(sql, _)| sql.clone())
            .ok_or_else(|| DbError::closed(format!("Statement {}", statement)))?;

        let latency = self.shared.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        lock(&self.shared.executions).push(Execution {
            connection: self.id,
            sql: sql.clone(),
            params: params.to_vec(),
        });
        if lock(&self.shared.script).failing.contains(&sql) {
            return Err(DbError::database(
                format!("Scripted failure for: {}", sql),
                Some("HY000".to_string()),
                "Remove the scripted failure",
            ));
        }
        Ok(sql)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn prepare(&mut self, sql: &str, statement_type: StatementType) -> DbResult<StatementId> {
        self.ensure_open()?;
        Counters::bump(&self.shared.counters.prepares);
        let id = self.next_statement;
        self.next_statement += 1;
        self.statements.insert(id, (sql.to_string(), statement_type));
        Ok(id)
    }

    async fn query(&mut self, statement: StatementId, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        Counters::bump(&self.shared.counters.queries);
        let sql = self.execute(statement, params).await?;
        Ok(lock(&self.shared.script)
            .rows
            .get(&sql)
            .cloned()
            .unwrap_or_default())
    }

    async fn update(&mut self, statement: StatementId, params: &[QueryParam]) -> DbResult<u64> {
        Counters::bump(&self.shared.counters.updates);
        let sql = self.execute(statement, params).await?;
        Ok(lock(&self.shared.script)
            .update_counts
            .get(&sql)
            .copied()
            .unwrap_or(1))
    }

    async fn execute_batch(
        &mut self,
        statement: StatementId,
        batch: &[Vec<QueryParam>],
    ) -> DbResult<Vec<u64>> {
        Counters::bump(&self.shared.counters.batches);
        let mut counts = Vec::with_capacity(batch.len());
        for params in batch {
            counts.push(self.update(statement, params).await?);
        }
        Ok(counts)
    }

    async fn call(
        &mut self,
        statement: StatementId,
        params: &[QueryParam],
        out_count: usize,
    ) -> DbResult<CallResult> {
        Counters::bump(&self.shared.counters.calls);
        let sql = self.execute(statement, params).await?;
        let script = lock(&self.shared.script);
        let mut out_values = script.out_values.get(&sql).cloned().unwrap_or_default();
        out_values.resize(out_count, QueryParam::Null);
        Ok(CallResult {
            rows: script.rows.get(&sql).cloned().unwrap_or_default(),
            out_values,
        })
    }

    async fn close_statement(&mut self, statement: StatementId) -> DbResult<()> {
        if self.statements.remove(&statement).is_some() {
            Counters::bump(&self.shared.counters.statement_closes);
        }
        Ok(())
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        Counters::bump(&self.shared.counters.begins);
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        if self.in_transaction {
            Counters::bump(&self.shared.counters.commits);
            self.in_transaction = false;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        if self.in_transaction {
            Counters::bump(&self.shared.counters.rollbacks);
            self.in_transaction = false;
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn ping(&mut self, _query: Option<&str>) -> DbResult<()> {
        self.ensure_open()?;
        Counters::bump(&self.shared.counters.pings);
        if self.shared.fail_pings.load(Ordering::SeqCst) {
            return Err(DbError::connection(
                format!("Connection {} is gone", self.id),
                "The server closed the connection",
            ));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> DbResult<()> {
        if !self.closed {
            self.closed = true;
            self.statements.clear();
            Counters::bump(&self.shared.counters.closes);
            self.shared.open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_rows_and_counts() {
        let driver = MemoryDriver::new()
            .with_rows("SELECT * FROM t", vec![json!({"id": 1}), json!(2)])
            .with_update_count("DELETE FROM t", 5);
        let mut conn = driver.connect(&ConnectionSpec::new("memory://")).await.unwrap();

        let select = conn.prepare("SELECT * FROM t", StatementType::Prepared).await.unwrap();
        let rows = conn.query(select, &[]).await.unwrap();
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[1]["value"], json!(2));

        let delete = conn.prepare("DELETE FROM t", StatementType::Prepared).await.unwrap();
        assert_eq!(conn.update(delete, &[]).await.unwrap(), 5);

        let stats = driver.stats();
        assert_eq!(stats.prepares, 2);
        assert_eq!(stats.queries, 1);
        assert_eq!(stats.updates, 1);
        assert_eq!(driver.executions().len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failure_and_close() {
        let driver = MemoryDriver::new();
        driver.fail_on("UPDATE t SET a = 1");
        let mut conn = driver.connect(&ConnectionSpec::new("memory://")).await.unwrap();
        assert_eq!(driver.open_connections(), 1);

        let stmt = conn
            .prepare("UPDATE t SET a = 1", StatementType::Prepared)
            .await
            .unwrap();
        assert!(matches!(
            conn.update(stmt, &[]).await,
            Err(DbError::Database { .. })
        ));

        conn.close().await.unwrap();
        assert_eq!(driver.open_connections(), 0);
        assert!(matches!(conn.ping(None).await, Err(DbError::Closed { .. })));
    }

    #[tokio::test]
    async fn test_call_pads_out_values() {
        let driver =
            MemoryDriver::new().with_out_values("CALL p(?, ?)", vec![QueryParam::Int(42)]);
        let mut conn = driver.connect(&ConnectionSpec::new("memory://")).await.unwrap();
        let stmt = conn.prepare("CALL p(?, ?)", StatementType::Callable).await.unwrap();
        let result = conn.call(stmt, &[QueryParam::Null, QueryParam::Null], 2).await.unwrap();
        assert_eq!(result.out_values, vec![QueryParam::Int(42), QueryParam::Null]);
    }
}
