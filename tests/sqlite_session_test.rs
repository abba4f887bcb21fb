//! Integration tests running sessions against a real SQLite database.
//!
//! Tests verify that:
//! - Manual-commit sessions make writes visible to others only on commit
//! - Rollback and close discard uncommitted writes
//! - Batch and reuse executors produce the same data as the simple one
//! - The session cache serves repeated selects until cleared
//! - The pool stays within max_active under concurrent sessions

use serde_json::{Value as JsonValue, json};
use sqlsession::config::DataSourceConfig;
use sqlsession::db::{DataSource, PooledDataSource, SqlxDriver};
use sqlsession::executor::ExecutorType;
use sqlsession::models::{MappedStatement, SqlCommandType, StaticSqlSource, UpdateOutcome};
use sqlsession::{Configuration, DbError, SessionFactory};
use std::sync::Arc;
use tempfile::NamedTempFile;

fn configuration() -> Configuration {
    let mut configuration = Configuration::new();
    let statements = [
        MappedStatement::new(
            "schema.create",
            SqlCommandType::Unknown,
            StaticSqlSource::new(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, team TEXT)",
            ),
        ),
        MappedStatement::new(
            "users.insert",
            SqlCommandType::Insert,
            StaticSqlSource::new("INSERT INTO users (name, team) VALUES (?, ?)")
                .with_param("name")
                .with_param("team"),
        ),
        MappedStatement::select(
            "users.by_team",
            StaticSqlSource::new("SELECT id, name FROM users WHERE team = ? ORDER BY id")
                .with_param("team"),
        ),
        MappedStatement::select(
            "users.count",
            StaticSqlSource::new("SELECT COUNT(*) AS n FROM users"),
        ),
    ];
    for ms in statements {
        configuration.add_mapped_statement(ms).unwrap();
    }
    configuration
}

/// Create a SQLite database with the users table and return a session
/// factory over a pool with the given URL options.
async fn setup(options: &str) -> (SessionFactory, Arc<PooledDataSource>) {
    let temp_file = NamedTempFile::new().unwrap();
    // Keep the temp file alive - prevent deletion when function returns
    let db_path = temp_file
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let url = format!("sqlite:{}{}", db_path, options);
    let config = DataSourceConfig::parse(&url).unwrap();
    let pool = Arc::new(PooledDataSource::new(
        Arc::new(SqlxDriver),
        config.connection.clone(),
        config.pool_options.clone(),
    ));
    let data_source: Arc<dyn DataSource> = pool.clone();
    let factory = SessionFactory::new(configuration(), data_source);

    let mut session = factory.open_session(ExecutorType::Simple, true);
    session.update("schema.create", &JsonValue::Null).await.unwrap();
    session.close().await;

    (factory, pool)
}

async fn count(factory: &SessionFactory) -> i64 {
    let mut session = factory.open_session(ExecutorType::Simple, true);
    let row = session
        .select_one("users.count", &JsonValue::Null)
        .await
        .unwrap()
        .unwrap();
    session.close().await;
    row["n"].as_i64().unwrap()
}

#[tokio::test]
async fn test_insert_select_commit() {
    let (factory, _pool) = setup("").await;

    let mut session = factory.open_default_session();
    let outcome = session
        .insert("users.insert", &json!({"name": "ann", "team": "red"}))
        .await
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::Affected(1));

    // visible inside the unit of work
    let rows = session
        .select_list("users.by_team", &json!({"team": "red"}))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], "ann");

    session.commit().await.unwrap();
    session.close().await;

    assert_eq!(count(&factory).await, 1);
}

#[tokio::test]
async fn test_rollback_and_close_discard_writes() {
    let (factory, _pool) = setup("").await;

    let mut session = factory.open_default_session();
    session
        .insert("users.insert", &json!({"name": "ann", "team": "red"}))
        .await
        .unwrap();
    session.rollback().await.unwrap();

    session
        .insert("users.insert", &json!({"name": "bob", "team": "red"}))
        .await
        .unwrap();
    // closing a dirty session rolls back
    session.close().await;

    assert_eq!(count(&factory).await, 0);
}

#[tokio::test]
async fn test_batch_executor_flushes_in_order() {
    let (factory, _pool) = setup("").await;

    let mut session = factory.open_session(ExecutorType::Batch, false);
    for name in ["ann", "bob", "cy"] {
        let outcome = session
            .insert("users.insert", &json!({"name": name, "team": "blue"}))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Batched);
    }

    let results = session.flush_statements().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].statement_id, "users.insert");
    assert_eq!(results[0].update_counts, vec![1, 1, 1]);

    // a select flushes pending updates first
    session
        .insert("users.insert", &json!({"name": "dee", "team": "blue"}))
        .await
        .unwrap();
    let rows = session
        .select_list("users.by_team", &json!({"team": "blue"}))
        .await
        .unwrap();
    let names: Vec<&str> = rows.iter().filter_map(|r| r["name"].as_str()).collect();
    assert_eq!(names, vec!["ann", "bob", "cy", "dee"]);

    session.commit().await.unwrap();
    session.close().await;
    assert_eq!(count(&factory).await, 4);
}

#[tokio::test]
async fn test_batch_failure_reports_index() {
    let (factory, _pool) = setup("").await;

    let mut session = factory.open_session(ExecutorType::Batch, false);
    session
        .insert("users.insert", &json!({"name": "ann", "team": "red"}))
        .await
        .unwrap();
    // NOT NULL violation
    session
        .insert("users.insert", &json!({"team": "red"}))
        .await
        .unwrap();

    let err = session.flush_statements().await.unwrap_err();
    match err.root() {
        DbError::BatchPartialFailure {
            index, successful, ..
        } => {
            assert_eq!(*index, 0);
            assert!(successful.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    session.close().await;
    assert_eq!(count(&factory).await, 0);
}

#[tokio::test]
async fn test_reuse_executor() {
    let (factory, _pool) = setup("").await;

    let mut session = factory.open_session(ExecutorType::Reuse, false);
    for name in ["ann", "bob"] {
        session
            .insert("users.insert", &json!({"name": name, "team": "green"}))
            .await
            .unwrap();
    }
    session.commit().await.unwrap();
    session.close().await;
    assert_eq!(count(&factory).await, 2);
}

#[tokio::test]
async fn test_session_cache_serves_repeated_selects() {
    let (factory, _pool) = setup("").await;

    // autocommit keeps the reader from holding a lock on the database
    let mut reader = factory.open_session(ExecutorType::Simple, true);
    let before = reader
        .select_list("users.by_team", &json!({"team": "red"}))
        .await
        .unwrap();
    assert!(before.is_empty());

    let mut writer = factory.open_default_session();
    writer
        .insert("users.insert", &json!({"name": "ann", "team": "red"}))
        .await
        .unwrap();
    writer.commit().await.unwrap();
    writer.close().await;

    let cached = reader
        .select_list("users.by_team", &json!({"team": "red"}))
        .await
        .unwrap();
    assert!(cached.is_empty());

    reader.clear_cache();
    let fresh = reader
        .select_list("users.by_team", &json!({"team": "red"}))
        .await
        .unwrap();
    assert_eq!(fresh.len(), 1);
    reader.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_bounded_under_concurrent_sessions() {
    let (factory, pool) = setup("?max_active=2&max_idle=2").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let factory = factory.clone();
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let mut session = factory.open_session(ExecutorType::Simple, true);
            session
                .select_list("users.count", &JsonValue::Null)
                .await
                .unwrap();
            assert!(pool.status().active <= 2);
            session.close().await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let status = pool.status();
    assert_eq!(status.active, 0);
    assert!(status.idle <= 2);
    assert_eq!(status.max_active, 2);
}
