//! sqlsession - Main entry point.
//!
//! Runs SQL statements through one session on a pooled (or unpooled) data
//! source and prints the results, batch results and pool status as JSON.

use sqlsession::cache::CacheBuilder;
use sqlsession::config::Config;
use sqlsession::db::{DataSource, PooledDataSource, SqlxDriver, UnpooledDataSource};
use sqlsession::models::{MappedStatement, SqlCommandType, StaticSqlSource};
use sqlsession::session::{Configuration, SessionFactory};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Classify a statement by its leading keyword.
fn command_type(sql: &str) -> SqlCommandType {
    let keyword = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match keyword.as_str() {
        "select" | "with" | "values" | "show" | "explain" | "pragma" => SqlCommandType::Select,
        "insert" | "replace" => SqlCommandType::Insert,
        "update" => SqlCommandType::Update,
        "delete" => SqlCommandType::Delete,
        _ => SqlCommandType::Unknown,
    }
}

fn build_configuration(config: &Config) -> Result<Configuration, Box<dyn std::error::Error>> {
    let mut configuration = Configuration::new()
        .with_cache_enabled(config.second_level_cache)
        .with_local_cache_scope(config.local_cache_scope)
        .with_default_executor_type(config.executor);

    let cache = if config.second_level_cache {
        let cache = CacheBuilder::new("cli").build();
        configuration.add_cache(Arc::clone(&cache))?;
        Some(cache)
    } else {
        None
    };

    for (idx, sql) in config.statements.iter().enumerate() {
        let mut ms = MappedStatement::new(
            format!("cli.{}", idx + 1),
            command_type(sql),
            StaticSqlSource::new(sql.as_str()),
        );
        if let Some(cache) = &cache {
            ms = ms.with_cache(Arc::clone(cache));
        }
        configuration.add_mapped_statement(ms)?;
    }
    Ok(configuration)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    if config.enable_logs {
        init_tracing(&config);
    }

    let data_source_config = config.data_source()?;
    data_source_config.pool_options.validate()?;

    info!(
        url = %data_source_config.connection.masked_url(),
        pooled = data_source_config.pooled,
        executor = %config.executor,
        "Starting sqlsession v{}",
        env!("CARGO_PKG_VERSION")
    );

    let configuration = build_configuration(&config)?;
    let driver = Arc::new(SqlxDriver);
    let pool = data_source_config.pooled.then(|| {
        Arc::new(PooledDataSource::new(
            driver.clone(),
            data_source_config.connection.clone(),
            data_source_config.pool_options.clone(),
        ))
    });
    let data_source: Arc<dyn DataSource> = match &pool {
        Some(pool) => pool.clone(),
        None => Arc::new(UnpooledDataSource::new(
            driver,
            data_source_config.connection.clone(),
        )),
    };

    let factory = SessionFactory::new(configuration, data_source);
    let mut session = factory.open_session(config.executor, config.autocommit);

    let mut results = Vec::new();
    let outcome: Result<(), sqlsession::DbError> = async {
        for round in 1..=config.repeat.max(1) {
            for idx in 0..config.statements.len() {
                let id = format!("cli.{}", idx + 1);
                let ms = factory.configuration().mapped_statement(&id)?;
                let result = if ms.command_type == SqlCommandType::Select {
                    json!({
                        "round": round,
                        "statement": id,
                        "rows": session.select_list(&id, &JsonValue::Null).await?,
                    })
                } else {
                    json!({
                        "round": round,
                        "statement": id,
                        "outcome": session.update(&id, &JsonValue::Null).await?,
                    })
                };
                results.push(result);
            }
        }
        Ok(())
    }
    .await;

    let flushed = match outcome {
        Ok(()) => session.flush_statements().await,
        Err(e) => Err(e),
    };
    let finished = match flushed {
        Ok(batches) => {
            let ended = if config.dry_run {
                session.rollback_with(true).await
            } else {
                session.commit().await
            };
            ended.map(|()| batches)
        }
        Err(e) => Err(e),
    };
    session.close().await;

    let batches = match finished {
        Ok(batches) => batches,
        Err(e) => {
            error!(error = %e, "Statement execution failed");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Hint: {}", suggestion);
            }
            return Err(e.into());
        }
    };

    let report = json!({
        "results": results,
        "batches": batches,
        "pool": pool.as_ref().map(|p| p.status()),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(pool) = pool {
        pool.force_close_all().await;
    }
    info!("Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_type_from_keyword() {
        assert_eq!(command_type("  SELECT 1"), SqlCommandType::Select);
        assert_eq!(command_type("with x as (select 1) select * from x"), SqlCommandType::Select);
        assert_eq!(command_type("INSERT INTO t VALUES (1)"), SqlCommandType::Insert);
        assert_eq!(command_type("delete from t"), SqlCommandType::Delete);
        assert_eq!(command_type("CREATE TABLE t (a INT)"), SqlCommandType::Unknown);
        assert_eq!(command_type(""), SqlCommandType::Unknown);
    }
}
