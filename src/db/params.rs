//! Parameter binding for the sqlx-backed connections.
//!
//! Scalars bind natively on every backend. Arrays have no portable SQL
//! counterpart: they bind as a JSON document where the backend has a JSON
//! type and as JSON text on SQLite.

use crate::models::QueryParam;
use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

fn array_json(items: &[QueryParam]) -> JsonValue {
    JsonValue::Array(items.iter().map(QueryParam::to_json).collect())
}

/// Generates `fn $name(query, param) -> query` for one backend; `$array`
/// maps the JSON form of an array parameter to the bound value.
macro_rules! bind_fn {
    ($(#[$meta:meta])* $name:ident, $db:ty, $args:ty, |$json:ident| $array:expr) => {
        $(#[$meta])*
        pub(crate) fn $name<'q>(query: Query<'q, $db, $args>, param: &'q QueryParam) -> Query<'q, $db, $args> {
            match param {
                QueryParam::Null => query.bind(None::<String>),
                QueryParam::Bool(v) => query.bind(*v),
                QueryParam::Int(v) => query.bind(*v),
                QueryParam::Float(v) => query.bind(*v),
                QueryParam::String(v) => query.bind(v.as_str()),
                QueryParam::Bytes(v) => query.bind(v.as_slice()),
                QueryParam::Array(items) => {
                    let $json = array_json(items);
                    query.bind($array)
                }
            }
        }
    };
}

bind_fn!(
    /// Bind a parameter to a MySQL query.
    bind_mysql_param, MySql, MySqlArguments, |json| Json(json)
);

bind_fn!(
    /// Bind a parameter to a PostgreSQL query.
    bind_postgres_param, Postgres, PgArguments, |json| Json(json)
);

bind_fn!(
    /// Bind a parameter to a SQLite query.
    bind_sqlite_param, Sqlite, SqliteArguments<'q>, |json| json.to_string()
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_json_keeps_order_and_nulls() {
        let items = vec![QueryParam::Int(3), QueryParam::Null, "x".into()];
        assert_eq!(array_json(&items), serde_json::json!([3, null, "x"]));
    }
}
