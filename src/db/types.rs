//! Row decoding for the sqlx-backed connections.
//!
//! Decoding is two-phase:
//! 1. `TypeCategory` classifies the column's type name
//! 2. a backend-specific decoder extracts the value for that category
//!
//! Only the minimal mapping needed to hand rows to a result mapper is done
//! here: numbers, booleans, text, JSON and base64 for binary columns.
//! Anything unrecognized is read as text.

use crate::models::DatabaseType;
use crate::models::Row as JsonRow;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Checked first: "numeric" would otherwise fall through to float
    if lower.contains("decimal") || lower.contains("numeric") {
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }
    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower == "uuid" {
        return TypeCategory::Uuid;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    if lower.contains("char") || lower.contains("text") {
        return TypeCategory::Text;
    }
    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// DECIMAL/NUMERIC value kept as its exact textual representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

// =============================================================================
// Binary Encoding
// =============================================================================

/// Binary column values are handed to mappers as base64 text.
pub fn decode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

// =============================================================================
// Row to JSON Trait
// =============================================================================

/// Converts a fetched driver row into a column-ordered JSON map.
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

macro_rules! impl_row_to_json {
    ($row:ty, $db:expr, $decoder:path) => {
        impl RowToJson for $row {
            fn to_json_map(&self) -> JsonRow {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let type_name = col.type_info().name();
                        let value = if is_null_at(self, idx) {
                            JsonValue::Null
                        } else {
                            $decoder(self, idx, categorize_type(type_name, $db))
                        };
                        (col.name().to_string(), value)
                    })
                    .collect()
            }
        }
    };
}

impl_row_to_json!(MySqlRow, DatabaseType::MySql, mysql::decode_column);
impl_row_to_json!(PgRow, DatabaseType::Postgres, postgres::decode_column);
impl_row_to_json!(SqliteRow, DatabaseType::SQLite, sqlite::decode_column);

fn is_null_at<R: Row>(row: &R, idx: usize) -> bool
where
    usize: sqlx::ColumnIndex<R>,
{
    row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true)
}

/// Text fallback shared by all backends.
fn decode_text<R>(row: &R, idx: usize) -> JsonValue
where
    R: Row,
    usize: sqlx::ColumnIndex<R>,
    for<'r> String: Decode<'r, R::Database> + Type<R::Database>,
{
    match row.try_get::<String, _>(idx) {
        Ok(v) => JsonValue::String(v),
        Err(e) => {
            tracing::debug!(column = idx, error = %e, "Column is not decodable as text");
            JsonValue::Null
        }
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => match row.try_get::<RawDecimal, _>(idx) {
                Ok(v) => JsonValue::String(v.0),
                Err(e) => {
                    tracing::error!("Failed to decode DECIMAL: {:?}", e);
                    JsonValue::Null
                }
            },
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row
                .try_get::<bool, _>(idx)
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float => row
                .try_get::<f64, _>(idx)
                .or_else(|_| row.try_get::<f32, _>(idx).map(f64::from))
                .map(float_value)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Binary => row
                .try_get::<Vec<u8>, _>(idx)
                .map(|v| decode_binary_value(&v))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Json => row
                .try_get::<JsonValue, _>(idx)
                .unwrap_or(JsonValue::Null),
            _ => decode_text(row, idx),
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(v) = row.try_get::<i8, _>(idx) {
            return JsonValue::Number(v.into());
        }
        // UNSIGNED columns only decode as unsigned types
        if let Ok(v) = row.try_get::<u64, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(v) = row.try_get::<u32, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(v) = row.try_get::<u16, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(v) = row.try_get::<u8, _>(idx) {
            return JsonValue::Number(v.into());
        }
        JsonValue::Null
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => match row.try_get::<RawDecimal, _>(idx) {
                Ok(v) => JsonValue::String(v.0),
                Err(e) => {
                    tracing::error!("Failed to decode NUMERIC: {:?}", e);
                    JsonValue::Null
                }
            },
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row
                .try_get::<bool, _>(idx)
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float => row
                .try_get::<f64, _>(idx)
                .or_else(|_| row.try_get::<f32, _>(idx).map(f64::from))
                .map(float_value)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Binary => row
                .try_get::<Vec<u8>, _>(idx)
                .map(|v| decode_binary_value(&v))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Json => row
                .try_get::<JsonValue, _>(idx)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Uuid => decode_uuid(row, idx),
            _ => decode_text(row, idx),
        }
    }

    /// 16 raw bytes for prepared statements, hyphenated text for plain ones.
    fn decode_uuid(row: &PgRow, idx: usize) -> JsonValue {
        let Ok(raw) = row.try_get_raw(idx) else {
            return JsonValue::Null;
        };
        if raw.is_null() {
            return JsonValue::Null;
        }
        let parsed = match raw.as_bytes() {
            Ok(bytes) if bytes.len() == 16 => uuid::Uuid::from_slice(bytes).ok(),
            Ok(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| uuid::Uuid::parse_str(s).ok()),
            Err(_) => None,
        };
        parsed
            .map(|u| JsonValue::String(u.to_string()))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_integer(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return JsonValue::Number(v.into());
        }
        JsonValue::Null
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Integer => row
                .try_get::<i64, _>(idx)
                .map(|v| JsonValue::Number(v.into()))
                .unwrap_or_else(|_| decode_dynamic(row, idx)),
            TypeCategory::Boolean => row
                .try_get::<bool, _>(idx)
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float | TypeCategory::Decimal => row
                .try_get::<f64, _>(idx)
                .map(float_value)
                .unwrap_or_else(|_| decode_dynamic(row, idx)),
            TypeCategory::Binary => row
                .try_get::<Vec<u8>, _>(idx)
                .map(|v| decode_binary_value(&v))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Text | TypeCategory::Json => decode_text(row, idx),
            _ => decode_dynamic(row, idx),
        }
    }

    /// SQLite values carry their own storage class; expressions such as
    /// `SELECT 1` or `count(*)` report no declared type at all.
    fn decode_dynamic(row: &SqliteRow, idx: usize) -> JsonValue {
        let storage = row
            .try_get_raw(idx)
            .map(|v| v.type_info().name().to_uppercase())
            .unwrap_or_default();
        match storage.as_str() {
            "INTEGER" => row
                .try_get_unchecked::<i64, _>(idx)
                .map(|v| JsonValue::Number(v.into()))
                .unwrap_or(JsonValue::Null),
            "REAL" => row
                .try_get_unchecked::<f64, _>(idx)
                .map(float_value)
                .unwrap_or(JsonValue::Null),
            "BLOB" => row
                .try_get_unchecked::<Vec<u8>, _>(idx)
                .map(|v| decode_binary_value(&v))
                .unwrap_or(JsonValue::Null),
            _ => row
                .try_get_unchecked::<String, _>(idx)
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
        }
    }
}
