//! Parameter values and parameter bindings.
//!
//! `QueryParam` is the value type that flows through the whole runtime: it is
//! bound to prepared statements, written into cache keys and carried back out
//! of callable statements as OUT values.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// A parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Ordered list of values. Cache keys flatten these element by element.
    Array(Vec<QueryParam>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Array(_) => "array",
        }
    }

    /// Convert a JSON value into a parameter.
    ///
    /// Objects have no direct SQL counterpart and are bound as their JSON text.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Self::String(s.clone()),
            JsonValue::Array(items) => Self::Array(items.iter().map(Self::from_json).collect()),
            JsonValue::Object(_) => Self::String(value.to_string()),
        }
    }

    /// Convert this parameter into a JSON value.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Int(i) => JsonValue::Number((*i).into()),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(f.to_string())),
            Self::String(s) => JsonValue::String(s.clone()),
            Self::Bytes(b) => {
                use base64::{Engine as _, engine::general_purpose::STANDARD};
                JsonValue::String(STANDARD.encode(b))
            }
            Self::Array(items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
        }
    }
}

impl fmt::Display for QueryParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(s) => write!(f, "{}", s),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for QueryParam {
    fn from(v: usize) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Direction of a statement parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterMode {
    #[default]
    In,
    Out,
    InOut,
}

impl ParameterMode {
    /// Whether the parameter carries a value into the statement.
    pub fn is_input(&self) -> bool {
        !matches!(self, Self::Out)
    }

    /// Whether the statement writes a value back for this parameter.
    pub fn is_output(&self) -> bool {
        !matches!(self, Self::In)
    }
}

/// One positional parameter of a resolved statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBinding {
    /// Property of the parameter object this binding reads from and, for
    /// OUT parameters, writes back to.
    pub property: String,
    #[serde(default)]
    pub mode: ParameterMode,
    pub value: QueryParam,
}

impl ParameterBinding {
    /// Create an IN binding.
    pub fn input(property: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        Self {
            property: property.into(),
            mode: ParameterMode::In,
            value: value.into(),
        }
    }

    /// Create an OUT binding. Its value is bound as NULL.
    pub fn output(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            mode: ParameterMode::Out,
            value: QueryParam::Null,
        }
    }

    /// Create an INOUT binding.
    pub fn in_out(property: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        Self {
            property: property.into(),
            mode: ParameterMode::InOut,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_numbers() {
        assert_eq!(QueryParam::from_json(&json!(42)), QueryParam::Int(42));
        assert_eq!(QueryParam::from_json(&json!(1.5)), QueryParam::Float(1.5));
        assert_eq!(QueryParam::from_json(&json!(null)), QueryParam::Null);
    }

    #[test]
    fn test_from_json_object_binds_as_text() {
        let param = QueryParam::from_json(&json!({"a": 1}));
        assert_eq!(param, QueryParam::String("{\"a\":1}".to_string()));
    }

    #[test]
    fn test_display_array() {
        let param = QueryParam::Array(vec![1.into(), "x".into(), QueryParam::Null]);
        assert_eq!(param.to_string(), "[1, x, null]");
    }

    #[test]
    fn test_parameter_mode_direction() {
        assert!(ParameterMode::In.is_input());
        assert!(!ParameterMode::In.is_output());
        assert!(!ParameterMode::Out.is_input());
        assert!(ParameterMode::InOut.is_input() && ParameterMode::InOut.is_output());
    }

    #[test]
    fn test_bytes_serialize_as_base64() {
        let value = serde_json::to_value(QueryParam::Bytes(b"hi".to_vec())).unwrap();
        assert_eq!(value, json!("aGk="));
    }
}
