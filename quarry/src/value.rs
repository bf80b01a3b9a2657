use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;

use crate::error::{QuarryError, QuarryResult};

/// A scalar database value as it travels between the core and a driver.
///
/// Parameters are always bound as `Value`s, never interpolated into SQL
/// text, and hydrated rows arrive as maps of `Value`s.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    DateTime(DateTime<FixedOffset>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Best-effort integer view, used for generated-key demultiplexing.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Uuid(u) => write!(f, "{u}"),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Value::Json(j) => write!(f, "{j}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Value::DateTime(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Logical type tag of a mapped column. Drives the bidirectional value
/// coercion between application values and the wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Decimal,
    Text,
    Bytes,
    Uuid,
    DateTime,
    Json,
    /// Closed set of allowed string values.
    Enum(Vec<String>),
    /// Comma-joined list stored in a single text column.
    SimpleArray,
}

impl ColumnType {
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Bool => "bool",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Decimal => "decimal",
            ColumnType::Text => "text",
            ColumnType::Bytes => "bytes",
            ColumnType::Uuid => "uuid",
            ColumnType::DateTime => "datetime",
            ColumnType::Json => "json",
            ColumnType::Enum(_) => "enum",
            ColumnType::SimpleArray => "simple-array",
        }
    }

    /// Coerce an application value into its persistent representation.
    pub fn prepare_persistent(&self, value: Value, column: &str) -> QuarryResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            ColumnType::Json => match value {
                Value::Json(j) => Ok(Value::Text(j.to_string())),
                Value::Text(s) => Ok(Value::Text(s)),
                other => Err(conversion_error(column, "json", &other)),
            },
            ColumnType::SimpleArray => match value {
                Value::Json(serde_json::Value::Array(items)) => {
                    let parts: Vec<String> = items
                        .iter()
                        .map(|item| match item {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                    Ok(Value::Text(parts.join(",")))
                }
                Value::Text(s) => Ok(Value::Text(s)),
                other => Err(conversion_error(column, "simple-array", &other)),
            },
            ColumnType::Enum(allowed) => match value {
                Value::Text(s) if allowed.contains(&s) => Ok(Value::Text(s)),
                other => Err(conversion_error(column, "enum", &other)),
            },
            ColumnType::Uuid => match value {
                Value::Uuid(u) => Ok(Value::Uuid(u)),
                Value::Text(s) => uuid::Uuid::parse_str(&s)
                    .map(Value::Uuid)
                    .map_err(|_| conversion_error(column, "uuid", &Value::Text(s))),
                other => Err(conversion_error(column, "uuid", &other)),
            },
            ColumnType::Bool => match value {
                Value::Bool(b) => Ok(Value::Bool(b)),
                Value::Int(i) => Ok(Value::Bool(i != 0)),
                other => Err(conversion_error(column, "bool", &other)),
            },
            _ => Ok(value),
        }
    }

    /// Coerce a wire value back into its application representation.
    pub fn prepare_hydrated(&self, value: Value, column: &str) -> QuarryResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            ColumnType::Json => match value {
                Value::Json(j) => Ok(Value::Json(j)),
                Value::Text(s) => serde_json::from_str(&s)
                    .map(Value::Json)
                    .map_err(|_| conversion_error(column, "json", &Value::Text(s))),
                other => Err(conversion_error(column, "json", &other)),
            },
            ColumnType::SimpleArray => match value {
                Value::Text(s) => {
                    let items: Vec<serde_json::Value> = if s.is_empty() {
                        Vec::new()
                    } else {
                        s.split(',')
                            .map(|part| serde_json::Value::String(part.to_string()))
                            .collect()
                    };
                    Ok(Value::Json(serde_json::Value::Array(items)))
                }
                other => Err(conversion_error(column, "simple-array", &other)),
            },
            ColumnType::DateTime => match value {
                Value::DateTime(dt) => Ok(Value::DateTime(dt)),
                Value::Text(s) => DateTime::parse_from_rfc3339(&s)
                    .map(Value::DateTime)
                    .map_err(|_| conversion_error(column, "datetime", &Value::Text(s))),
                other => Err(conversion_error(column, "datetime", &other)),
            },
            ColumnType::Uuid => match value {
                Value::Uuid(u) => Ok(Value::Uuid(u)),
                Value::Text(s) => uuid::Uuid::parse_str(&s)
                    .map(Value::Uuid)
                    .map_err(|_| conversion_error(column, "uuid", &Value::Text(s))),
                other => Err(conversion_error(column, "uuid", &other)),
            },
            ColumnType::Bool => match value {
                Value::Bool(b) => Ok(Value::Bool(b)),
                Value::Int(i) => Ok(Value::Bool(i != 0)),
                other => Err(conversion_error(column, "bool", &other)),
            },
            ColumnType::Int => match value {
                Value::Int(i) => Ok(Value::Int(i)),
                Value::Text(s) => s
                    .parse()
                    .map(Value::Int)
                    .map_err(|_| conversion_error(column, "int", &Value::Text(s))),
                other => Err(conversion_error(column, "int", &other)),
            },
            _ => Ok(value),
        }
    }
}

fn conversion_error(column: &str, to_type: &str, value: &Value) -> QuarryError {
    QuarryError::TypeConversion {
        column: column.to_string(),
        to_type: to_type.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_array_round_trips_through_text() {
        let ty = ColumnType::SimpleArray;
        let value = Value::Json(serde_json::json!(["cars", "germany"]));
        let stored = ty.prepare_persistent(value.clone(), "tags").unwrap();
        assert_eq!(stored, Value::Text("cars,germany".to_string()));
        let hydrated = ty.prepare_hydrated(stored, "tags").unwrap();
        assert_eq!(hydrated, value);
    }

    #[test]
    fn enum_rejects_unknown_variant() {
        let ty = ColumnType::Enum(vec!["draft".into(), "published".into()]);
        assert!(ty
            .prepare_persistent(Value::Text("archived".into()), "status")
            .is_err());
    }

    #[test]
    fn datetime_hydrates_from_rfc3339_text() {
        let ty = ColumnType::DateTime;
        let hydrated = ty
            .prepare_hydrated(Value::Text("2024-03-01T10:00:00+00:00".into()), "created_at")
            .unwrap();
        assert!(matches!(hydrated, Value::DateTime(_)));
    }

    #[test]
    fn null_passes_through_both_directions() {
        let ty = ColumnType::Json;
        assert_eq!(ty.prepare_persistent(Value::Null, "meta").unwrap(), Value::Null);
        assert_eq!(ty.prepare_hydrated(Value::Null, "meta").unwrap(), Value::Null);
    }
}
