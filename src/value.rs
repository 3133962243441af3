//! Driver-native values and ad hoc coercion helpers.
//!
//! Raw row queries hand back heterogeneous values: an id column may arrive as
//! a 64-bit integer or as a decimal string, text as either TEXT or BLOB. The
//! `Value` enum captures what the driver returned and the `as_*` helpers do
//! the forgiving coercions row-specialization code needs.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};

use crate::error::Result;

/// One driver-native column value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Column name → driver value, for one row.
pub type RowMap = HashMap<String, Value>;

impl Value {
    /// Coerce an identifier that may arrive as an integer or as a decimal
    /// string (text or bytes). Null and anything unparseable yield `0`.
    pub fn as_id(&self) -> u64 {
        match self {
            Value::Integer(i) => {
                if *i < 0 {
                    0
                } else {
                    *i as u64
                }
            }
            Value::Text(s) => s.trim().parse().unwrap_or(0),
            Value::Blob(b) => String::from_utf8_lossy(b).trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Coerce a timestamp: RFC 3339 or `YYYY-MM-DD HH:MM:SS[.fff]` text, or
    /// unix seconds as an integer. Null and mismatched types yield `None`.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Text(s) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    return Some(dt.with_timezone(&Utc));
                }
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }
            Value::Integer(secs) => DateTime::from_timestamp(*secs, 0),
            _ => None,
        }
    }

    /// Coerce a text value that may arrive as TEXT or BLOB. Null and
    /// mismatched types yield the empty string.
    pub fn as_text(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
            _ => String::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Lossy conversion into a JSON value, used by the default
    /// row-specialization path.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Real(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Blob(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
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

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

/// Build a `Vec<Value>` argument list for `Orm::filter` and friends.
///
/// ```ignore
/// orm.filter("name = ? AND age > ?", params!["Alice", 21]);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        Vec::<$crate::value::Value>::new()
    };
    ($($v:expr),+ $(,)?) => {
        vec![$($crate::value::Value::from($v)),+]
    };
}

/// Materialize one row into a column-name → driver-value map, decoding by
/// the value's runtime storage class.
pub fn row_to_map(row: &SqliteRow) -> Result<RowMap> {
    let mut map = RowMap::with_capacity(row.columns().len());
    for (i, col) in row.columns().iter().enumerate() {
        let kind = {
            let raw = row.try_get_raw(i)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_string())
            }
        };
        let value = match kind.as_deref() {
            None => Value::Null,
            Some("INTEGER") | Some("BOOLEAN") => Value::Integer(row.try_get(i)?),
            Some("REAL") | Some("NUMERIC") => Value::Real(row.try_get(i)?),
            Some("BLOB") => Value::Blob(row.try_get(i)?),
            Some(_) => Value::Text(row.try_get(i)?),
        };
        map.insert(col.name().to_string(), value);
    }
    Ok(map)
}

/// Bind a driver value onto a prepared query.
pub(crate) fn bind_value<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<i64>),
        Value::Integer(i) => query.bind(*i),
        Value::Real(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
        Value::Blob(b) => query.bind(b.clone()),
    }
}

/// Bind a JSON value (from a change-set or a serialized entity field) onto a
/// prepared query. Arrays and objects are stored as their JSON text.
pub(crate) fn bind_json<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &serde_json::Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        serde_json::Value::Null => query.bind(None::<i64>),
        serde_json::Value::Bool(b) => query.bind(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}
