//! Backend abstraction for the SQL writer.
//!
//! A backend executes the four DDL/DML shapes the writer needs
//! (reflect, create, alter, upsert); the writer owns the schema
//! evolution policy and the row batching.

use chrono::NaiveDateTime;
use hqexport_types::checkpoint::parse_timestamp;
use hqexport_types::sqltype::SqlType;
use hqexport_types::writer::WriterError;

/// One destination column with its logical type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: SqlType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: SqlType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A cell value coerced to the shape its column expects. Each variant
/// carries `Option` so NULLs bind with the right parameter type.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Bool(Option<bool>),
    Int(Option<i64>),
    Float(Option<f64>),
    Text(Option<String>),
    Timestamp(Option<NaiveDateTime>),
    Json(Option<serde_json::Value>),
}

impl SqlValue {
    fn null_of(ty: SqlType) -> Self {
        match ty {
            SqlType::Boolean => Self::Bool(None),
            SqlType::Integer => Self::Int(None),
            SqlType::Decimal => Self::Float(None),
            SqlType::Datetime => Self::Timestamp(None),
            SqlType::Text => Self::Text(None),
            SqlType::Json => Self::Json(None),
        }
    }
}

/// Executes schema and row operations against one destination
/// database.
pub trait SqlBackend {
    /// Reflect an existing table. `Ok(None)` when the table does not
    /// exist yet.
    fn table_columns(&mut self, table: &str) -> Result<Option<Vec<Column>>, WriterError>;

    /// Create `table` with the given columns; `id` becomes the
    /// primary key.
    fn create_table(&mut self, table: &str, columns: &[Column]) -> Result<(), WriterError>;

    fn add_column(&mut self, table: &str, column: &Column) -> Result<(), WriterError>;

    /// Change an existing column to a wider type.
    fn widen_column(&mut self, table: &str, column: &Column) -> Result<(), WriterError>;

    /// Insert rows, updating in place on `id` collision. `rows` are
    /// positional with `columns`.
    fn upsert(
        &mut self,
        table: &str,
        columns: &[Column],
        rows: &[Vec<SqlValue>],
    ) -> Result<(), WriterError>;
}

/// Quote an identifier for interpolation into SQL text. Both backends
/// accept double-quoted identifiers with embedded quotes doubled.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Coerce a JSON cell to the shape of its destination column.
///
/// Mismatched cells degrade rather than abort: an unparseable integer
/// or timestamp becomes NULL with a warning, since a single bad cell
/// should not sink a batch.
pub(crate) fn cell_to_sql(value: &serde_json::Value, ty: SqlType) -> SqlValue {
    use serde_json::Value;
    if value.is_null() {
        return SqlValue::null_of(ty);
    }
    match ty {
        SqlType::Boolean => SqlValue::Bool(Some(match value {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => matches!(s.trim(), "true" | "t" | "1"),
            _ => false,
        })),
        SqlType::Integer => {
            let parsed = match value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
                Value::Bool(b) => Some(i64::from(*b)),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            };
            if parsed.is_none() {
                tracing::warn!(cell = %value, "cell does not fit integer column, writing NULL");
            }
            SqlValue::Int(parsed)
        }
        SqlType::Decimal => {
            let parsed = match value {
                Value::Number(n) => n.as_f64(),
                Value::Bool(b) => Some(f64::from(u8::from(*b))),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            };
            if parsed.is_none() {
                tracing::warn!(cell = %value, "cell does not fit decimal column, writing NULL");
            }
            SqlValue::Float(parsed)
        }
        SqlType::Datetime => {
            let parsed = value.as_str().and_then(parse_timestamp);
            if parsed.is_none() {
                tracing::warn!(cell = %value, "cell does not parse as a timestamp, writing NULL");
            }
            SqlValue::Timestamp(parsed)
        }
        SqlType::Text => SqlValue::Text(Some(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        SqlType::Json => SqlValue::Json(Some(value.clone())),
    }
}
