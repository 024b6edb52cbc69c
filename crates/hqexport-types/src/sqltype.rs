//! SQL column types and the fixed widening lattice.
//!
//! Widening order: `boolean ⊂ integer ⊂ decimal ⊂ text`. `datetime`
//! widens only to `text`; `json` absorbs everything it meets.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical column type carried by emitted tables and the SQL writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    Boolean,
    Integer,
    Decimal,
    Datetime,
    Text,
    Json,
}

impl SqlType {
    /// Wire-format string, matching the `data_types` spellings accepted
    /// in query files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Datetime => "datetime",
            Self::Text => "text",
            Self::Json => "json",
        }
    }

    /// Parse a declared data type from a query file.
    ///
    /// Accepts a few aliases (`bool`, `number`, `date`) for
    /// compatibility with hand-written queries.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Some(Self::Boolean),
            "integer" | "int" => Some(Self::Integer),
            "decimal" | "number" => Some(Self::Decimal),
            "datetime" | "date" => Some(Self::Datetime),
            "text" | "string" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Infer a column type from a JSON cell value.
    ///
    /// Returns `None` for nulls, which carry no type information.
    #[must_use]
    pub fn infer(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Boolean),
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    Some(Self::Integer)
                } else {
                    Some(Self::Decimal)
                }
            }
            Value::String(_) => Some(Self::Text),
            Value::Array(_) | Value::Object(_) => Some(Self::Json),
        }
    }

    fn numeric_rank(self) -> Option<u8> {
        match self {
            Self::Boolean => Some(0),
            Self::Integer => Some(1),
            Self::Decimal => Some(2),
            Self::Text => Some(3),
            Self::Datetime | Self::Json => None,
        }
    }

    /// Smallest type that can hold both `self` and `other`.
    #[must_use]
    pub fn widened(self, other: Self) -> Self {
        if self == other {
            return self;
        }
        if self == Self::Json || other == Self::Json {
            return Self::Json;
        }
        match (self.numeric_rank(), other.numeric_rank()) {
            (Some(a), Some(b)) => {
                if a >= b {
                    self
                } else {
                    other
                }
            }
            // datetime meeting anything else degrades to text
            _ => Self::Text,
        }
    }

    /// `true` if a column of type `self` can hold values of `other`
    /// without widening.
    #[must_use]
    pub fn accepts(self, other: Self) -> bool {
        self.widened(other) == self
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
