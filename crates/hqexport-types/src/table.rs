//! Emitted table model.
//!
//! A [`TableSpec`] couples a table's shape (name, headings, declared
//! types) with a restartable row stream. Writers pull rows lazily;
//! merging specs for the same table compares shape only.

use crate::sqltype::SqlType;
use std::fmt;
use std::rc::Rc;

/// One emitted row, cells already coerced to JSON scalars.
pub type Row = Vec<serde_json::Value>;

type RowIter = Box<dyn Iterator<Item = anyhow::Result<Row>>>;

/// Restartable stream of rows.
///
/// Each call to [`TableRows::iter`] invokes the producer again, so a
/// writer that needs two passes re-runs the upstream evaluation
/// rather than buffering.
#[derive(Clone)]
pub struct TableRows {
    producer: Rc<dyn Fn() -> RowIter>,
}

impl TableRows {
    pub fn new(producer: impl Fn() -> RowIter + 'static) -> Self {
        Self {
            producer: Rc::new(producer),
        }
    }

    /// Stream with no rows.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(|| Box::new(std::iter::empty()))
    }

    /// Buffered stream over an already-materialized batch.
    #[must_use]
    pub fn from_vec(rows: Vec<Row>) -> Self {
        Self::new(move || Box::new(rows.clone().into_iter().map(Ok)))
    }

    /// Start a fresh pass over the rows.
    #[must_use]
    pub fn iter(&self) -> RowIter {
        (self.producer)()
    }

    /// Materialize every row, stopping at the first error.
    pub fn collect(&self) -> anyhow::Result<Vec<Row>> {
        self.iter().collect()
    }
}

impl Default for TableRows {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for TableRows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TableRows(..)")
    }
}

/// Shape and content of one emitted table.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub headings: Vec<String>,
    /// Declared column types, positional with `headings`. Shorter than
    /// `headings` when only a prefix was declared.
    pub data_types: Vec<SqlType>,
    pub rows: TableRows,
}

impl TableSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, headings: Vec<String>) -> Self {
        Self {
            name: name.into(),
            headings,
            data_types: Vec::new(),
            rows: TableRows::empty(),
        }
    }

    /// Declared type for the column at `idx`, if one was given.
    #[must_use]
    pub fn declared_type(&self, idx: usize) -> Option<SqlType> {
        self.data_types.get(idx).copied()
    }
}

// Equality is shape-only; two specs for the same table with different
// row batches compare equal.
impl PartialEq for TableSpec {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.headings == other.headings
            && self.data_types == other.data_types
    }
}

impl Eq for TableSpec {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_restart_from_the_top() {
        let rows = TableRows::from_vec(vec![vec![json!(1)], vec![json!(2)]]);
        let first: Vec<Row> = rows.collect().unwrap();
        let second: Vec<Row> = rows.collect().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn table_spec_equality_ignores_rows() {
        let mut a = TableSpec::new("forms", vec!["id".into(), "name".into()]);
        let mut b = a.clone();
        a.rows = TableRows::from_vec(vec![vec![json!("x"), json!("y")]]);
        b.rows = TableRows::empty();
        assert_eq!(a, b);

        let mut c = b.clone();
        c.headings.push("extra".into());
        assert_ne!(a, c);
    }

    #[test]
    fn declared_type_prefix() {
        let mut spec = TableSpec::new("t", vec!["id".into(), "n".into()]);
        spec.data_types = vec![SqlType::Text];
        assert_eq!(spec.declared_type(0), Some(SqlType::Text));
        assert_eq!(spec.declared_type(1), None);
    }
}
