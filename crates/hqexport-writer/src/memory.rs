//! In-memory writer used by tests and the JSON output format.

use std::collections::BTreeMap;

use hqexport_types::sqltype::SqlType;
use hqexport_types::table::{Row, TableSpec};
use hqexport_types::writer::{TableWriter, WriterError};

/// One accumulated table.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub headings: Vec<String>,
    pub data_types: Vec<SqlType>,
    pub rows: Vec<Row>,
}

/// Accumulates every emitted batch in memory. Batches for the same
/// table name append; the widest heading list wins.
#[derive(Debug, Default)]
pub struct InMemoryWriter {
    tables: BTreeMap<String, MemoryTable>,
}

impl InMemoryWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn tables(&self) -> &BTreeMap<String, MemoryTable> {
        &self.tables
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MemoryTable> {
        self.tables.get(name)
    }

    /// Render everything written so far as the JSON output document:
    /// an array of `{name, headings, rows}` objects.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.tables
                .iter()
                .map(|(name, table)| {
                    serde_json::json!({
                        "name": name,
                        "headings": table.headings,
                        "rows": table.rows,
                    })
                })
                .collect(),
        )
    }
}

impl TableWriter for InMemoryWriter {
    fn write_table(&mut self, table: &TableSpec) -> Result<(), WriterError> {
        let rows = table.rows.collect()?;
        let entry = self.tables.entry(table.name.clone()).or_default();
        if table.headings.len() > entry.headings.len() {
            entry.headings = table.headings.clone();
            entry.data_types = table.data_types.clone();
        }
        entry.rows.extend(rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hqexport_types::table::TableRows;
    use serde_json::json;

    fn spec(name: &str, headings: &[&str], rows: Vec<Row>) -> TableSpec {
        let mut spec = TableSpec::new(name, headings.iter().map(|&h| h.into()).collect());
        spec.rows = TableRows::from_vec(rows);
        spec
    }

    #[test]
    fn batches_for_the_same_table_append() {
        let mut w = InMemoryWriter::new();
        w.write_table(&spec("t", &["id"], vec![vec![json!("1")]]))
            .unwrap();
        w.write_table(&spec("t", &["id"], vec![vec![json!("2")]]))
            .unwrap();
        assert_eq!(w.get("t").unwrap().rows.len(), 2);
    }

    #[test]
    fn widest_headings_win() {
        let mut w = InMemoryWriter::new();
        w.write_table(&spec("t", &["id"], vec![vec![json!("1")]]))
            .unwrap();
        w.write_table(&spec(
            "t",
            &["id", "name"],
            vec![vec![json!("2"), json!("x")]],
        ))
        .unwrap();
        assert_eq!(w.get("t").unwrap().headings, vec!["id", "name"]);
    }

    #[test]
    fn json_document_lists_tables_in_name_order() {
        let mut w = InMemoryWriter::new();
        w.write_table(&spec("zeta", &["id"], vec![])).unwrap();
        w.write_table(&spec("alpha", &["id"], vec![vec![json!("1")]]))
            .unwrap();
        let doc = w.to_json();
        assert_eq!(doc[0]["name"], "alpha");
        assert_eq!(doc[1]["name"], "zeta");
        assert_eq!(doc[1]["rows"], json!([]));
    }
}
