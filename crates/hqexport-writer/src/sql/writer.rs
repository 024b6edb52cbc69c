//! The SQL table writer: schema evolution plus idempotent upsert.
//!
//! Tables are created from the first batch (declared `data_types` win
//! over inference), grow columns as later batches introduce them, and
//! widen column types along the fixed lattice. Rows land via upsert
//! keyed on `id`, so re-running a window is safe.

use std::collections::HashMap;

use hqexport_types::sqltype::SqlType;
use hqexport_types::table::{Row, TableSpec};
use hqexport_types::writer::{TableWriter, WriterError};

use super::backend::{cell_to_sql, Column, SqlBackend, SqlValue};

const DEFAULT_BATCH_SIZE: usize = 1000;

pub struct SqlTableWriter<B: SqlBackend> {
    backend: B,
    /// Known destination schema, keyed by table name. Seeded from
    /// reflection on first touch, then kept current as DDL runs.
    catalog: HashMap<String, Vec<Column>>,
    strict_types: bool,
    batch_size: usize,
}

impl<B: SqlBackend> SqlTableWriter<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            catalog: HashMap::new(),
            strict_types: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Fail on type conflicts instead of widening the column.
    #[must_use]
    pub fn with_strict_types(mut self, strict: bool) -> Self {
        self.strict_types = strict;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Column types this batch wants, positional with the headings.
    /// Declared types win; otherwise the type is inferred from the
    /// batch's cells. `id` is always text.
    fn batch_types(spec: &TableSpec, batch: &[Row]) -> Vec<Column> {
        spec.headings
            .iter()
            .enumerate()
            .map(|(idx, heading)| {
                let ty = if heading == "id" {
                    SqlType::Text
                } else if let Some(declared) = spec.declared_type(idx) {
                    declared
                } else {
                    batch
                        .iter()
                        .filter_map(|row| row.get(idx))
                        .filter_map(SqlType::infer)
                        .fold(None, |acc: Option<SqlType>, ty| {
                            Some(acc.map_or(ty, |a| a.widened(ty)))
                        })
                        .unwrap_or(SqlType::Text)
                };
                Column::new(heading.clone(), ty)
            })
            .collect()
    }

    /// Reflect or create the table, returning its current columns.
    fn ensure_table(
        &mut self,
        table: &str,
        wanted: &[Column],
    ) -> Result<Vec<Column>, WriterError> {
        if let Some(columns) = self.catalog.get(table) {
            return Ok(columns.clone());
        }
        let columns = match self.backend.table_columns(table)? {
            Some(existing) => existing,
            None => {
                self.backend.create_table(table, wanted)?;
                wanted.to_vec()
            }
        };
        self.catalog.insert(table.to_owned(), columns.clone());
        Ok(columns)
    }

    /// Add missing columns and widen narrow ones so `wanted` fits.
    fn reconcile_schema(&mut self, table: &str, wanted: &[Column]) -> Result<(), WriterError> {
        let mut columns = self.ensure_table(table, wanted)?;
        for want in wanted {
            match columns.iter_mut().find(|c| c.name == want.name) {
                None => {
                    self.backend.add_column(table, want)?;
                    columns.push(want.clone());
                }
                Some(existing) if existing.ty.accepts(want.ty) => {}
                Some(existing) => {
                    if self.strict_types {
                        return Err(WriterError::TypeConflict {
                            table: table.to_owned(),
                            column: want.name.clone(),
                            existing: existing.ty.to_string(),
                            incoming: want.ty.to_string(),
                        });
                    }
                    let widened = Column::new(want.name.clone(), existing.ty.widened(want.ty));
                    self.backend.widen_column(table, &widened)?;
                    existing.ty = widened.ty;
                }
            }
        }
        self.catalog.insert(table.to_owned(), columns);
        Ok(())
    }

    fn write_batch(&mut self, spec: &TableSpec, batch: &[Row]) -> Result<(), WriterError> {
        let wanted = Self::batch_types(spec, batch);
        self.reconcile_schema(&spec.name, &wanted)?;

        // Cell coercion targets the column's post-widening type.
        let catalog = &self.catalog[&spec.name];
        let columns: Vec<Column> = spec
            .headings
            .iter()
            .map(|heading| {
                catalog
                    .iter()
                    .find(|c| &c.name == heading)
                    .cloned()
                    .unwrap_or_else(|| Column::new(heading.clone(), SqlType::Text))
            })
            .collect();

        let null = serde_json::Value::Null;
        let rows: Vec<Vec<SqlValue>> = batch
            .iter()
            .map(|row| {
                if row.len() > columns.len() {
                    tracing::warn!(
                        table = %spec.name,
                        width = row.len(),
                        headings = columns.len(),
                        "row wider than headings, extra cells dropped"
                    );
                }
                columns
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| cell_to_sql(row.get(idx).unwrap_or(&null), col.ty))
                    .collect()
            })
            .collect();

        self.backend.upsert(&spec.name, &columns, &rows)?;
        tracing::debug!(table = %spec.name, rows = rows.len(), "upserted batch");
        Ok(())
    }
}

impl<B: SqlBackend> TableWriter for SqlTableWriter<B> {
    fn write_table(&mut self, table: &TableSpec) -> Result<(), WriterError> {
        if !table.headings.iter().any(|h| h == "id") {
            return Err(WriterError::MissingIdColumn {
                table: table.name.clone(),
            });
        }

        let mut rows_iter = table.rows.iter();
        let mut wrote_any = false;
        loop {
            let mut batch = Vec::with_capacity(self.batch_size);
            for result in rows_iter.by_ref().take(self.batch_size) {
                batch.push(result?);
            }
            let len = batch.len();
            if len == 0 {
                break;
            }
            wrote_any = true;
            self.write_batch(table, &batch)?;
            if len < self.batch_size {
                break;
            }
        }

        if !wrote_any {
            // Empty stream still materializes the table.
            let wanted = Self::batch_types(table, &[]);
            self.reconcile_schema(&table.name, &wanted)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::sqlite::SqliteSqlBackend;
    use super::*;
    use hqexport_types::table::TableRows;
    use serde_json::json;

    fn writer() -> SqlTableWriter<SqliteSqlBackend> {
        SqlTableWriter::new(SqliteSqlBackend::in_memory().unwrap())
    }

    fn spec(name: &str, headings: &[&str], rows: Vec<Row>) -> TableSpec {
        let mut spec = TableSpec::new(name, headings.iter().map(|&h| h.into()).collect());
        spec.rows = TableRows::from_vec(rows);
        spec
    }

    #[test]
    fn first_batch_creates_table_with_inferred_types() {
        let mut w = writer();
        w.write_table(&spec(
            "forms",
            &["id", "name", "count"],
            vec![vec![json!("1"), json!("x"), json!(5)]],
        ))
        .unwrap();

        let cols = &w.catalog["forms"];
        assert_eq!(cols[0].ty, SqlType::Text);
        assert_eq!(cols[1].ty, SqlType::Text);
        assert_eq!(cols[2].ty, SqlType::Integer);
    }

    #[test]
    fn later_batch_adds_missing_column_and_upserts() {
        let mut w = writer();
        w.write_table(&spec(
            "forms",
            &["id", "a"],
            vec![vec![json!("1"), json!("x")]],
        ))
        .unwrap();
        w.write_table(&spec(
            "forms",
            &["id", "a", "b"],
            vec![
                vec![json!("1"), json!("y"), json!(5)],
                vec![json!("2"), json!("z"), json!(6)],
            ],
        ))
        .unwrap();

        let conn = &w.backend.conn;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM forms", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
        let (a, b): (String, i64) = conn
            .query_row("SELECT a, b FROM forms WHERE id = '1'", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(a, "y");
        assert_eq!(b, 5);
    }

    #[test]
    fn type_conflict_widens_by_default() {
        let mut w = writer();
        w.write_table(&spec("t", &["id", "v"], vec![vec![json!("1"), json!(5)]]))
            .unwrap();
        w.write_table(&spec(
            "t",
            &["id", "v"],
            vec![vec![json!("2"), json!("five")]],
        ))
        .unwrap();
        let v = w.catalog["t"].iter().find(|c| c.name == "v").unwrap();
        assert_eq!(v.ty, SqlType::Text);
    }

    #[test]
    fn strict_types_turns_widening_into_an_error() {
        let mut w = writer().with_strict_types(true);
        w.write_table(&spec("t", &["id", "v"], vec![vec![json!("1"), json!(5)]]))
            .unwrap();
        let err = w
            .write_table(&spec(
                "t",
                &["id", "v"],
                vec![vec![json!("2"), json!("five")]],
            ))
            .unwrap_err();
        assert!(matches!(err, WriterError::TypeConflict { ref column, .. } if column == "v"));
    }

    #[test]
    fn declared_types_win_over_inference() {
        let mut w = writer();
        let mut s = spec("t", &["id", "v"], vec![vec![json!("1"), json!(5)]]);
        s.data_types = vec![SqlType::Text, SqlType::Text];
        w.write_table(&s).unwrap();

        let v = w.catalog["t"].iter().find(|c| c.name == "v").unwrap();
        assert_eq!(v.ty, SqlType::Text);
        let stored: String = w
            .backend
            .conn
            .query_row("SELECT v FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, "5");
    }

    #[test]
    fn missing_id_heading_is_rejected() {
        let mut w = writer();
        let err = w
            .write_table(&spec("t", &["name"], vec![vec![json!("x")]]))
            .unwrap_err();
        assert!(matches!(err, WriterError::MissingIdColumn { .. }));
    }

    #[test]
    fn empty_stream_still_creates_the_table() {
        let mut w = writer();
        w.write_table(&spec("empty", &["id", "v"], vec![])).unwrap();
        assert!(w.catalog.contains_key("empty"));
        let count: i64 = w
            .backend
            .conn
            .query_row("SELECT COUNT(*) FROM empty", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn short_rows_pad_with_nulls() {
        let mut w = writer();
        w.write_table(&spec(
            "t",
            &["id", "a", "b"],
            vec![vec![json!("1"), json!("x")]],
        ))
        .unwrap();
        let b: Option<String> = w
            .backend
            .conn
            .query_row("SELECT b FROM t", [], |r| r.get(0))
            .unwrap();
        assert!(b.is_none());
    }
}
