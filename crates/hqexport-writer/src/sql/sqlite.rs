//! `SQLite` implementation of [`SqlBackend`].

use hqexport_types::sqltype::SqlType;
use hqexport_types::writer::WriterError;
use rusqlite::types::Value as SqliteValue;
use rusqlite::Connection;

use super::backend::{quote_ident, Column, SqlBackend, SqlValue};

/// `SQLite` destination.
pub struct SqliteSqlBackend {
    pub(crate) conn: Connection,
}

impl SqliteSqlBackend {
    pub fn open(path: &str) -> Result<Self, WriterError> {
        let conn = Connection::open(path).map_err(anyhow::Error::new)?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self, WriterError> {
        let conn = Connection::open_in_memory().map_err(anyhow::Error::new)?;
        Ok(Self { conn })
    }
}

/// Declared column type name. `SQLite` keeps the spelling we choose,
/// so reflection can round-trip the logical type.
fn type_name(ty: SqlType) -> &'static str {
    match ty {
        SqlType::Boolean => "BOOLEAN",
        SqlType::Integer => "INTEGER",
        SqlType::Decimal => "REAL",
        SqlType::Datetime => "DATETIME",
        SqlType::Text => "TEXT",
        SqlType::Json => "JSON",
    }
}

fn type_from_name(name: &str) -> SqlType {
    match name.to_ascii_uppercase().as_str() {
        "BOOLEAN" | "BOOL" => SqlType::Boolean,
        "INTEGER" | "INT" | "BIGINT" => SqlType::Integer,
        "REAL" | "NUMERIC" | "DECIMAL" | "DOUBLE" | "FLOAT" => SqlType::Decimal,
        "DATETIME" | "TIMESTAMP" => SqlType::Datetime,
        "JSON" | "JSONB" => SqlType::Json,
        _ => SqlType::Text,
    }
}

fn to_sqlite(value: &SqlValue) -> SqliteValue {
    match value {
        SqlValue::Bool(Some(b)) => SqliteValue::Integer(i64::from(*b)),
        SqlValue::Int(Some(i)) => SqliteValue::Integer(*i),
        SqlValue::Float(Some(f)) => SqliteValue::Real(*f),
        SqlValue::Text(Some(s)) => SqliteValue::Text(s.clone()),
        SqlValue::Timestamp(Some(ts)) => {
            SqliteValue::Text(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }
        SqlValue::Json(Some(v)) => SqliteValue::Text(v.to_string()),
        _ => SqliteValue::Null,
    }
}

impl SqlBackend for SqliteSqlBackend {
    fn table_columns(&mut self, table: &str) -> Result<Option<Vec<Column>>, WriterError> {
        let sql = format!("PRAGMA table_info({})", quote_ident(table));
        let mut stmt = self.conn.prepare(&sql).map_err(anyhow::Error::new)?;
        let columns = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let declared: String = row.get(2)?;
                Ok(Column::new(name, type_from_name(&declared)))
            })
            .map_err(anyhow::Error::new)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(anyhow::Error::new)?;
        if columns.is_empty() {
            Ok(None)
        } else {
            Ok(Some(columns))
        }
    }

    fn create_table(&mut self, table: &str, columns: &[Column]) -> Result<(), WriterError> {
        let cols = columns
            .iter()
            .map(|c| {
                if c.name == "id" {
                    format!("{} {} PRIMARY KEY", quote_ident(&c.name), type_name(c.ty))
                } else {
                    format!("{} {}", quote_ident(&c.name), type_name(c.ty))
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("CREATE TABLE {} ({cols})", quote_ident(table));
        self.conn.execute(&sql, []).map_err(anyhow::Error::new)?;
        tracing::info!(table, "created table");
        Ok(())
    }

    fn add_column(&mut self, table: &str, column: &Column) -> Result<(), WriterError> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(table),
            quote_ident(&column.name),
            type_name(column.ty)
        );
        self.conn.execute(&sql, []).map_err(anyhow::Error::new)?;
        tracing::info!(table, column = %column.name, ty = %column.ty, "added column");
        Ok(())
    }

    fn widen_column(&mut self, table: &str, column: &Column) -> Result<(), WriterError> {
        // SQLite's type affinity already stores any value in any
        // column, so widening only needs to be remembered, not
        // executed.
        tracing::debug!(table, column = %column.name, ty = %column.ty,
            "column widened (no DDL needed)");
        Ok(())
    }

    fn upsert(
        &mut self,
        table: &str,
        columns: &[Column],
        rows: &[Vec<SqlValue>],
    ) -> Result<(), WriterError> {
        if rows.is_empty() {
            return Ok(());
        }
        let col_list = columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|n| format!("?{n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = columns
            .iter()
            .filter(|c| c.name != "id")
            .map(|c| format!("{0} = excluded.{0}", quote_ident(&c.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let conflict = if updates.is_empty() {
            "DO NOTHING".to_owned()
        } else {
            format!("DO UPDATE SET {updates}")
        };
        let sql = format!(
            "INSERT INTO {} ({col_list}) VALUES ({placeholders}) \
             ON CONFLICT(\"id\") {conflict}",
            quote_ident(table)
        );

        let tx = self.conn.transaction().map_err(anyhow::Error::new)?;
        {
            let mut stmt = tx.prepare(&sql).map_err(anyhow::Error::new)?;
            for row in rows {
                let params: Vec<SqliteValue> = row.iter().map(to_sqlite).collect();
                stmt.execute(rusqlite::params_from_iter(params))
                    .map_err(anyhow::Error::new)?;
            }
        }
        tx.commit().map_err(anyhow::Error::new)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflection_round_trips_types() {
        let mut backend = SqliteSqlBackend::in_memory().unwrap();
        backend
            .create_table(
                "forms",
                &[
                    Column::new("id", SqlType::Text),
                    Column::new("count", SqlType::Integer),
                    Column::new("extra", SqlType::Json),
                ],
            )
            .unwrap();
        let cols = backend.table_columns("forms").unwrap().unwrap();
        assert_eq!(cols[0], Column::new("id", SqlType::Text));
        assert_eq!(cols[1], Column::new("count", SqlType::Integer));
        assert_eq!(cols[2], Column::new("extra", SqlType::Json));
    }

    #[test]
    fn missing_table_reflects_as_none() {
        let mut backend = SqliteSqlBackend::in_memory().unwrap();
        assert!(backend.table_columns("nope").unwrap().is_none());
    }

    #[test]
    fn upsert_replaces_on_id_collision() {
        let mut backend = SqliteSqlBackend::in_memory().unwrap();
        let cols = vec![
            Column::new("id", SqlType::Text),
            Column::new("name", SqlType::Text),
        ];
        backend.create_table("t", &cols).unwrap();
        backend
            .upsert(
                "t",
                &cols,
                &[vec![
                    SqlValue::Text(Some("1".into())),
                    SqlValue::Text(Some("old".into())),
                ]],
            )
            .unwrap();
        backend
            .upsert(
                "t",
                &cols,
                &[vec![
                    SqlValue::Text(Some("1".into())),
                    SqlValue::Text(Some("new".into())),
                ]],
            )
            .unwrap();

        let (count, name): (i64, String) = backend
            .conn
            .query_row("SELECT COUNT(*), MAX(name) FROM t", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(name, "new");
    }
}
