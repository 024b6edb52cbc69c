//! `PostgreSQL` implementation of [`SqlBackend`].

use hqexport_types::sqltype::SqlType;
use hqexport_types::writer::WriterError;
use postgres::types::ToSql;
use postgres::{Client, NoTls};

use super::backend::{quote_ident, Column, SqlBackend, SqlValue};

/// Rows per multi-value INSERT, kept well under the wire-protocol
/// parameter limit.
const CHUNK_SIZE: usize = 500;

/// `PostgreSQL` destination.
pub struct PostgresSqlBackend {
    client: Client,
}

impl PostgresSqlBackend {
    /// Connect to the database named by a `postgresql://` URL.
    pub fn connect(url: &str) -> Result<Self, WriterError> {
        let client = Client::connect(url, NoTls).map_err(anyhow::Error::new)?;
        Ok(Self { client })
    }
}

fn type_name(ty: SqlType) -> &'static str {
    match ty {
        SqlType::Boolean => "BOOLEAN",
        SqlType::Integer => "BIGINT",
        SqlType::Decimal => "DOUBLE PRECISION",
        SqlType::Datetime => "TIMESTAMP",
        SqlType::Text => "TEXT",
        SqlType::Json => "JSONB",
    }
}

fn type_from_name(name: &str) -> SqlType {
    match name.to_ascii_lowercase().as_str() {
        "boolean" => SqlType::Boolean,
        "bigint" | "integer" | "smallint" => SqlType::Integer,
        "double precision" | "numeric" | "real" => SqlType::Decimal,
        "timestamp" | "timestamp without time zone" | "timestamp with time zone" => {
            SqlType::Datetime
        }
        "jsonb" | "json" => SqlType::Json,
        _ => SqlType::Text,
    }
}

fn param_ref(value: &SqlValue) -> &(dyn ToSql + Sync) {
    match value {
        SqlValue::Bool(v) => v,
        SqlValue::Int(v) => v,
        SqlValue::Float(v) => v,
        SqlValue::Text(v) => v,
        SqlValue::Timestamp(v) => v,
        SqlValue::Json(v) => v,
    }
}

/// Map a failed statement to a writer error, recognizing the row
/// size limit (a page holds about 8 KB per row).
fn map_write_error(table: &str, err: &postgres::Error) -> WriterError {
    let detail = err.to_string();
    if detail.contains("row is too big") {
        WriterError::RowTooWide {
            table: table.to_owned(),
            detail,
        }
    } else {
        WriterError::Other(anyhow::anyhow!("write to '{table}' failed: {detail}"))
    }
}

impl SqlBackend for PostgresSqlBackend {
    fn table_columns(&mut self, table: &str) -> Result<Option<Vec<Column>>, WriterError> {
        let rows = self
            .client
            .query(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position",
                &[&table],
            )
            .map_err(anyhow::Error::new)?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            rows.iter()
                .map(|row| {
                    let name: String = row.get(0);
                    let dtype: String = row.get(1);
                    Column::new(name, type_from_name(&dtype))
                })
                .collect(),
        ))
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
        self.client
            .execute(&sql, &[])
            .map_err(|e| map_write_error(table, &e))?;
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
        self.client
            .execute(&sql, &[])
            .map_err(|e| map_write_error(table, &e))?;
        tracing::info!(table, column = %column.name, ty = %column.ty, "added column");
        Ok(())
    }

    fn widen_column(&mut self, table: &str, column: &Column) -> Result<(), WriterError> {
        let ident = quote_ident(&column.name);
        let target = type_name(column.ty);
        let using = if column.ty == SqlType::Json {
            format!("to_jsonb({ident})")
        } else {
            format!("{ident}::{target}")
        };
        let sql = format!(
            "ALTER TABLE {} ALTER COLUMN {ident} TYPE {target} USING {using}",
            quote_ident(table)
        );
        self.client
            .execute(&sql, &[])
            .map_err(|e| map_write_error(table, &e))?;
        tracing::info!(table, column = %column.name, ty = %column.ty, "widened column");
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
        let updates = columns
            .iter()
            .filter(|c| c.name != "id")
            .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(&c.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let conflict = if updates.is_empty() {
            "DO NOTHING".to_owned()
        } else {
            format!("DO UPDATE SET {updates}")
        };

        for chunk in rows.chunks(CHUNK_SIZE) {
            let mut sql = format!("INSERT INTO {} ({col_list}) VALUES ", quote_ident(table));
            let mut params: Vec<&(dyn ToSql + Sync)> =
                Vec::with_capacity(chunk.len() * columns.len());
            for (row_idx, row) in chunk.iter().enumerate() {
                if row_idx > 0 {
                    sql.push_str(", ");
                }
                sql.push('(');
                for (col_idx, cell) in row.iter().enumerate() {
                    if col_idx > 0 {
                        sql.push_str(", ");
                    }
                    params.push(param_ref(cell));
                    sql.push_str(&format!("${}", params.len()));
                }
                sql.push(')');
            }
            sql.push_str(" ON CONFLICT (\"id\") ");
            sql.push_str(&conflict);

            self.client
                .execute(&sql, &params)
                .map_err(|e| map_write_error(table, &e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_round_trip_through_reflection() {
        for ty in [
            SqlType::Boolean,
            SqlType::Integer,
            SqlType::Decimal,
            SqlType::Datetime,
            SqlType::Text,
            SqlType::Json,
        ] {
            assert_eq!(type_from_name(&type_name(ty).to_ascii_lowercase()), ty);
        }
    }

    #[test]
    fn unknown_reflected_types_default_to_text() {
        assert_eq!(type_from_name("uuid"), SqlType::Text);
    }
}
