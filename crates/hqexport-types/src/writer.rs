//! Writer contract shared by the in-memory and SQL writers.

use crate::table::TableSpec;
use thiserror::Error;

/// Errors raised while landing an emitted table.
#[derive(Debug, Error)]
pub enum WriterError {
    /// The destination rejected a row for exceeding its size limit.
    #[error("row in table '{table}' exceeds the destination row size limit: {detail}")]
    RowTooWide { table: String, detail: String },

    /// Incoming data does not fit the existing column type and
    /// widening is disabled.
    #[error(
        "type conflict in '{table}.{column}': column is {existing} but value needs {incoming}"
    )]
    TypeConflict {
        table: String,
        column: String,
        existing: String,
        incoming: String,
    },

    /// Upserts need an `id` heading to key on.
    #[error("table '{table}' has no 'id' heading")]
    MissingIdColumn { table: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Sink for emitted tables.
///
/// `write_table` may be called several times for the same table name
/// within one run; writers merge batches (SQL writers upsert on `id`).
pub trait TableWriter {
    fn write_table(&mut self, table: &TableSpec) -> Result<(), WriterError>;

    /// Flush anything buffered. Called once after the last batch.
    fn close(&mut self) -> Result<(), WriterError> {
        Ok(())
    }
}
