//! SQL destination: backend abstraction plus the evolving writer.

pub mod backend;
pub mod postgres;
pub mod sqlite;
pub mod writer;

pub use backend::{Column, SqlBackend, SqlValue};
pub use postgres::PostgresSqlBackend;
pub use sqlite::SqliteSqlBackend;
pub use writer::SqlTableWriter;
