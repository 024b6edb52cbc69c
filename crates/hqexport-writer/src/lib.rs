//! Table writers for export output.
//!
//! [`InMemoryWriter`] backs tests and JSON output;
//! [`sql::SqlTableWriter`] lands rows in `SQLite` or `PostgreSQL`
//! with schema evolution and upsert-on-`id`.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod memory;
pub mod sql;

pub use hqexport_types::writer::{TableWriter, WriterError};
pub use memory::{InMemoryWriter, MemoryTable};
pub use sql::{PostgresSqlBackend, SqlTableWriter, SqliteSqlBackend};
