//! Durable checkpoint storage for resumable exports.
//!
//! Progress rows live in the `commcare_export_runs` table of the
//! destination database, so a run resumes from wherever the data
//! actually landed. Two backends implement [`CheckpointStore`]:
//! `SQLite` and `PostgreSQL`. [`CheckpointManager`] layers dataset
//! scoping and final-checkpoint collapse on top.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod error;
pub mod manager;
pub mod postgres;
pub mod sqlite;
pub mod store;

pub use error::{Result, StateError};
pub use manager::CheckpointManager;
pub use postgres::PostgresCheckpointStore;
pub use sqlite::SqliteCheckpointStore;
pub use store::{CheckpointScope, CheckpointStore};
