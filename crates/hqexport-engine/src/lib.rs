//! Export orchestrator.
//!
//! Ties the pieces together: parses a query document, pre-binds the
//! paginated data source and checkpoint-manager factory into the
//! evaluation environment, evaluates each dataset, and finalizes
//! checkpoints once the writer has everything.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod bindings;
pub mod config;
pub mod error;
pub mod query_file;
pub mod runner;

pub use config::{substitute_env_vars, OutputFormat};
pub use error::ExportError;
pub use query_file::QueryFile;
pub use runner::{run_export, ExportRun, RunSummary};
