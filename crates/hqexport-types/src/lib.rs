//! Shared model types for the hq-export engine.
//!
//! Pure data types used across the query evaluator, HTTP client,
//! checkpoint store, and writers. Kept in one crate so the others can
//! share them without circular dependencies.

#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod sqltype;
pub mod table;
pub mod writer;
