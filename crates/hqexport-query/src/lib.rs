//! Query language: expression tree, chained environment, and lazy
//! evaluator.
//!
//! A query is a tree of [`ir::Expr`] nodes evaluated against an
//! [`env::Env`]. Record streams flow through the evaluator as
//! restartable lazy sequences; `Emit` nodes hand rows to the table
//! writer owned by the environment's emitter frame.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod builtins;
pub mod emitter;
pub mod env;
pub mod error;
pub mod eval;
pub mod ir;
pub mod jsonpath;
pub mod value;

pub use builtins::builtins_env;
pub use emitter::EmitterFrame;
pub use env::{BuiltinsFrame, DictFrame, Env, Frame, JsonPathFrame};
pub use error::EvalError;
pub use eval::eval;
pub use ir::{parse_query, query_from_value, Expr, RefTarget};
pub use value::{unwrap_value, value_into_iter, BuiltinFn, RestartableSeq, SeqIter, Value};

use hqexport_types::writer::TableWriter;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Assemble the standard environment chain:
/// builtins, then ambient bindings, then the emit sink, then path
/// lookups against an (initially empty) root record.
#[must_use]
pub fn standard_env(
    bindings: HashMap<String, Value>,
    writer: Rc<RefCell<dyn TableWriter>>,
) -> Env {
    builtins_env()
        .or_else(Env::new(DictFrame::new(bindings)))
        .or_else(Env::new(EmitterFrame::new(writer)))
        .or_else(Env::new(JsonPathFrame::new(serde_json::Value::Object(
            serde_json::Map::new(),
        ))))
}
