//! Emit sink frame: owns the writer and scrubs XML-to-JSON artifacts
//! out of cells before forwarding.

use crate::env::Frame;
use crate::error::EvalError;
use crate::value::Value;
use hqexport_types::table::{TableRows, TableSpec};
use hqexport_types::writer::{TableWriter, WriterError};
use std::cell::RefCell;
use std::rc::Rc;

/// Environment frame that accepts `emit_table`.
pub struct EmitterFrame {
    writer: Rc<RefCell<dyn TableWriter>>,
}

impl EmitterFrame {
    pub fn new(writer: Rc<RefCell<dyn TableWriter>>) -> Self {
        Self { writer }
    }
}

impl Frame for EmitterFrame {
    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        Err(EvalError::NotFound(name.to_owned()))
    }

    fn emit_table(&self, spec: &TableSpec) -> Result<(), EvalError> {
        let inner = spec.rows.clone();
        let cleaned = TableSpec {
            rows: TableRows::new(move || {
                Box::new(inner.iter().map(|row| {
                    row.map(|cells| cells.into_iter().map(collapse_cell).collect())
                }))
            }),
            ..spec.clone()
        };
        self.writer
            .borrow_mut()
            .write_table(&cleaned)
            .map_err(|e| match e {
                WriterError::RowTooWide { .. } => EvalError::Writer(format!(
                    "{e}; consider emitting fewer or narrower columns"
                )),
                other => EvalError::Writer(other.to_string()),
            })
    }
}

/// Collapse mappings produced by XML-to-JSON conversion:
/// `{"#text": v, ...}` becomes `v`, and a mapping whose only keys are
/// `id` plus `@`-prefixed attributes becomes the empty string.
fn collapse_cell(cell: serde_json::Value) -> serde_json::Value {
    match cell {
        serde_json::Value::Object(obj) => {
            if let Some(text) = obj.get("#text") {
                return collapse_cell(text.clone());
            }
            if !obj.is_empty() && obj.keys().all(|k| k == "id" || k.starts_with('@')) {
                return serde_json::Value::String(String::new());
            }
            serde_json::Value::Object(obj)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_key_collapses() {
        assert_eq!(
            collapse_cell(json!({"#text": "yes", "@concept": "x"})),
            json!("yes")
        );
    }

    #[test]
    fn attribute_only_mapping_collapses_to_empty() {
        assert_eq!(
            collapse_cell(json!({"id": "a.b", "@xmlns": "u"})),
            json!("")
        );
    }

    #[test]
    fn ordinary_values_pass_through() {
        assert_eq!(collapse_cell(json!("x")), json!("x"));
        assert_eq!(
            collapse_cell(json!({"name": "x", "@attr": 1})),
            json!({"name": "x", "@attr": 1})
        );
    }
}
