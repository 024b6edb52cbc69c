//! The query intermediate representation.
//!
//! An expression tree serialized as nested single-key mappings:
//! `{"Ref": "x"}`, `{"Lit": 1}`, `{"Apply": {"fn": ..., "args":
//! [...]}}`. Round-trips are identity modulo key order, which the
//! serde external tagging gives us for free.

use crate::error::EvalError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A query expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Embeds any JSON value.
    Lit(serde_json::Value),

    /// Environment lookup. The target is a plain name, a path
    /// expression, or a sub-expression evaluated to a name first.
    Ref(RefTarget),

    /// Concrete tuple of expressions, evaluated eagerly.
    List(Vec<Expr>),

    /// Function or operator application.
    Apply {
        #[serde(rename = "fn")]
        func: Box<Expr>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<Expr>,
    },

    /// Transform each item of `source` through `body`. With `name`,
    /// the item is bound under that name; without, it replaces the
    /// path-lookup root.
    Map {
        source: Box<Expr>,
        body: Box<Expr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Like `Map` but concatenates per-item iterables.
    FlatMap {
        source: Box<Expr>,
        body: Box<Expr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Keep items where `predicate` is truthy.
    Filter {
        source: Box<Expr>,
        predicate: Box<Expr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Evaluate `value` once and bind it under `name` while
    /// evaluating `body`.
    Bind {
        name: String,
        value: Box<Expr>,
        body: Box<Expr>,
    },

    /// Side-effecting sink: hands rows from `source` to the
    /// environment's table writer.
    Emit {
        table: String,
        headings: Vec<Expr>,
        source: Box<Expr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        missing_value: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        data_types: Vec<Expr>,
    },
}

/// Target of a `Ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RefTarget {
    Name(String),
    Expr(Box<Expr>),
}

impl Expr {
    /// Shorthand for a string literal.
    #[must_use]
    pub fn lit_str(s: &str) -> Self {
        Self::Lit(serde_json::Value::String(s.to_owned()))
    }

    /// Shorthand for a plain-name reference.
    #[must_use]
    pub fn reference(name: &str) -> Self {
        Self::Ref(RefTarget::Name(name.to_owned()))
    }

    /// Collect the table names of every `Emit` node in the tree, in
    /// document order.
    #[must_use]
    pub fn emitted_tables(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.walk_tables(&mut out);
        out
    }

    fn walk_tables(&self, out: &mut Vec<String>) {
        match self {
            Self::Lit(_) => {}
            Self::Ref(RefTarget::Name(_)) => {}
            Self::Ref(RefTarget::Expr(e)) => e.walk_tables(out),
            Self::List(items) => {
                for item in items {
                    item.walk_tables(out);
                }
            }
            Self::Apply { func, args } => {
                func.walk_tables(out);
                for arg in args {
                    arg.walk_tables(out);
                }
            }
            Self::Map { source, body, .. } | Self::FlatMap { source, body, .. } => {
                source.walk_tables(out);
                body.walk_tables(out);
            }
            Self::Filter {
                source, predicate, ..
            } => {
                source.walk_tables(out);
                predicate.walk_tables(out);
            }
            Self::Bind { value, body, .. } => {
                value.walk_tables(out);
                body.walk_tables(out);
            }
            Self::Emit { table, source, .. } => {
                out.push(table.clone());
                source.walk_tables(out);
            }
        }
    }
}

/// Parse a serialized query.
pub fn parse_query(src: &str) -> Result<Expr, EvalError> {
    serde_json::from_str(src).map_err(|e| EvalError::Parse(e.to_string()))
}

/// Parse an already-deserialized JSON document as a query.
pub fn query_from_value(value: serde_json::Value) -> Result<Expr, EvalError> {
    serde_json::from_value(value).map_err(|e| EvalError::Parse(e.to_string()))
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lit(v) => write!(f, "Lit({v})"),
            Self::Ref(RefTarget::Name(n)) => write!(f, "Ref({n})"),
            Self::Ref(RefTarget::Expr(e)) => write!(f, "Ref({e})"),
            Self::List(items) => {
                f.write_str("List(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            Self::Apply { func, args } => {
                write!(f, "Apply({func}")?;
                for arg in args {
                    write!(f, ", {arg}")?;
                }
                f.write_str(")")
            }
            Self::Map { source, body, name } => fmt_loop(f, "Map", source, body, name.as_deref()),
            Self::FlatMap { source, body, name } => {
                fmt_loop(f, "FlatMap", source, body, name.as_deref())
            }
            Self::Filter {
                source,
                predicate,
                name,
            } => fmt_loop(f, "Filter", source, predicate, name.as_deref()),
            Self::Bind { name, value, body } => write!(f, "Bind({name}, {value}, {body})"),
            Self::Emit { table, source, .. } => write!(f, "Emit({table}, {source})"),
        }
    }
}

fn fmt_loop(
    f: &mut fmt::Formatter<'_>,
    tag: &str,
    source: &Expr,
    body: &Expr,
    name: Option<&str>,
) -> fmt::Result {
    match name {
        Some(n) => write!(f, "{tag}({source}, {body} as {n})"),
        None => write!(f, "{tag}({source}, {body})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(expr: &Expr) {
        let ser = serde_json::to_value(expr).unwrap();
        let back: Expr = serde_json::from_value(ser).unwrap();
        assert_eq!(&back, expr);
    }

    #[test]
    fn serializes_as_single_key_mappings() {
        let expr = Expr::reference("foo");
        assert_eq!(serde_json::to_value(&expr).unwrap(), json!({"Ref": "foo"}));

        let expr = Expr::Lit(json!(1));
        assert_eq!(serde_json::to_value(&expr).unwrap(), json!({"Lit": 1}));

        let expr = Expr::Apply {
            func: Box::new(Expr::reference("len")),
            args: vec![Expr::reference("form.name")],
        };
        assert_eq!(
            serde_json::to_value(&expr).unwrap(),
            json!({"Apply": {"fn": {"Ref": "len"}, "args": [{"Ref": "form.name"}]}})
        );
    }

    #[test]
    fn apply_args_default_to_empty() {
        let expr: Expr =
            serde_json::from_value(json!({"Apply": {"fn": {"Ref": "form_url"}}})).unwrap();
        match expr {
            Expr::Apply { args, .. } => assert!(args.is_empty()),
            other => panic!("unexpected parse: {other}"),
        }
    }

    #[test]
    fn roundtrip_is_identity() {
        roundtrip(&Expr::Lit(json!({"a": [1, 2, null]})));
        roundtrip(&Expr::Ref(RefTarget::Expr(Box::new(Expr::lit_str("x")))));
        roundtrip(&Expr::Map {
            source: Box::new(Expr::Apply {
                func: Box::new(Expr::reference("api_data")),
                args: vec![Expr::lit_str("case")],
            }),
            body: Box::new(Expr::reference("foo")),
            name: None,
        });
        roundtrip(&Expr::Emit {
            table: "t".into(),
            headings: vec![Expr::lit_str("foo")],
            source: Box::new(Expr::reference("$")),
            missing_value: Some(String::new()),
            data_types: vec![Expr::lit_str("text")],
        });
        roundtrip(&Expr::Bind {
            name: "checkpoint_manager".into(),
            value: Box::new(Expr::Apply {
                func: Box::new(Expr::reference("get_checkpoint_manager")),
                args: vec![Expr::List(vec![Expr::lit_str("t")])],
            }),
            body: Box::new(Expr::Filter {
                source: Box::new(Expr::reference("$")),
                predicate: Box::new(Expr::Lit(json!(true))),
                name: Some("row".into()),
            }),
        });
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let expr = Expr::Map {
            source: Box::new(Expr::reference("$")),
            body: Box::new(Expr::reference("id")),
            name: None,
        };
        let ser = serde_json::to_value(&expr).unwrap();
        assert_eq!(
            ser,
            json!({"Map": {"source": {"Ref": "$"}, "body": {"Ref": "id"}}})
        );
    }

    #[test]
    fn unknown_variant_is_a_parse_error() {
        assert!(parse_query(r#"{"Bogus": 1}"#).is_err());
        assert!(parse_query(r#"{"Emit": {"table": "t"}}"#).is_err());
    }

    #[test]
    fn emitted_tables_walks_nested_emits() {
        let expr = Expr::List(vec![
            Expr::Emit {
                table: "forms".into(),
                headings: vec![],
                source: Box::new(Expr::reference("$")),
                missing_value: None,
                data_types: vec![],
            },
            Expr::Bind {
                name: "x".into(),
                value: Box::new(Expr::Lit(json!(1))),
                body: Box::new(Expr::Emit {
                    table: "cases".into(),
                    headings: vec![],
                    source: Box::new(Expr::reference("$")),
                    missing_value: None,
                    data_types: vec![],
                }),
            },
        ]);
        assert_eq!(expr.emitted_tables(), vec!["forms", "cases"]);
    }
}
