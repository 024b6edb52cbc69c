//! The chained evaluation environment.
//!
//! An [`Env`] is an immutable chain of frames combined with
//! [`Env::or_else`]. Each capability (lookup, bind, replace, emit)
//! tries the left side first and falls through to the right on a
//! capability-refusal error; any other error propagates.

use crate::error::EvalError;
use crate::jsonpath;
use crate::value::{RestartableSeq, Value};
use hqexport_types::table::TableSpec;
use std::collections::HashMap;
use std::rc::Rc;

/// One frame of the environment chain.
pub trait Frame {
    fn lookup(&self, name: &str) -> Result<Value, EvalError>;

    fn bind(&self, _name: &str, _value: Value) -> Result<Env, EvalError> {
        Err(EvalError::CannotBind)
    }

    fn replace(&self, _record: serde_json::Value) -> Result<Env, EvalError> {
        Err(EvalError::CannotReplace)
    }

    fn emit_table(&self, _spec: &TableSpec) -> Result<(), EvalError> {
        Err(EvalError::CannotEmit)
    }
}

/// Immutable evaluation environment.
#[derive(Clone)]
pub struct Env {
    frame: Rc<dyn Frame>,
}

impl Env {
    pub fn new(frame: impl Frame + 'static) -> Self {
        Self {
            frame: Rc::new(frame),
        }
    }

    /// Chain `self` before `right`: capabilities refused by `self`
    /// fall through to `right`.
    #[must_use]
    pub fn or_else(self, right: Env) -> Env {
        Env::new(ChainFrame { left: self, right })
    }

    pub fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        self.frame.lookup(name)
    }

    pub fn bind(&self, name: &str, value: Value) -> Result<Env, EvalError> {
        self.frame.bind(name, value)
    }

    pub fn replace(&self, record: serde_json::Value) -> Result<Env, EvalError> {
        self.frame.replace(record)
    }

    pub fn emit_table(&self, spec: &TableSpec) -> Result<(), EvalError> {
        self.frame.emit_table(spec)
    }
}

struct ChainFrame {
    left: Env,
    right: Env,
}

impl Frame for ChainFrame {
    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        match self.left.lookup(name) {
            Err(e) if e.is_refusal() => self.right.lookup(name),
            other => other,
        }
    }

    fn bind(&self, name: &str, value: Value) -> Result<Env, EvalError> {
        match self.left.bind(name, value.clone()) {
            Ok(left) => Ok(left.or_else(self.right.clone())),
            Err(e) if e.is_refusal() => {
                let right = self.right.bind(name, value)?;
                Ok(self.left.clone().or_else(right))
            }
            Err(e) => Err(e),
        }
    }

    fn replace(&self, record: serde_json::Value) -> Result<Env, EvalError> {
        match self.left.replace(record.clone()) {
            Ok(left) => Ok(left.or_else(self.right.clone())),
            Err(e) if e.is_refusal() => {
                let right = self.right.replace(record)?;
                Ok(self.left.clone().or_else(right))
            }
            Err(e) => Err(e),
        }
    }

    fn emit_table(&self, spec: &TableSpec) -> Result<(), EvalError> {
        match self.left.emit_table(spec) {
            Err(e) if e.is_refusal() => self.right.emit_table(spec),
            other => other,
        }
    }
}

/// Read-only name table for built-in functions. Refuses every
/// capability except lookup.
pub struct BuiltinsFrame {
    names: HashMap<String, Value>,
}

impl BuiltinsFrame {
    #[must_use]
    pub fn new(names: HashMap<String, Value>) -> Self {
        Self { names }
    }
}

impl Frame for BuiltinsFrame {
    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        self.names
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::NotFound(name.to_owned()))
    }
}

/// Name-to-value map extended by binding. Lookup miss is an error,
/// unlike the path frame.
pub struct DictFrame {
    names: HashMap<String, Value>,
}

impl DictFrame {
    #[must_use]
    pub fn new(names: HashMap<String, Value>) -> Self {
        Self { names }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            names: HashMap::new(),
        }
    }
}

impl Frame for DictFrame {
    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        self.names
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::NotFound(name.to_owned()))
    }

    fn bind(&self, name: &str, value: Value) -> Result<Env, EvalError> {
        let mut names = self.names.clone();
        names.insert(name.to_owned(), value);
        Ok(Env::new(Self { names }))
    }
}

/// Path lookups against a root record.
///
/// A miss is an empty sequence, not an error. Matched mappings
/// without an `id` field get a synthetic one derived from the root's
/// id and the match location, so repeat-group rows stay addressable.
pub struct JsonPathFrame {
    root: serde_json::Value,
    root_id: Option<String>,
    root_only: bool,
}

impl JsonPathFrame {
    #[must_use]
    pub fn new(root: serde_json::Value) -> Self {
        Self::with_mode(root, false)
    }

    /// `root_only` suppresses lookups whose leftmost segment is
    /// neither `$` nor the literal name `id`.
    #[must_use]
    pub fn with_mode(root: serde_json::Value, root_only: bool) -> Self {
        let root_id = record_id(&root);
        Self {
            root,
            root_id,
            root_only,
        }
    }

    fn auto_id(&self, rel_path: &str) -> String {
        match &self.root_id {
            Some(id) => format!("{id}.{rel_path}"),
            None => rel_path.to_owned(),
        }
    }
}

fn record_id(record: &serde_json::Value) -> Option<String> {
    match record.get("id") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

impl Frame for JsonPathFrame {
    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        let path = jsonpath::parse_cached(name)?;
        if self.root_only
            && !path.starts_at_root()
            && path.first_child_name() != Some("id")
        {
            return Ok(Value::Seq(RestartableSeq::empty()));
        }
        let matches = path.find(&self.root);
        let mut out = Vec::with_capacity(matches.len());
        for m in matches {
            let value = match m.value {
                serde_json::Value::Object(mut obj) if !obj.contains_key("id") => {
                    obj.insert(
                        "id".to_owned(),
                        serde_json::Value::String(self.auto_id(&m.path)),
                    );
                    serde_json::Value::Object(obj)
                }
                other => other,
            };
            out.push(Value::Json(value));
        }
        Ok(Value::Seq(RestartableSeq::from_values(out)))
    }

    fn bind(&self, name: &str, value: Value) -> Result<Env, EvalError> {
        let serde_json::Value::Object(mut obj) = self.root.clone() else {
            return Err(EvalError::CannotBind);
        };
        let json = value.into_json().map_err(|_| EvalError::CannotBind)?;
        obj.insert(name.to_owned(), json);
        Ok(Env::new(Self::with_mode(
            serde_json::Value::Object(obj),
            self.root_only,
        )))
    }

    fn replace(&self, record: serde_json::Value) -> Result<Env, EvalError> {
        Ok(Env::new(Self::with_mode(record, self.root_only)))
    }
}
