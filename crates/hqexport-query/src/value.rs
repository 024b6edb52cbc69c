//! Runtime values and restartable sequences.

use crate::env::Env;
use crate::error::EvalError;
use crate::ir::Expr;
use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// One pass over a sequence.
pub type SeqIter = Box<dyn Iterator<Item = Result<Value, EvalError>>>;

/// Host callable bound into the environment.
///
/// Takes the calling environment so data-source functions can reach
/// ambient bindings such as the checkpoint manager.
pub type BuiltinFn = Rc<dyn Fn(&Env, &[Value]) -> Result<Value, EvalError>>;

/// Lazy sequence whose producer can be re-invoked.
///
/// Re-iteration restarts from the beginning, which lets `Emit` walk
/// its rows more than once without buffering.
#[derive(Clone)]
pub struct RestartableSeq {
    producer: Rc<dyn Fn() -> SeqIter>,
}

impl RestartableSeq {
    pub fn new(producer: impl Fn() -> SeqIter + 'static) -> Self {
        Self {
            producer: Rc::new(producer),
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::new(|| Box::new(std::iter::empty()))
    }

    /// Buffered sequence over already-materialized values.
    #[must_use]
    pub fn from_values(values: Vec<Value>) -> Self {
        Self::new(move || Box::new(values.clone().into_iter().map(Ok)))
    }

    /// Start a fresh pass.
    #[must_use]
    pub fn iter(&self) -> SeqIter {
        (self.producer)()
    }

    /// Pull everything, stopping at the first error.
    pub fn materialize(&self) -> Result<Vec<Value>, EvalError> {
        self.iter().collect()
    }

    /// `true` if at least one item can be pulled without error.
    pub fn is_nonempty(&self) -> Result<bool, EvalError> {
        match self.iter().next() {
            None => Ok(false),
            Some(Ok(_)) => Ok(true),
            Some(Err(e)) => Err(e),
        }
    }
}

impl fmt::Debug for RestartableSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RestartableSeq(..)")
    }
}

/// Evaluated value.
#[derive(Clone)]
pub enum Value {
    /// Plain JSON data.
    Json(serde_json::Value),
    /// Lazy restartable sequence.
    Seq(RestartableSeq),
    /// Named host callable.
    Fn(String, BuiltinFn),
    /// Unevaluated expression returned by a macro-like helper; the
    /// caller re-evaluates it under the current environment.
    Node(Box<Expr>),
    /// Opaque host object (checkpoint manager and friends).
    Extern(Rc<dyn Any>),
}

impl Value {
    #[must_use]
    pub fn null() -> Self {
        Self::Json(serde_json::Value::Null)
    }

    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::Json(serde_json::Value::String(s.into()))
    }

    #[must_use]
    pub fn bool(b: bool) -> Self {
        Self::Json(serde_json::Value::Bool(b))
    }

    /// Truthiness, following the conventions of the source documents:
    /// null, zero, empty strings, and empty containers are falsy.
    pub fn truthy(&self) -> Result<bool, EvalError> {
        use serde_json::Value as J;
        match self {
            Self::Json(J::Null) => Ok(false),
            Self::Json(J::Bool(b)) => Ok(*b),
            Self::Json(J::Number(n)) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
            Self::Json(J::String(s)) => Ok(!s.is_empty()),
            Self::Json(J::Array(a)) => Ok(!a.is_empty()),
            Self::Json(J::Object(o)) => Ok(!o.is_empty()),
            Self::Seq(seq) => seq.is_nonempty(),
            Self::Fn(..) | Self::Node(_) | Self::Extern(_) => Ok(true),
        }
    }

    /// Convert to plain JSON. Sequences materialize to arrays;
    /// callables and host objects have no JSON form.
    pub fn into_json(self) -> Result<serde_json::Value, EvalError> {
        match self {
            Self::Json(v) => Ok(v),
            Self::Seq(seq) => {
                let items = seq.materialize()?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.into_json()?);
                }
                Ok(serde_json::Value::Array(out))
            }
            Self::Fn(name, _) => Err(EvalError::Type(format!(
                "function '{name}' has no JSON form"
            ))),
            Self::Node(expr) => Err(EvalError::Type(format!(
                "unevaluated expression {expr} has no JSON form"
            ))),
            Self::Extern(_) => Err(EvalError::Type("host object has no JSON form".into())),
        }
    }

    /// Short rendering for error messages.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Json(v) => v.to_string(),
            Self::Seq(_) => "<sequence>".into(),
            Self::Fn(name, _) => format!("<fn {name}>"),
            Self::Node(expr) => format!("<node {expr}>"),
            Self::Extern(_) => "<host object>".into(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(v) => write!(f, "Json({v})"),
            Self::Seq(_) => f.write_str("Seq(..)"),
            Self::Fn(name, _) => write!(f, "Fn({name})"),
            Self::Node(expr) => write!(f, "Node({expr})"),
            Self::Extern(_) => f.write_str("Extern(..)"),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

/// Unwrap a value before dispatching it to an operator.
///
/// Path lookups produce sequences even for single matches, so a
/// sequence of length one collapses to its element; longer sequences
/// materialize to a JSON array of unwrapped elements.
pub fn unwrap_value(value: Value) -> Result<Value, EvalError> {
    match value {
        Value::Seq(seq) => {
            let mut items = seq.materialize()?;
            match items.len() {
                0 => Ok(Value::null()),
                1 => unwrap_value(items.remove(0)),
                _ => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(unwrap_value(item)?.into_json()?);
                    }
                    Ok(Value::Json(serde_json::Value::Array(out)))
                }
            }
        }
        other => Ok(other),
    }
}

/// View a value as a stream of items for Map/FlatMap/Filter.
///
/// Arrays iterate their elements, null is empty, any other scalar is
/// a singleton.
pub fn value_into_iter(value: Value) -> SeqIter {
    match value {
        Value::Seq(seq) => seq.iter(),
        Value::Json(serde_json::Value::Null) => Box::new(std::iter::empty()),
        Value::Json(serde_json::Value::Array(items)) => {
            Box::new(items.into_iter().map(|v| Ok(Value::Json(v))))
        }
        other => Box::new(std::iter::once(Ok(other))),
    }
}
