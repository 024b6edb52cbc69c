//! Evaluation errors.
//!
//! Kept `Clone` so restartable sequences can replay a failure on
//! re-iteration.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// Dictionary-frame lookup miss. JSONPath misses are not errors,
    /// they resolve to an empty sequence.
    #[error("name '{0}' is not bound")]
    NotFound(String),

    /// The frame does not support binding names.
    #[error("environment frame cannot bind names")]
    CannotBind,

    /// The frame does not support replacing the root record.
    #[error("environment frame cannot replace the root record")]
    CannotReplace,

    /// The frame does not own a writer.
    #[error("environment frame cannot emit tables")]
    CannotEmit,

    #[error("'{0}' is not callable")]
    NotCallable(String),

    #[error("{0}")]
    Type(String),

    #[error("invalid path '{path}': {detail}")]
    BadPath { path: String, detail: String },

    #[error("malformed query: {0}")]
    Parse(String),

    /// Decorates a failure inside `Apply` with the failing expression
    /// and the document it was processing.
    #[error("error in {expr} (doc id {doc_id}): {source}")]
    InExpr {
        expr: String,
        doc_id: String,
        source: Box<EvalError>,
    },

    #[error("writer error: {0}")]
    Writer(String),

    /// Failure surfaced by an externally bound function, such as the
    /// paginated data source.
    #[error("{0}")]
    External(String),
}

impl EvalError {
    /// `true` for the capability-refusal variants that a chained
    /// environment falls through on.
    #[must_use]
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::CannotBind | Self::CannotReplace | Self::CannotEmit
        )
    }
}
