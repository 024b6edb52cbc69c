//! Orchestrator error taxonomy and exit-code mapping.

use hqexport_client::ClientError;
use hqexport_query::EvalError;
use hqexport_state::StateError;
use hqexport_types::writer::WriterError;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Malformed query document. Fatal before any I/O.
    #[error("could not parse query: {0}")]
    QueryParse(String),

    /// Bad configuration (missing credentials, unknown output
    /// format, unresolvable environment variables).
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("checkpoint database error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExportError {
    /// Process exit code: 2 for usage-level problems, 1 for
    /// operational failures.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::QueryParse(_) | Self::Config(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_exit_2() {
        assert_eq!(ExportError::QueryParse("bad".into()).exit_code(), 2);
        assert_eq!(ExportError::Config("bad".into()).exit_code(), 2);
        assert_eq!(
            ExportError::Eval(EvalError::NotFound("x".into())).exit_code(),
            1
        );
    }
}
