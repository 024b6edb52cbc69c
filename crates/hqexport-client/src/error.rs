//! Client errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Network-level failure (DNS, connect, timeout).
    #[error("request to {url} failed: {detail}")]
    Transport { url: String, detail: String },

    /// Non-2xx response that is not retryable.
    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    #[error("could not parse response from {url}: {detail}")]
    BadResponse { url: String, detail: String },

    /// The paginator issued the same request repeatedly without the
    /// server returning anything new.
    #[error("no progress after {attempts} identical requests to {url}")]
    ResourceRepeat { url: String, attempts: u32 },

    #[error("giving up on {url} after {attempts} attempts: {detail}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        detail: String,
    },

    /// Failure persisting progress between pages.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl ClientError {
    /// `true` for failures worth resuming from a checkpoint.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::RetriesExhausted { .. } | Self::ResourceRepeat { .. }
        )
    }
}
