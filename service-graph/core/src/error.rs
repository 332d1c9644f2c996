use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the service graph engine.
///
/// Errors are cloned to every caller waiting on a shared cache query, so backend failures are
/// carried as rendered messages.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid node ID {id:?}: {reason}")]
    InvalidNodeId { id: String, reason: &'static str },

    #[error("invalid view: {0}")]
    InvalidView(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("backend query failed: {0}")]
    Backend(String),

    #[error("request timed out after {0:?} waiting for data; retry to pick up the pending query")]
    CacheTimeout(Duration),

    #[error("the time range contains too much data; narrow the time range")]
    DataTruncated,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn node_id(id: impl ToString, reason: &'static str) -> Self {
        Self::InvalidNodeId {
            id: id.to_string(),
            reason,
        }
    }

    /// Malformed input from the caller. These are never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidNodeId { .. } | Self::InvalidView(_) | Self::InvalidRequest(_)
        )
    }

    /// Errors that may succeed when the same request is repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CacheTimeout(_))
    }
}
