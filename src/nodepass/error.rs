//! NodePass client error types.

use thiserror::Error;

/// Result type for NodePass API operations.
pub type NodePassResult<T> = Result<T, NodePassError>;

/// Errors that can occur when talking to an agent's control API.
#[derive(Debug, Error)]
pub enum NodePassError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The agent answered with a non-success status. Commands are never
    /// retried; the caller decides what to do.
    #[error("agent API returned HTTP {status}")]
    ApiStatus { status: reqwest::StatusCode },

    /// Failed to parse the response body.
    #[error("failed to parse response: {0}")]
    ParseError(String),
}
