//! Error types for the remote-service client.

use thiserror::Error;

/// Result type alias for remote-service operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors raised by the remote-service client and the parameter
/// transformations feeding it.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport-level failure (connect, timeout, protocol).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote answered with something other than the expected
    /// 302/200 for this operation.
    #[error("unexpected response {status} from {url}: {body}")]
    UnexpectedResponse {
        status: u16,
        url: String,
        body: String,
    },

    #[error("no base URL configured for environment {0}")]
    UnknownEnvironment(String),

    #[error("unknown security group: {0}")]
    UnknownSecurityGroup(String),

    /// A precondition on an existing ASG failed.
    #[error("missing auto scaling group: {0}")]
    MissingAsg(String),

    /// No task URL or resource could be located for the expected name.
    #[error("task missing: {0}")]
    TaskMissing(String),

    #[error("malformed request input: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Transport failures are transient and worth retrying; everything
    /// else reflects a wire contract violation or bad input.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Http(_))
    }
}
