//! Error types for the coordination store and work queue.

use thiserror::Error;

/// Result type alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors that can occur against the coordination store.
///
/// An unreachable or corrupt store fails upward; predicate results are
/// never spoofed.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}
