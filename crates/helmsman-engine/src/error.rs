//! Error types for the pipeline engine.

use thiserror::Error;

use helmsman_coordination::CoordinationError;
use helmsman_remote::RemoteError;
use helmsman_store::StoreError;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while driving a deployment pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    #[error("no deployment is paused for {application}-{environment}-{region}")]
    NotPaused {
        application: String,
        environment: String,
        region: String,
    },

    #[error("required parameter {0} is missing")]
    MissingParameter(&'static str),
}

impl EngineError {
    /// Whether waiting and retrying could help.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Remote(e) => e.is_transient(),
            EngineError::Store(_) => true,
            _ => false,
        }
    }
}
