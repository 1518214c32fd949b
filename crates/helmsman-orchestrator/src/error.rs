//! Error types for the orchestrator.

use thiserror::Error;

use helmsman_coordination::CoordinationError;
use helmsman_engine::EngineError;
use helmsman_store::StoreError;

/// Result type alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors raised while admitting or steering deployments.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    /// The global intake lock is held.
    #[error("deployment intake is locked")]
    Locked,

    /// Mutual-exclusion conflict at these coordinates.
    #[error("a deployment is already in progress for {application}-{environment}-{region}")]
    AlreadyInProgress {
        application: String,
        environment: String,
        region: String,
    },
}
