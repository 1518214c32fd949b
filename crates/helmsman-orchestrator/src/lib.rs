//! helmsman-orchestrator — admission, operator control, and recovery.
//!
//! Consumes enqueued deployment requests, enforces the global intake
//! lock and the at-most-one-deployment-per-(application, environment,
//! region) invariant, routes operator pause/cancel/resume requests, and
//! revives interrupted deployments when the process starts.

pub mod error;
pub mod orchestrator;

pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{Orchestrator, QueuedDeployment};
