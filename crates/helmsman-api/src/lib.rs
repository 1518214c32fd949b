//! helmsman-api — HTTP intake and status surface.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/ping` | Liveness: `"pong"` |
//! | GET | `/status` | `{name, version, status}` |
//! | POST | `/{application}/deploy` | Accept a deployment: 201 `{id}`, 409 on conflict, 423 when locked |
//! | POST | `/{application}/pause` | Request a pause at the next task boundary |
//! | POST | `/{application}/resume` | Resume a paused deployment |
//! | POST | `/{application}/cancel` | Request cancellation at the next task boundary |

pub mod config_service;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use helmsman_coordination::{CoordinationStore, WorkQueue};
use helmsman_orchestrator::Orchestrator;
use helmsman_store::DeploymentStore;

pub use config_service::{ConfigServiceError, ConfigurationService, StaticConfigurationService};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: DeploymentStore,
    pub coordination: CoordinationStore,
    pub queue: WorkQueue,
    pub orchestrator: Orchestrator,
    pub config_service: Arc<dyn ConfigurationService>,
    pub service_name: String,
    pub version: String,
}

/// Build the API router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/status", get(handlers::status))
        .route("/{application}/deploy", post(handlers::deploy))
        .route("/{application}/pause", post(handlers::pause))
        .route("/{application}/resume", post(handlers::resume))
        .route("/{application}/cancel", post(handlers::cancel))
        .with_state(state)
}
