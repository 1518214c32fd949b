//! API handlers: intake, status, operator requests.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use helmsman_orchestrator::{OrchestratorError, QueuedDeployment};
use helmsman_store::{standard_task_list, Deployment, Parameters};

use crate::ApiState;

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (status, Json(serde_json::json!({ "error": msg })))
}

// ── Liveness ───────────────────────────────────────────────────────

/// GET /ping
pub async fn ping() -> &'static str {
    "pong"
}

/// GET /status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let healthy = state.coordination.healthy();
    Json(serde_json::json!({
        "name": state.service_name,
        "version": state.version,
        "status": if healthy { "online" } else { "degraded" },
    }))
}

// ── Intake ─────────────────────────────────────────────────────────

/// Body of a deployment request.
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub environment: String,
    pub region: String,
    pub ami: String,
    pub user: String,
    pub message: String,
    /// Optional overrides layered between configured defaults and the
    /// operation-owned protected keys.
    #[serde(default)]
    pub parameters: Parameters,
}

impl DeployRequest {
    fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("environment", &self.environment),
            ("region", &self.region),
            ("user", &self.user),
            ("message", &self.message),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{field} must not be empty"));
            }
        }
        if !self.ami.starts_with("ami-") {
            return Err(format!("{} is not a machine image id", self.ami));
        }
        Ok(())
    }
}

/// POST /{application}/deploy
pub async fn deploy(
    State(state): State<ApiState>,
    Path(application): Path<String>,
    Json(request): Json<DeployRequest>,
) -> impl IntoResponse {
    if let Err(reason) = request.validate() {
        return error_response(&reason, StatusCode::BAD_REQUEST).into_response();
    }

    // Intake refusals before any document is created.
    match state.coordination.locked() {
        Ok(true) => {
            return error_response("deployment intake is locked", StatusCode::LOCKED)
                .into_response()
        }
        Ok(false) => {}
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response()
        }
    }
    match state
        .coordination
        .in_progress(&application, &request.environment, &request.region)
    {
        Ok(Some(existing)) => {
            return error_response(
                &format!("deployment {existing} is already in progress"),
                StatusCode::CONFLICT,
            )
            .into_response()
        }
        Ok(None) => {}
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response()
        }
    }

    // The image must belong to the application being deployed.
    match state.config_service.image_application(&request.ami).await {
        Ok(Some(owner)) if owner == application => {}
        Ok(Some(owner)) => {
            warn!(ami = %request.ami, %application, %owner, "image/application mismatch");
            return error_response(
                &format!(
                    "image {} belongs to application {owner}, not {application}",
                    request.ami
                ),
                StatusCode::BAD_REQUEST,
            )
            .into_response();
        }
        Ok(None) => {
            return error_response(
                &format!("image {} is not known", request.ami),
                StatusCode::BAD_REQUEST,
            )
            .into_response()
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response()
        }
    }

    let hash = match state
        .config_service
        .commit_hash(&application, &request.environment)
        .await
    {
        Ok(hash) => hash,
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response()
        }
    };
    let defaults = match state
        .config_service
        .deployment_parameters(&application, &request.environment, &request.region)
        .await
    {
        Ok(defaults) => defaults,
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response()
        }
    };

    let id = Uuid::new_v4().to_string();

    // Operation-owned keys that nothing may override.
    let mut protected = Parameters::new();
    protected.set("application", application.clone());
    protected.set("image_id", request.ami.clone());
    protected.set("ticket", id.clone());

    let deployment = Deployment {
        id: id.clone(),
        application: application.clone(),
        environment: request.environment.clone(),
        region: request.region.clone(),
        ami: request.ami.clone(),
        user: request.user.clone(),
        message: request.message.clone(),
        hash,
        parameters: Parameters::merged(&defaults, &request.parameters, &protected),
        tasks: standard_task_list(),
        created: Utc::now(),
        start: None,
        end: None,
    };

    if let Err(e) = state.store.upsert(&deployment) {
        return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response();
    }

    let payload = match serde_json::to_vec(&QueuedDeployment {
        deployment_id: id.clone(),
    }) {
        Ok(payload) => payload,
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response()
        }
    };
    if let Err(e) = state.queue.enqueue(&payload) {
        return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response();
    }

    info!(deployment_id = %id, %application, ami = %deployment.ami, "deployment accepted");
    (StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response()
}

// ── Operator requests ──────────────────────────────────────────────

/// Body naming the coordinates of an in-flight deployment.
#[derive(Debug, Deserialize)]
pub struct CoordinatesRequest {
    pub environment: String,
    pub region: String,
}

/// POST /{application}/pause
pub async fn pause(
    State(state): State<ApiState>,
    Path(application): Path<String>,
    Json(request): Json<CoordinatesRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .pause(&application, &request.environment, &request.region)
    {
        Ok(registered) => Json(serde_json::json!({ "registered": registered })).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /{application}/cancel
pub async fn cancel(
    State(state): State<ApiState>,
    Path(application): Path<String>,
    Json(request): Json<CoordinatesRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .cancel(&application, &request.environment, &request.region)
    {
        Ok(registered) => Json(serde_json::json!({ "registered": registered })).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /{application}/resume
pub async fn resume(
    State(state): State<ApiState>,
    Path(application): Path<String>,
    Json(request): Json<CoordinatesRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .resume(&application, &request.environment, &request.region)
        .await
    {
        Ok(()) => Json(serde_json::json!({ "resumed": true })).into_response(),
        Err(OrchestratorError::Engine(helmsman_engine::EngineError::NotPaused { .. })) => {
            error_response(
                "no paused deployment at these coordinates",
                StatusCode::NOT_FOUND,
            )
            .into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{build_router, StaticConfigurationService};
    use axum::body::Body;
    use axum::http::Request;
    use helmsman_coordination::CoordinationStore;
    use helmsman_engine::{EngineConfig, PipelineEngine};
    use helmsman_orchestrator::Orchestrator;
    use helmsman_remote::{AsgClient, RemoteConfig};
    use helmsman_store::DeploymentStore;
    use helmsman_tracker::TaskTracker;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn test_state() -> (ApiState, watch::Sender<bool>) {
        let store = DeploymentStore::open_in_memory().unwrap();
        let coordination = CoordinationStore::open_in_memory("helmsman").unwrap();
        let remote = Arc::new(AsgClient::new(RemoteConfig::default()).unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = TaskTracker::new(
            Arc::clone(&remote),
            store.clone(),
            Duration::from_millis(10),
            shutdown_rx.clone(),
        );
        let engine = PipelineEngine::new(
            store.clone(),
            coordination.clone(),
            remote,
            tracker,
            EngineConfig::default(),
            shutdown_rx,
        );
        let orchestrator = Orchestrator::new(store.clone(), coordination.clone(), engine);

        let mut defaults = Parameters::new();
        defaults.set("min", 1);
        defaults.set("max", 2);
        let config_service = StaticConfigurationService::new()
            .with_image("ami-1", "foo")
            .with_image("ami-2", "bar")
            .with_hash("foo", "prod", "abc123")
            .with_parameters("foo", "prod", "eu-west-1", defaults);

        let state = ApiState {
            store,
            queue: coordination.queue(),
            coordination,
            orchestrator,
            config_service: Arc::new(config_service),
            service_name: "helmsman".to_string(),
            version: "0.3.0".to_string(),
        };
        (state, shutdown_tx)
    }

    fn deploy_request() -> DeployRequest {
        DeployRequest {
            environment: "prod".to_string(),
            region: "eu-west-1".to_string(),
            ami: "ami-1".to_string(),
            user: "alice".to_string(),
            message: "ship it".to_string(),
            parameters: Parameters::new(),
        }
    }

    #[tokio::test]
    async fn ping_pongs() {
        let (state, _shutdown) = test_state();
        let router = build_router(state);

        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_reports_name_and_version() {
        let (state, _shutdown) = test_state();
        let resp = status(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn deploy_creates_document_and_enqueues() {
        let (state, _shutdown) = test_state();
        let resp = deploy(
            State(state.clone()),
            Path("foo".to_string()),
            Json(deploy_request()),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let deployments = state.store.list().unwrap();
        assert_eq!(deployments.len(), 1);
        let deployment = &deployments[0];
        assert_eq!(deployment.application, "foo");
        assert_eq!(deployment.hash.as_deref(), Some("abc123"));
        assert_eq!(deployment.tasks.len(), 6);
        assert!(deployment.tasks.iter().all(|t| !t.status.is_terminal()));
        // Defaults merged under protected keys.
        assert_eq!(deployment.parameters.min(), Some(1));
        assert_eq!(deployment.parameters.str_value("image_id"), Some("ami-1"));
        assert_eq!(
            deployment.parameters.str_value("ticket"),
            Some(deployment.id.as_str())
        );

        assert_eq!(state.queue.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn deploy_user_parameters_override_defaults_not_protected() {
        let (state, _shutdown) = test_state();
        let mut request = deploy_request();
        request.parameters.set("min", 5);
        request.parameters.set("image_id", "ami-other");

        deploy(State(state.clone()), Path("foo".to_string()), Json(request)).await;

        let deployment = state.store.list().unwrap().remove(0);
        assert_eq!(deployment.parameters.min(), Some(5)); // user beat default
        assert_eq!(deployment.parameters.str_value("image_id"), Some("ami-1")); // protected won
    }

    #[tokio::test]
    async fn deploy_image_mismatch_creates_nothing() {
        let (state, _shutdown) = test_state();
        let mut request = deploy_request();
        request.ami = "ami-2".to_string(); // belongs to bar

        let resp = deploy(State(state.clone()), Path("foo".to_string()), Json(request))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.store.list().unwrap().is_empty());
        assert!(state.queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn deploy_unknown_image_is_rejected() {
        let (state, _shutdown) = test_state();
        let mut request = deploy_request();
        request.ami = "ami-unknown".to_string();

        let resp = deploy(State(state.clone()), Path("foo".to_string()), Json(request))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deploy_invalid_ami_format_is_rejected() {
        let (state, _shutdown) = test_state();
        let mut request = deploy_request();
        request.ami = "not-an-image".to_string();

        let resp = deploy(State(state.clone()), Path("foo".to_string()), Json(request))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deploy_refused_while_locked() {
        let (state, _shutdown) = test_state();
        state.coordination.set_lock().unwrap();

        let resp = deploy(
            State(state.clone()),
            Path("foo".to_string()),
            Json(deploy_request()),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::LOCKED);
        assert!(state.store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deploy_conflicts_with_in_progress() {
        let (state, _shutdown) = test_state();
        state
            .coordination
            .register_in_progress("foo", "prod", "eu-west-1", "d-0")
            .unwrap();

        let resp = deploy(
            State(state.clone()),
            Path("foo".to_string()),
            Json(deploy_request()),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(state.store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pause_registers_once() {
        let (state, _shutdown) = test_state();
        let body = CoordinatesRequest {
            environment: "prod".to_string(),
            region: "eu-west-1".to_string(),
        };
        let resp = pause(State(state.clone()), Path("foo".to_string()), Json(body))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state
            .coordination
            .pause_registered("foo", "prod", "eu-west-1")
            .unwrap());
    }

    #[tokio::test]
    async fn resume_without_paused_deployment_is_not_found() {
        let (state, _shutdown) = test_state();
        let body = CoordinatesRequest {
            environment: "prod".to_string(),
            region: "eu-west-1".to_string(),
        };
        let resp = resume(State(state), Path("foo".to_string()), Json(body))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_registers_request() {
        let (state, _shutdown) = test_state();
        let body = CoordinatesRequest {
            environment: "prod".to_string(),
            region: "eu-west-1".to_string(),
        };
        let resp = cancel(State(state.clone()), Path("foo".to_string()), Json(body))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state
            .coordination
            .cancel_registered("foo", "prod", "eu-west-1")
            .unwrap());
    }
}
