//! Orchestrator — dequeues requests and enforces admission invariants.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use helmsman_coordination::{ConsumerOptions, CoordinationStore, QueueHandler};
use helmsman_engine::PipelineEngine;
use helmsman_store::{Deployment, DeploymentStore, LogEntry, TaskStatus};

use crate::error::{OrchestratorError, OrchestratorResult};

/// The payload carried on the work queue for one deployment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedDeployment {
    pub deployment_id: String,
}

/// Admits deployments, handles operator requests, restarts interrupted
/// work on process start.
#[derive(Clone)]
pub struct Orchestrator {
    store: DeploymentStore,
    coordination: CoordinationStore,
    engine: PipelineEngine,
}

impl Orchestrator {
    pub fn new(
        store: DeploymentStore,
        coordination: CoordinationStore,
        engine: PipelineEngine,
    ) -> Self {
        Self {
            store,
            coordination,
            engine,
        }
    }

    /// Admit one dequeued deployment request.
    ///
    /// Refusals (intake locked, coordinates already occupied) are
    /// recorded on the deployment document and returned as errors so the
    /// queue consumer can decide to ack rather than redeliver.
    pub async fn handle_request(&self, deployment_id: &str) -> OrchestratorResult<()> {
        let deployment = self
            .store
            .get(deployment_id)?
            .ok_or_else(|| OrchestratorError::UnknownDeployment(deployment_id.to_string()))?;
        let (app, env, region) = (
            deployment.application.clone(),
            deployment.environment.clone(),
            deployment.region.clone(),
        );

        if self.coordination.locked()? {
            warn!(%deployment_id, "refusing deployment, intake is locked");
            self.refuse(deployment, "Deployment intake is locked")?;
            return Err(OrchestratorError::Locked);
        }

        if !self
            .coordination
            .register_in_progress(&app, &env, &region, deployment_id)?
        {
            warn!(%deployment_id, %app, %env, %region, "refusing deployment, coordinates already occupied");
            self.refuse(
                deployment,
                "Another deployment is already in progress at these coordinates",
            )?;
            return Err(OrchestratorError::AlreadyInProgress {
                application: app,
                environment: env,
                region,
            });
        }

        if let Err(e) = self.engine.start_deployment(deployment_id).await {
            // Give the slot back rather than leaking it.
            let _ = self.coordination.end_deployment(&app, &env, &region);
            return Err(e.into());
        }
        Ok(())
    }

    /// Stamp a refused deployment so the history shows why it never ran.
    fn refuse(&self, mut deployment: Deployment, reason: &str) -> OrchestratorResult<()> {
        if let Some(task) = deployment.tasks.first_mut() {
            task.log.push(LogEntry::now(reason));
        }
        deployment.end = Some(Utc::now());
        self.store.upsert(&deployment)?;
        Ok(())
    }

    /// The queue-consumer handler feeding [`handle_request`].
    pub fn queue_handler(&self) -> QueueHandler {
        let orchestrator = self.clone();
        Arc::new(move |payload| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                let message: QueuedDeployment = match serde_json::from_slice(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        // A payload that never parses would otherwise be
                        // redelivered forever.
                        error!(error = %e, "discarding unparseable queue payload");
                        return Ok(());
                    }
                };
                match orchestrator.handle_request(&message.deployment_id).await {
                    Ok(()) => Ok(()),
                    // Refusals are recorded on the document; ack the message.
                    Err(OrchestratorError::Locked)
                    | Err(OrchestratorError::AlreadyInProgress { .. }) => Ok(()),
                    Err(OrchestratorError::UnknownDeployment(id)) => {
                        warn!(deployment_id = %id, "dropping request for unknown deployment");
                        Ok(())
                    }
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            })
        })
    }

    /// Start the queue worker pool.
    pub fn spawn_workers(
        &self,
        options: ConsumerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        self.coordination
            .queue()
            .consume(self.queue_handler(), options, shutdown)
    }

    // ── Operator requests ──────────────────────────────────────────

    /// Request a pause at the next task boundary; true iff newly registered.
    pub fn pause(&self, app: &str, env: &str, region: &str) -> OrchestratorResult<bool> {
        Ok(self.coordination.register_pause(app, env, region)?)
    }

    /// Request cancellation at the next task boundary; true iff newly registered.
    pub fn cancel(&self, app: &str, env: &str, region: &str) -> OrchestratorResult<bool> {
        Ok(self.coordination.register_cancel(app, env, region)?)
    }

    /// Resume a paused deployment.
    pub async fn resume(&self, app: &str, env: &str, region: &str) -> OrchestratorResult<()> {
        self.engine.resume(app, env, region).await?;
        Ok(())
    }

    // ── Restart sweep ──────────────────────────────────────────────

    /// Revive deployments interrupted by a process restart.
    ///
    /// Only deployments whose in-progress mapping still names them are
    /// restarted. A deployment that started but lost its mapping (an
    /// operator cleared it) is marked broken for human triage; one that
    /// never started is left alone, since the persistent queue still owns it.
    pub async fn restart_sweep(&self) -> OrchestratorResult<usize> {
        let incomplete = self.store.find_incomplete()?;
        let mut restarted = 0;

        for deployment in incomplete {
            let owner = self.coordination.in_progress(
                &deployment.application,
                &deployment.environment,
                &deployment.region,
            )?;
            match owner {
                Some(owner) if owner == deployment.id => {
                    info!(deployment_id = %deployment.id, "restarting interrupted deployment");
                    if let Err(e) = self.engine.restart(deployment).await {
                        error!(error = %e, "failed to restart deployment");
                        continue;
                    }
                    restarted += 1;
                }
                _ if deployment.start.is_some() => {
                    self.mark_broken(deployment)?;
                }
                _ => {
                    // Enqueued but never started: queue redelivery owns it.
                }
            }
        }

        info!(restarted, "restart sweep finished");
        Ok(restarted)
    }

    fn mark_broken(&self, mut deployment: Deployment) -> OrchestratorResult<()> {
        warn!(
            deployment_id = %deployment.id,
            "in-progress marker is gone, marking deployment broken"
        );
        let now = Utc::now();
        for task in &mut deployment.tasks {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Failed;
                task.end = Some(now);
                task.log.push(LogEntry::now(
                    "Deployment was interrupted and its in-progress marker is gone",
                ));
            }
        }
        deployment.end = Some(now);
        self.store.upsert(&deployment)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsman_engine::EngineConfig;
    use helmsman_remote::{AsgClient, RemoteConfig};
    use helmsman_store::{standard_task_list, Parameters};
    use helmsman_tracker::TaskTracker;
    use std::time::Duration;

    fn test_orchestrator() -> (
        Orchestrator,
        DeploymentStore,
        CoordinationStore,
        watch::Sender<bool>,
    ) {
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
            EngineConfig {
                task_retries: 2,
                health_poll_interval: Duration::from_millis(10),
                ..EngineConfig::default()
            },
            shutdown_rx,
        );
        let orchestrator = Orchestrator::new(store.clone(), coordination.clone(), engine);
        (orchestrator, store, coordination, shutdown_tx)
    }

    fn test_deployment(id: &str) -> Deployment {
        Deployment {
            id: id.to_string(),
            application: "foo".to_string(),
            environment: "prod".to_string(),
            region: "eu-west-1".to_string(),
            ami: "ami-1".to_string(),
            user: "alice".to_string(),
            message: "ship it".to_string(),
            hash: None,
            parameters: Parameters::new(),
            tasks: standard_task_list(),
            created: Utc::now(),
            start: None,
            end: None,
        }
    }

    #[tokio::test]
    async fn unknown_deployment_is_rejected() {
        let (orchestrator, _, _, _shutdown) = test_orchestrator();
        let err = orchestrator.handle_request("nope").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownDeployment(_)));
    }

    #[tokio::test]
    async fn locked_intake_refuses_and_records() {
        let (orchestrator, store, coordination, _shutdown) = test_orchestrator();
        store.upsert(&test_deployment("d-1")).unwrap();
        coordination.set_lock().unwrap();

        let err = orchestrator.handle_request("d-1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Locked));

        let deployment = store.get("d-1").unwrap().unwrap();
        assert!(deployment.end.is_some());
        assert!(deployment.tasks[0]
            .log
            .iter()
            .any(|entry| entry.message.contains("locked")));
        // The slot was never taken.
        assert!(coordination
            .in_progress("foo", "prod", "eu-west-1")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn occupied_coordinates_refuse_second_request() {
        let (orchestrator, store, coordination, _shutdown) = test_orchestrator();
        store.upsert(&test_deployment("d-2")).unwrap();
        coordination
            .register_in_progress("foo", "prod", "eu-west-1", "d-1")
            .unwrap();

        let err = orchestrator.handle_request("d-2").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyInProgress { .. }));

        // The original owner is untouched.
        assert_eq!(
            coordination.in_progress("foo", "prod", "eu-west-1").unwrap(),
            Some("d-1".to_string())
        );
        let refused = store.get("d-2").unwrap().unwrap();
        assert!(refused.end.is_some());
    }

    #[tokio::test]
    async fn pause_and_cancel_register_requests() {
        let (orchestrator, _, coordination, _shutdown) = test_orchestrator();

        assert!(orchestrator.pause("foo", "prod", "eu-west-1").unwrap());
        assert!(!orchestrator.pause("foo", "prod", "eu-west-1").unwrap());
        assert!(coordination.pause_registered("foo", "prod", "eu-west-1").unwrap());

        assert!(orchestrator.cancel("foo", "prod", "eu-west-1").unwrap());
        assert!(coordination.cancel_registered("foo", "prod", "eu-west-1").unwrap());
    }

    #[tokio::test]
    async fn resume_without_paused_deployment_fails() {
        let (orchestrator, _, _, _shutdown) = test_orchestrator();
        let err = orchestrator.resume("foo", "prod", "eu-west-1").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Engine(helmsman_engine::EngineError::NotPaused { .. })
        ));
    }

    #[tokio::test]
    async fn sweep_marks_started_orphans_broken() {
        let (orchestrator, store, _, _shutdown) = test_orchestrator();

        let mut orphan = test_deployment("d-orphan");
        orphan.start = Some(Utc::now());
        orphan.tasks[0].status = TaskStatus::Completed;
        orphan.tasks[1].status = TaskStatus::Running;
        store.upsert(&orphan).unwrap();

        let restarted = orchestrator.restart_sweep().await.unwrap();
        assert_eq!(restarted, 0);

        let after = store.get("d-orphan").unwrap().unwrap();
        assert!(after.end.is_some());
        assert_eq!(after.tasks[1].status, TaskStatus::Failed);
        assert!(after.tasks[1]
            .log
            .iter()
            .any(|entry| entry.message.contains("interrupted")));
    }

    #[tokio::test]
    async fn sweep_leaves_never_started_deployments_alone() {
        let (orchestrator, store, _, _shutdown) = test_orchestrator();
        store.upsert(&test_deployment("d-queued")).unwrap();

        let restarted = orchestrator.restart_sweep().await.unwrap();
        assert_eq!(restarted, 0);

        let after = store.get("d-queued").unwrap().unwrap();
        assert!(after.end.is_none());
        assert!(after.tasks.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[tokio::test]
    async fn sweep_restarts_owned_interrupted_deployments() {
        let (orchestrator, store, coordination, _shutdown) = test_orchestrator();

        let mut interrupted = test_deployment("d-interrupted");
        interrupted.start = Some(Utc::now());
        interrupted.tasks[0].status = TaskStatus::Running;
        interrupted.tasks[0].url = Some("http://127.0.0.1:1/task/1.json".to_string());
        store.upsert(&interrupted).unwrap();
        coordination
            .register_in_progress("foo", "prod", "eu-west-1", "d-interrupted")
            .unwrap();

        let restarted = orchestrator.restart_sweep().await.unwrap();
        assert_eq!(restarted, 1);

        let after = store.get("d-interrupted").unwrap().unwrap();
        assert!(after.tasks[0]
            .log
            .iter()
            .any(|entry| entry.message.contains("Resumed tracking")));
    }
}
