//! PipelineEngine — selects, starts, and finishes deployment tasks.
//!
//! Each deployment is logically single-threaded: its tasks run strictly
//! in list order, and a task's terminal callback happens-before the
//! successor's start. The engine therefore never takes in-process locks;
//! the coordination store's set-if-absent is the only cross-deployment
//! synchronization.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use helmsman_coordination::CoordinationStore;
use helmsman_remote::{
    created_group_name, form_fields, AsgClient, ClusterAction, RemoteError, TransformContext,
};
use helmsman_store::{
    Action, Deployment, DeploymentId, DeploymentStore, LogEntry, Parameters, Task, TaskStatus,
};
use helmsman_tracker::{TaskCallback, TaskTracker, DEFAULT_POLL_BUDGET};

use crate::error::{EngineError, EngineResult};

/// Engine tuning, shared by every deployment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Poll budget handed to the tracker per remote task.
    pub task_retries: u32,
    /// Interval between health-wait polls.
    pub health_poll_interval: Duration,
    /// Port probed on each instance during the instance-health wait.
    pub instance_health_port: u16,
    /// Path probed on each instance during the instance-health wait.
    pub instance_health_path: String,
    /// Security groups appended to every deployment's selection.
    pub required_security_groups: Vec<String>,
    /// Environment name → VPC id, for VPC-scoped load balancers.
    pub vpc_ids: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_retries: DEFAULT_POLL_BUDGET,
            health_poll_interval: Duration::from_secs(1),
            instance_health_port: 8080,
            instance_health_path: "/healthcheck".to_string(),
            required_security_groups: Vec::new(),
            vpc_ids: HashMap::new(),
        }
    }
}

/// Which side of the replacement an action targets.
#[derive(Debug, Clone, Copy)]
enum AsgTarget {
    New,
    Old,
}

/// How a dispatched action hands control back.
enum Dispatch {
    /// The action is being tracked (or polled) asynchronously; a
    /// terminal callback will advance the pipeline.
    Tracked,
    /// The action completed in-line; finish the task now.
    FinishedInline,
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The per-deployment pipeline state machine.
#[derive(Clone)]
pub struct PipelineEngine {
    store: DeploymentStore,
    coordination: CoordinationStore,
    remote: Arc<AsgClient>,
    tracker: TaskTracker,
    config: Arc<EngineConfig>,
    shutdown: watch::Receiver<bool>,
}

impl PipelineEngine {
    pub fn new(
        store: DeploymentStore,
        coordination: CoordinationStore,
        remote: Arc<AsgClient>,
        tracker: TaskTracker,
        config: EngineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            coordination,
            remote,
            tracker,
            config: Arc::new(config),
            shutdown,
        }
    }

    pub(crate) fn store(&self) -> &DeploymentStore {
        &self.store
    }

    pub(crate) fn remote(&self) -> &AsgClient {
        &self.remote
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    // ── Deployment lifecycle ───────────────────────────────────────

    /// Stamp the deployment's `start` and begin its first task.
    pub async fn start_deployment(&self, id: &str) -> EngineResult<()> {
        let mut deployment = self
            .store
            .get(id)?
            .ok_or_else(|| EngineError::UnknownDeployment(id.to_string()))?;
        deployment.start = Some(Utc::now());
        self.store.upsert(&deployment)?;
        info!(
            deployment_id = %id,
            application = %deployment.application,
            environment = %deployment.environment,
            region = %deployment.region,
            ami = %deployment.ami,
            "deployment starting"
        );

        match deployment.first_incomplete_task() {
            Some(index) => {
                self.start_task_at(deployment, index).await;
                Ok(())
            }
            None => {
                self.finalize_completed(deployment).await;
                Ok(())
            }
        }
    }

    /// Resume a paused deployment from its next task.
    pub async fn resume(&self, app: &str, env: &str, region: &str) -> EngineResult<()> {
        let id = self
            .coordination
            .paused(app, env, region)?
            .ok_or_else(|| EngineError::NotPaused {
                application: app.to_string(),
                environment: env.to_string(),
                region: region.to_string(),
            })?;
        self.coordination.resume(app, env, region)?;

        let deployment = self
            .store
            .get(&id)?
            .ok_or_else(|| EngineError::UnknownDeployment(id.clone()))?;
        info!(deployment_id = %id, "deployment resuming");

        match deployment.first_incomplete_task() {
            Some(index) => self.advance(deployment, index).await,
            None => self.finalize_completed(deployment).await,
        }
        Ok(())
    }

    /// Revive a deployment interrupted by a process restart.
    ///
    /// A task that was mid-flight with a task URL is handed back to the
    /// tracker with a fresh budget; anything else is re-started.
    pub async fn restart(&self, deployment: Deployment) -> EngineResult<()> {
        let Some(index) = deployment.first_incomplete_task() else {
            self.finalize_completed(deployment).await;
            return Ok(());
        };
        let mut task = deployment.tasks[index].clone();
        if task.status == TaskStatus::Running && task.url.is_some() {
            info!(
                deployment_id = %deployment.id,
                task_id = %task.task_id,
                "re-attaching tracker to interrupted task"
            );
            task.log.push(LogEntry::now("Resumed tracking after restart"));
            self.store.update_task(&deployment.id, &task)?;
            self.track_task(&deployment.id, task);
        } else {
            info!(
                deployment_id = %deployment.id,
                task_id = %task.task_id,
                "restarting interrupted task"
            );
            self.advance(deployment, index).await;
        }
        Ok(())
    }

    // ── Task lifecycle ─────────────────────────────────────────────

    /// Start the task at `index`, applying skip rules first.
    async fn start_task_at(&self, deployment: Deployment, index: usize) {
        let mut task = deployment.tasks[index].clone();

        if let Some(reason) = skip_reason(&deployment, task.action) {
            info!(deployment_id = %deployment.id, task_id = %task.task_id, reason, "skipping task");
            task.status = TaskStatus::Skipped;
            task.log.push(LogEntry::now(reason));
            self.task_finished(deployment.id.clone(), task).await;
            return;
        }

        task.start = Some(Utc::now());
        task.status = TaskStatus::Running;
        if let Err(e) = self.store.update_task(&deployment.id, &task) {
            error!(deployment_id = %deployment.id, task_id = %task.task_id, error = %e, "could not persist task start");
            return;
        }
        info!(deployment_id = %deployment.id, task_id = %task.task_id, action = %task.action, "task starting");

        let result = match task.action {
            Action::CreateAsg => self.run_create_asg(&deployment, &mut task).await,
            Action::EnableAsg => {
                self.run_cluster_action(&deployment, &mut task, ClusterAction::Activate, AsgTarget::New)
                    .await
            }
            Action::DisableAsg => {
                self.run_cluster_action(&deployment, &mut task, ClusterAction::Deactivate, AsgTarget::Old)
                    .await
            }
            Action::DeleteAsg => {
                self.run_cluster_action(&deployment, &mut task, ClusterAction::Delete, AsgTarget::Old)
                    .await
            }
            Action::WaitForInstanceHealth => {
                self.spawn_instance_health(&deployment, &task);
                Ok(Dispatch::Tracked)
            }
            Action::WaitForElbHealth => {
                self.spawn_elb_health(&deployment, &task);
                Ok(Dispatch::Tracked)
            }
        };

        match result {
            Ok(Dispatch::Tracked) => {}
            Ok(Dispatch::FinishedInline) => {
                self.task_finished(deployment.id.clone(), task).await;
            }
            Err(e) => {
                self.fail_task(&deployment.id, task, &e).await;
            }
        }
    }

    /// Completion callback: persist the finished task, then finalize or
    /// advance through the task boundary.
    pub async fn task_finished(&self, deployment_id: DeploymentId, mut task: Task) {
        if task.status != TaskStatus::Skipped {
            task.status = TaskStatus::Completed;
        }
        task.end = Some(Utc::now());
        if let Err(e) = self.store.update_task(&deployment_id, &task) {
            error!(%deployment_id, task_id = %task.task_id, error = %e, "could not persist finished task");
            return;
        }
        info!(%deployment_id, task_id = %task.task_id, status = ?task.status, "task finished");

        // A next-generation create announces the new group only in its
        // task log; harvest it before anything downstream needs it.
        if task.action == Action::CreateAsg && task.status == TaskStatus::Completed {
            if let Err(e) = self.capture_created_group(&deployment_id, &task) {
                warn!(%deployment_id, error = %e, "deployment failed");
                if let Ok(Some(deployment)) = self.store.get(&deployment_id) {
                    self.finalize_failed(deployment).await;
                }
                return;
            }
        }

        let deployment = match self.store.get(&deployment_id) {
            Ok(Some(deployment)) => deployment,
            Ok(None) => {
                error!(%deployment_id, "deployment document vanished");
                return;
            }
            Err(e) => {
                error!(%deployment_id, error = %e, "could not load deployment");
                return;
            }
        };

        match deployment.first_incomplete_task() {
            None => self.finalize_completed(deployment).await,
            Some(next) => self.boundary_advance(deployment, next).await,
        }
    }

    /// Timeout callback: the task failed its polling horizon; the
    /// deployment is finalized failed with no pipeline-level retry.
    pub async fn task_timed_out(&self, deployment_id: DeploymentId, mut task: Task) {
        task.status = TaskStatus::Failed;
        task.end = Some(Utc::now());
        task.log.push(LogEntry::now("Task timed out"));
        if let Err(e) = self.store.update_task(&deployment_id, &task) {
            error!(%deployment_id, task_id = %task.task_id, error = %e, "could not persist timed-out task");
            return;
        }
        warn!(%deployment_id, task_id = %task.task_id, "task timed out");

        match self.store.get(&deployment_id) {
            Ok(Some(deployment)) => self.finalize_failed(deployment).await,
            Ok(None) => error!(%deployment_id, "deployment document vanished"),
            Err(e) => error!(%deployment_id, error = %e, "could not load deployment"),
        }
    }

    /// A handler error: fail the task and the deployment.
    pub(crate) async fn fail_task(&self, deployment_id: &str, mut task: Task, cause: &EngineError) {
        task.status = TaskStatus::Failed;
        task.end = Some(Utc::now());
        task.log.push(LogEntry::now(format!("Task failed: {cause}")));
        if let Err(e) = self.store.update_task(deployment_id, &task) {
            error!(%deployment_id, task_id = %task.task_id, error = %e, "could not persist failed task");
        }
        warn!(%deployment_id, task_id = %task.task_id, error = %cause, "task failed");

        match self.store.get(deployment_id) {
            Ok(Some(deployment)) => self.finalize_failed(deployment).await,
            Ok(None) => error!(%deployment_id, "deployment document vanished"),
            Err(e) => error!(%deployment_id, error = %e, "could not load deployment"),
        }
    }

    // ── Boundary handling ──────────────────────────────────────────

    /// Observe operator requests between tasks, then start the successor.
    async fn boundary_advance(&self, deployment: Deployment, next: usize) {
        let (app, env, region) = (
            deployment.application.clone(),
            deployment.environment.clone(),
            deployment.region.clone(),
        );

        match self.coordination.cancel_registered(&app, &env, &region) {
            Ok(true) => {
                self.cancel_deployment(deployment).await;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(deployment_id = %deployment.id, error = %e, "could not read cancellation state");
                return;
            }
        }

        match self.coordination.pause_registered(&app, &env, &region) {
            Ok(true) => {
                self.pause_deployment(&deployment);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(deployment_id = %deployment.id, error = %e, "could not read pause state");
                return;
            }
        }

        self.advance(deployment, next).await;
    }

    /// Boxed re-entry into `start_task_at`, breaking async recursion
    /// through the callback chain.
    fn advance(&self, deployment: Deployment, index: usize) -> BoxFuture {
        let engine = self.clone();
        Box::pin(async move {
            engine.start_task_at(deployment, index).await;
        })
    }

    /// Cooperative cancellation: remaining tasks are skipped, the
    /// deployment ends, and all coordination bookkeeping is cleared.
    async fn cancel_deployment(&self, mut deployment: Deployment) {
        let now = Utc::now();
        for task in &mut deployment.tasks {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Skipped;
                task.end = Some(now);
                task.log.push(LogEntry::now("Deployment cancelled"));
            }
        }
        deployment.end = Some(now);
        if let Err(e) = self.store.upsert(&deployment) {
            error!(deployment_id = %deployment.id, error = %e, "could not persist cancelled deployment");
            return;
        }
        if let Err(e) = self.coordination.end_deployment(
            &deployment.application,
            &deployment.environment,
            &deployment.region,
        ) {
            error!(deployment_id = %deployment.id, error = %e, "could not clear coordination entries");
        }
        info!(deployment_id = %deployment.id, "deployment cancelled");
    }

    /// Suspend without advancing; `resume` picks up the next task.
    fn pause_deployment(&self, deployment: &Deployment) {
        let (app, env, region) = (
            &deployment.application,
            &deployment.environment,
            &deployment.region,
        );
        if let Err(e) = self
            .coordination
            .register_paused(app, env, region, &deployment.id)
        {
            error!(deployment_id = %deployment.id, error = %e, "could not record paused deployment");
            return;
        }
        if let Err(e) = self.coordination.unregister_pause(app, env, region) {
            error!(deployment_id = %deployment.id, error = %e, "could not clear pause request");
        }
        info!(deployment_id = %deployment.id, "deployment paused, awaiting resume");
    }

    pub(crate) async fn finalize_completed(&self, mut deployment: Deployment) {
        deployment.end = Some(Utc::now());
        if let Err(e) = self.store.upsert(&deployment) {
            error!(deployment_id = %deployment.id, error = %e, "could not persist completed deployment");
            return;
        }
        if let Err(e) = self.coordination.end_deployment(
            &deployment.application,
            &deployment.environment,
            &deployment.region,
        ) {
            error!(deployment_id = %deployment.id, error = %e, "could not clear coordination entries");
        }
        info!(deployment_id = %deployment.id, "deployment completed");
    }

    pub(crate) async fn finalize_failed(&self, mut deployment: Deployment) {
        deployment.end = Some(Utc::now());
        if let Err(e) = self.store.upsert(&deployment) {
            error!(deployment_id = %deployment.id, error = %e, "could not persist failed deployment");
            return;
        }
        if let Err(e) = self.coordination.end_deployment(
            &deployment.application,
            &deployment.environment,
            &deployment.region,
        ) {
            error!(deployment_id = %deployment.id, error = %e, "could not clear coordination entries");
        }
        warn!(deployment_id = %deployment.id, "deployment failed");
    }

    // ── Action handlers ────────────────────────────────────────────

    /// Create the new ASG: a fresh cluster completes synchronously via
    /// the save endpoint, an existing cluster gets its next generation
    /// via a tracked remote task.
    async fn run_create_asg(
        &self,
        deployment: &Deployment,
        task: &mut Task,
    ) -> EngineResult<Dispatch> {
        let env = &deployment.environment;
        let region = &deployment.region;
        let cluster = deployment.cluster_name();

        let groups = self.remote.cluster_groups(env, region, &cluster).await?;
        let fields = self.build_form_fields(deployment).await?;

        match groups.last() {
            Some(previous) => {
                let mut update = Parameters::new();
                update.set("old_asg_name", previous.auto_scaling_group_name.clone());
                if let Some(image) = &previous.image {
                    update.set("old_ami", image.clone());
                }
                self.store.merge_parameters(&deployment.id, &update)?;
                info!(
                    deployment_id = %deployment.id,
                    old_asg = %previous.auto_scaling_group_name,
                    "creating next generation for existing cluster"
                );

                let task_url = self.remote.create_next_asg(env, region, &fields).await?;
                task.url = Some(task_url);
                task.log.push(LogEntry::now(format!(
                    "Creating next auto scaling group for cluster {cluster}"
                )));
                self.store.update_task(&deployment.id, task)?;
                self.track_task(&deployment.id, task.clone());
                Ok(Dispatch::Tracked)
            }
            None => {
                let name = self.remote.create_asg(env, region, &fields).await?;
                let mut update = Parameters::new();
                update.set("new_asg_name", name.clone());
                self.store.merge_parameters(&deployment.id, &update)?;
                task.log
                    .push(LogEntry::now(format!("Created auto scaling group {name}")));
                info!(deployment_id = %deployment.id, new_asg = %name, "created first ASG of cluster");
                Ok(Dispatch::FinishedInline)
            }
        }
    }

    /// Submit an enable/disable/delete against the targeted ASG,
    /// guarded by an existence precondition.
    async fn run_cluster_action(
        &self,
        deployment: &Deployment,
        task: &mut Task,
        action: ClusterAction,
        target: AsgTarget,
    ) -> EngineResult<Dispatch> {
        let env = &deployment.environment;
        let region = &deployment.region;
        let asg = match target {
            AsgTarget::New => deployment
                .parameters
                .new_asg_name()
                .ok_or(EngineError::MissingParameter("new_asg_name"))?,
            AsgTarget::Old => deployment
                .parameters
                .old_asg_name()
                .ok_or(EngineError::MissingParameter("old_asg_name"))?,
        }
        .to_string();

        self.require_asg(env, region, &asg).await?;

        let task_url = self
            .remote
            .cluster_action(env, region, action, &asg, &deployment.id)
            .await?;
        task.url = Some(task_url);
        task.log
            .push(LogEntry::now(format!("Requested {action} of {asg}")));
        self.store.update_task(&deployment.id, task)?;
        self.track_task(&deployment.id, task.clone());
        Ok(Dispatch::Tracked)
    }

    /// Precondition: the ASG must exist before it can be mutated.
    async fn require_asg(&self, env: &str, region: &str, asg: &str) -> EngineResult<()> {
        if self.remote.asg_exists(env, region, asg).await? {
            Ok(())
        } else {
            Err(EngineError::Remote(RemoteError::MissingAsg(format!(
                "auto scaling group {asg} does not exist in {region}"
            ))))
        }
    }

    /// Build the form fields for a mutating ASG request.
    async fn build_form_fields(
        &self,
        deployment: &Deployment,
    ) -> EngineResult<Vec<(String, String)>> {
        let env = &deployment.environment;
        let security_groups = self
            .remote
            .security_groups(env, &deployment.region)
            .await?;
        let ctx = TransformContext {
            region: &deployment.region,
            vpc_id: self.config.vpc_ids.get(env).map(String::as_str),
            security_groups: &security_groups,
            required_security_groups: &self.config.required_security_groups,
        };
        Ok(form_fields(&deployment.parameters, &ctx)?)
    }

    /// Hand a task URL to the tracker, wiring the terminal callbacks
    /// back into the engine.
    pub(crate) fn track_task(&self, deployment_id: &str, task: Task) {
        let complete_engine = self.clone();
        let on_complete: TaskCallback = Arc::new(move |id, task| {
            let engine = complete_engine.clone();
            Box::pin(async move {
                engine.task_finished(id, task).await;
            })
        });
        let timeout_engine = self.clone();
        let on_timeout: TaskCallback = Arc::new(move |id, task| {
            let engine = timeout_engine.clone();
            Box::pin(async move {
                engine.task_timed_out(id, task).await;
            })
        });
        self.tracker.track(
            deployment_id.to_string(),
            task,
            self.config.task_retries,
            on_complete,
            on_timeout,
        );
    }

    /// Record the ASG name announced in a next-group task log.
    fn capture_created_group(&self, deployment_id: &str, task: &Task) -> EngineResult<()> {
        let deployment = self
            .store
            .get(deployment_id)?
            .ok_or_else(|| EngineError::UnknownDeployment(deployment_id.to_string()))?;
        if deployment.parameters.new_asg_name().is_some() {
            return Ok(());
        }
        let messages: Vec<String> = task.log.iter().map(|entry| entry.message.clone()).collect();
        let name = created_group_name(&messages).ok_or_else(|| {
            EngineError::Remote(RemoteError::TaskMissing(
                "created ASG name not announced in task log".to_string(),
            ))
        })?;
        let mut update = Parameters::new();
        update.set("new_asg_name", name);
        self.store.merge_parameters(deployment_id, &update)?;
        Ok(())
    }
}

/// Why a task does not apply to this deployment, if it doesn't.
pub fn skip_reason(deployment: &Deployment, action: Action) -> Option<&'static str> {
    let params = &deployment.parameters;
    match action {
        Action::WaitForInstanceHealth => match params.min() {
            None | Some(0) => Some("Skipping instance healthcheck"),
            Some(_) => None,
        },
        Action::WaitForElbHealth => {
            if params.health_check_type() != Some("ELB")
                || params.selected_load_balancers().is_empty()
            {
                Some("Skipping ELB healthcheck")
            } else {
                None
            }
        }
        Action::DisableAsg => {
            if params.old_asg_name().is_none() {
                Some("Skipping disabling of old ASG")
            } else {
                None
            }
        }
        Action::DeleteAsg => {
            if params.old_asg_name().is_none() {
                Some("Skipping deletion of old ASG")
            } else {
                None
            }
        }
        Action::CreateAsg | Action::EnableAsg => None,
    }
}
