//! TaskTracker — the scheduled poll pool.
//!
//! Each tracked task runs as a spawned loop that sleeps one poll
//! interval per iteration and carries `(task, retries)` forward; the
//! process tolerates restarts because interrupted deployments are
//! revived by the orchestrator's startup sweep, not by resurrecting the
//! loop itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use helmsman_remote::{time as remote_time, AsgClient};
use helmsman_store::{DeploymentId, DeploymentStore, Task, TaskStatus};

use crate::error::{TrackerError, TrackerResult};

/// Default polling horizon: 3600 iterations at the 1 s default interval
/// is roughly one hour of wall clock per task.
pub const DEFAULT_POLL_BUDGET: u32 = 3600;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Terminal callback: invoked with the deployment id and the task as
/// last persisted.
pub type TaskCallback = Arc<dyn Fn(DeploymentId, Task) -> BoxFuture + Send + Sync>;

/// Polls remote task URLs until terminal status or budget exhaustion.
#[derive(Clone)]
pub struct TaskTracker {
    remote: Arc<AsgClient>,
    store: DeploymentStore,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl TaskTracker {
    pub fn new(
        remote: Arc<AsgClient>,
        store: DeploymentStore,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            remote,
            store,
            poll_interval,
            shutdown,
        }
    }

    /// Begin tracking a task. After one poll-interval delay the remote
    /// task document is fetched and merged into the stored task, then:
    ///
    /// - remote status terminal → `on_complete`, exactly once;
    /// - retry budget exhausted → `on_timeout`, exactly once;
    /// - otherwise the poll is rescheduled with one less retry.
    pub fn track(
        &self,
        deployment_id: DeploymentId,
        task: Task,
        retries: u32,
        on_complete: TaskCallback,
        on_timeout: TaskCallback,
    ) {
        let tracker = self.clone();
        tokio::spawn(async move {
            tracker
                .run(deployment_id, task, retries, on_complete, on_timeout)
                .await;
        });
    }

    async fn run(
        &self,
        deployment_id: DeploymentId,
        mut task: Task,
        mut retries: u32,
        on_complete: TaskCallback,
        on_timeout: TaskCallback,
    ) {
        let mut shutdown = self.shutdown.clone();
        debug!(%deployment_id, task_id = %task.task_id, retries, "tracking task");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    debug!(%deployment_id, task_id = %task.task_id, "tracker shutting down");
                    return;
                }
            }

            match self.poll_once(&deployment_id, &mut task).await {
                Ok(true) => {
                    debug!(%deployment_id, task_id = %task.task_id, status = ?task.status, "remote task reached terminal status");
                    on_complete(deployment_id, task).await;
                    return;
                }
                Ok(false) => {}
                Err(e) if e.is_transient() => {
                    warn!(
                        %deployment_id,
                        task_id = %task.task_id,
                        kind = e.kind(),
                        error = %e,
                        "transient failure polling task"
                    );
                }
                Err(e) => {
                    error!(
                        %deployment_id,
                        task_id = %task.task_id,
                        kind = e.kind(),
                        error = %e,
                        "unrecoverable failure polling task, leaving it for the restart sweep"
                    );
                    return;
                }
            }

            if retries == 0 {
                warn!(%deployment_id, task_id = %task.task_id, "task poll budget exhausted");
                on_timeout(deployment_id, task).await;
                return;
            }
            retries -= 1;
        }
    }

    /// One poll: fetch, merge, persist. Returns whether the remote task
    /// is terminal.
    async fn poll_once(&self, deployment_id: &str, task: &mut Task) -> TrackerResult<bool> {
        let url = task
            .url
            .clone()
            .ok_or_else(|| TrackerError::MissingTaskUrl(task.task_id.clone()))?;

        let remote_task = self.remote.fetch_task(&url).await?;

        if let Some(status) = remote_task.status.as_deref() {
            task.status = match status {
                "completed" => TaskStatus::Completed,
                "failed" => TaskStatus::Failed,
                "terminated" => TaskStatus::Terminated,
                _ => TaskStatus::Running,
            };
        }
        if !remote_task.log.is_empty() {
            task.log = remote_time::normalize_log(&remote_task.log);
        }
        if let Some(update_time) = remote_task.update_time.as_deref() {
            task.updated = remote_time::parse_update_time(update_time);
        }

        self.store.update_task(deployment_id, task)?;
        Ok(remote_task.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::get;
    use axum::Router;
    use helmsman_remote::RemoteConfig;
    use helmsman_store::{standard_task_list, Action, Deployment, Parameters};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    #[derive(Clone)]
    struct FakeTaskState {
        polls: Arc<AtomicU32>,
        /// Respond `running` until this many polls have happened.
        running_polls: u32,
    }

    async fn start_fake_task_server(running_polls: u32) -> (String, Arc<AtomicU32>) {
        let polls = Arc::new(AtomicU32::new(0));
        let state = FakeTaskState {
            polls: Arc::clone(&polls),
            running_polls,
        };
        let router = Router::new()
            .route(
                "/task/1.json",
                get(|State(state): State<FakeTaskState>| async move {
                    let seen = state.polls.fetch_add(1, Ordering::SeqCst) + 1;
                    let status = if seen > state.running_polls {
                        "completed"
                    } else {
                        "running"
                    };
                    axum::Json(serde_json::json!({
                        "status": status,
                        "log": ["2015-03-02_11:04:13 Creating auto scaling group 'foo-prod-v002'"],
                        "updateTime": "2015-03-02 11:05:00 UTC"
                    }))
                }),
            )
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), polls)
    }

    fn test_client() -> Arc<AsgClient> {
        Arc::new(
            AsgClient::new(RemoteConfig {
                environments: HashMap::new(),
                connect_timeout: Duration::from_millis(200),
                request_timeout: Duration::from_millis(500),
            })
            .unwrap(),
        )
    }

    fn test_deployment(task_url: Option<String>) -> (DeploymentStore, Deployment) {
        let store = DeploymentStore::open_in_memory().unwrap();
        let mut tasks = standard_task_list();
        tasks[0].status = TaskStatus::Running;
        tasks[0].url = task_url;
        let deployment = Deployment {
            id: "d-1".to_string(),
            application: "foo".to_string(),
            environment: "prod".to_string(),
            region: "eu-west-1".to_string(),
            ami: "ami-1".to_string(),
            user: "alice".to_string(),
            message: "ship it".to_string(),
            hash: None,
            parameters: Parameters::new(),
            tasks,
            created: chrono::Utc::now(),
            start: Some(chrono::Utc::now()),
            end: None,
        };
        store.upsert(&deployment).unwrap();
        (store, deployment)
    }

    fn channel_callbacks() -> (
        TaskCallback,
        TaskCallback,
        mpsc::UnboundedReceiver<(&'static str, Task)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let complete_tx = tx.clone();
        let on_complete: TaskCallback = Arc::new(move |_, task| {
            let tx = complete_tx.clone();
            Box::pin(async move {
                let _ = tx.send(("complete", task));
            })
        });
        let on_timeout: TaskCallback = Arc::new(move |_, task| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(("timeout", task));
            })
        });
        (on_complete, on_timeout, rx)
    }

    fn tracker(store: DeploymentStore) -> (TaskTracker, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = TaskTracker::new(
            test_client(),
            store,
            Duration::from_millis(10),
            shutdown_rx,
        );
        (tracker, shutdown_tx)
    }

    #[tokio::test]
    async fn completes_once_remote_is_terminal() {
        let (base, polls) = start_fake_task_server(2).await;
        let (store, deployment) = test_deployment(Some(format!("{base}/task/1.json")));
        let (tracker, _shutdown) = tracker(store.clone());
        let (on_complete, on_timeout, mut rx) = channel_callbacks();

        tracker.track(
            deployment.id.clone(),
            deployment.tasks[0].clone(),
            10,
            on_complete,
            on_timeout,
        );

        let (kind, task) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, "complete");
        assert_eq!(task.status, TaskStatus::Completed);
        // Two running polls plus the terminal one.
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        // The callback fires exactly once.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        // The merged document was persisted.
        let stored = store.get("d-1").unwrap().unwrap();
        assert_eq!(stored.tasks[0].status, TaskStatus::Completed);
        assert_eq!(
            stored.tasks[0].log[0].message,
            "Creating auto scaling group 'foo-prod-v002'"
        );
        assert!(stored.tasks[0].updated.is_some());
    }

    #[tokio::test]
    async fn times_out_after_retries_plus_one_polls() {
        // Never completes.
        let (base, polls) = start_fake_task_server(u32::MAX).await;
        let (store, deployment) = test_deployment(Some(format!("{base}/task/1.json")));
        let (tracker, _shutdown) = tracker(store);
        let (on_complete, on_timeout, mut rx) = channel_callbacks();

        tracker.track(
            deployment.id.clone(),
            deployment.tasks[0].clone(),
            3,
            on_complete,
            on_timeout,
        );

        let (kind, _) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, "timeout");
        assert_eq!(polls.load(Ordering::SeqCst), 4); // retries + 1
    }

    #[tokio::test]
    async fn transient_http_errors_burn_retries_then_time_out() {
        // Nothing listens on port 1: every poll is a transient http error.
        let (store, deployment) = test_deployment(Some("http://127.0.0.1:1/task/1.json".to_string()));
        let (tracker, _shutdown) = tracker(store.clone());
        let (on_complete, on_timeout, mut rx) = channel_callbacks();

        tracker.track(
            deployment.id.clone(),
            deployment.tasks[0].clone(),
            2,
            on_complete,
            on_timeout,
        );

        let (kind, _) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, "timeout");
        // The task was never advanced.
        let stored = store.get("d-1").unwrap().unwrap();
        assert_eq!(stored.tasks[0].status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn non_transient_error_propagates_without_callbacks() {
        // No task URL: a programmer error, not a retry candidate.
        let (store, deployment) = test_deployment(None);
        let (tracker, _shutdown) = tracker(store);
        let (on_complete, on_timeout, mut rx) = channel_callbacks();

        tracker.track(
            deployment.id.clone(),
            deployment.tasks[0].clone(),
            5,
            on_complete,
            on_timeout,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_stops_polling() {
        let (base, polls) = start_fake_task_server(u32::MAX).await;
        let (store, deployment) = test_deployment(Some(format!("{base}/task/1.json")));
        let (tracker, shutdown) = tracker(store);
        let (on_complete, on_timeout, mut rx) = channel_callbacks();

        tracker.track(
            deployment.id.clone(),
            deployment.tasks[0].clone(),
            1000,
            on_complete,
            on_timeout,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown.send(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let polls_at_shutdown = polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(polls.load(Ordering::SeqCst) <= polls_at_shutdown + 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn error_classification() {
        let store_err = TrackerError::Store(helmsman_store::StoreError::Read("boom".into()));
        assert!(store_err.is_transient());
        assert_eq!(store_err.kind(), "store");

        let missing = TrackerError::MissingTaskUrl("01-create-asg".into());
        assert!(!missing.is_transient());
    }

    #[test]
    fn tasks_keep_action_through_merge() {
        // Guard against the merge clobbering anything but status/log/updated.
        let mut task = standard_task_list().remove(0);
        task.status = TaskStatus::Running;
        assert_eq!(task.action, Action::CreateAsg);
    }
}
