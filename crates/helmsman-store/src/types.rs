//! Domain types for deployment documents.
//!
//! A `Deployment` is the persistent record of one attempt to ship a
//! machine image to an (application, environment, region). It carries the
//! merged parameter map and the ordered task list the pipeline engine
//! works through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unique identifier for a deployment (opaque, assigned at intake).
pub type DeploymentId = String;

// ── Actions ────────────────────────────────────────────────────────

/// The closed set of pipeline actions, in no particular order.
///
/// The standard task list (see [`standard_task_list`]) fixes the order in
/// which a deployment executes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    CreateAsg,
    WaitForInstanceHealth,
    EnableAsg,
    WaitForElbHealth,
    DisableAsg,
    DeleteAsg,
}

impl Action {
    /// The wire/document name of this action (`create-asg`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Action::CreateAsg => "create-asg",
            Action::WaitForInstanceHealth => "wait-for-instance-health",
            Action::EnableAsg => "enable-asg",
            Action::WaitForElbHealth => "wait-for-elb-health",
            Action::DisableAsg => "disable-asg",
            Action::DeleteAsg => "delete-asg",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

/// Status of a single pipeline task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    Skipped,
}

impl TaskStatus {
    /// Terminal statuses: the task will never run again.
    ///
    /// `pending` is deliberately NOT terminal: a pending task makes its
    /// deployment incomplete for restart purposes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Terminated
                | TaskStatus::Skipped
        )
    }
}

/// A timestamped log line appended to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    /// A log entry stamped with the current time.
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

/// An element of a deployment's ordered task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique within the deployment.
    pub task_id: String,
    pub action: Action,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end: Option<DateTime<Utc>>,
    /// Remote task URL being polled, when this task drives a remote job.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
    /// Last update reported by the remote service.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

impl Task {
    /// A fresh pending task.
    pub fn new(task_id: impl Into<String>, action: Action) -> Self {
        Self {
            task_id: task_id.into(),
            action,
            status: TaskStatus::Pending,
            start: None,
            end: None,
            url: None,
            updated: None,
            log: Vec::new(),
        }
    }
}

/// The fixed task list for a standard deployment, all statuses `pending`.
pub fn standard_task_list() -> Vec<Task> {
    [
        Action::CreateAsg,
        Action::WaitForInstanceHealth,
        Action::EnableAsg,
        Action::WaitForElbHealth,
        Action::DisableAsg,
        Action::DeleteAsg,
    ]
    .iter()
    .enumerate()
    .map(|(i, action)| Task::new(format!("{:02}-{}", i + 1, action), *action))
    .collect()
}

// ── Parameters ─────────────────────────────────────────────────────

/// Per-task deployment inputs: a free-form map with typed accessors for
/// the keys the pipeline reads.
///
/// Merging follows a strict precedence, defaults then user-supplied then
/// protected (operation-owned, non-overridable).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(pub Map<String, Value>);

impl Parameters {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Merge `defaults`, `user`, and `protected`, later layers winning.
    pub fn merged(defaults: &Parameters, user: &Parameters, protected: &Parameters) -> Parameters {
        let mut merged = defaults.clone();
        merged.merge_from(user);
        merged.merge_from(protected);
        merged
    }

    /// Overlay every key of `other` onto this map, last writer wins.
    pub fn merge_from(&mut self, other: &Parameters) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// String value for a key, if present and a string.
    pub fn str_value(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Numeric value for a key; numeric strings are accepted too, since
    /// configuration sources are not consistent about quoting.
    pub fn u64_value(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Scalar-or-list value flattened to a list of strings.
    pub fn list_value(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn min(&self) -> Option<u64> {
        self.u64_value("min")
    }

    pub fn health_check_type(&self) -> Option<&str> {
        self.str_value("health_check_type")
    }

    pub fn selected_load_balancers(&self) -> Vec<String> {
        self.list_value("selected_load_balancers")
    }

    pub fn selected_security_groups(&self) -> Vec<String> {
        self.list_value("selected_security_groups")
    }

    pub fn selected_zones(&self) -> Vec<String> {
        self.list_value("selected_zones")
    }

    pub fn subnet_purpose(&self) -> Option<&str> {
        self.str_value("subnet_purpose")
    }

    pub fn new_asg_name(&self) -> Option<&str> {
        self.str_value("new_asg_name")
    }

    pub fn old_asg_name(&self) -> Option<&str> {
        self.str_value("old_asg_name")
    }
}

// ── Deployment ─────────────────────────────────────────────────────

/// A persistent deployment document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub application: String,
    pub environment: String,
    pub region: String,
    /// Machine image being deployed.
    pub ami: String,
    pub user: String,
    pub message: String,
    /// Configuration revision used for this deployment.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hash: Option<String>,
    pub parameters: Parameters,
    pub tasks: Vec<Task>,
    pub created: DateTime<Utc>,
    /// Set when the first task begins.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub start: Option<DateTime<Utc>>,
    /// Set only on completion or abandonment.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end: Option<DateTime<Utc>>,
}

impl Deployment {
    /// The `app-env-region` coordinates this deployment occupies.
    pub fn coordinates(&self) -> String {
        format!("{}-{}-{}", self.application, self.environment, self.region)
    }

    /// Logical cluster name grouping successive ASG generations.
    pub fn cluster_name(&self) -> String {
        format!("{}-{}", self.application, self.environment)
    }

    /// Index of the first task not in a terminal status.
    pub fn first_incomplete_task(&self) -> Option<usize> {
        self.tasks.iter().position(|t| !t.status.is_terminal())
    }

    /// Whether every task has reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Index of the task with the given id.
    pub fn task_index(&self, task_id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.task_id == task_id)
    }
}
