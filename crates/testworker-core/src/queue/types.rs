//! Wire types exchanged with the queue and scheduler.
//!
//! Field names follow the queue's camelCase JSON. Unknown fields sent by
//! the service are ignored on deserialization.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Human-facing description attached to tasks and graphs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    pub name: String,
    pub description: String,
    pub owner: String,
    pub source: String,
}

/// A task as submitted to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub provisioner_id: String,
    pub worker_type: String,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub retries: u32,
    pub created: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Maximum run time in seconds; only used by task-graph templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Worker-specific payload, opaque to the harness.
    pub payload: Value,
    pub metadata: TaskMetadata,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Lifecycle state of a task or of one of its runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Unscheduled,
    Pending,
    Running,
    Completed,
    Failed,
    Exception,
    #[serde(other)]
    Unknown,
}

/// One execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub run_id: u32,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_resolved: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Explicit success flag, when the queue reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<DateTime<Utc>>,
}

impl RunInfo {
    /// Whether the run succeeded: the explicit flag if present, otherwise
    /// whether the run resolved as completed.
    pub fn succeeded(&self) -> bool {
        self.success.unwrap_or(self.state == TaskState::Completed)
    }
}

/// Status structure returned by the queue and embedded in completion
/// messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: String,
    pub provisioner_id: String,
    pub worker_type: String,
    pub deadline: DateTime<Utc>,
    pub state: TaskState,
    #[serde(default)]
    pub retries_left: u32,
    #[serde(default)]
    pub runs: Vec<RunInfo>,
}

impl TaskStatus {
    /// The most recent run.
    pub fn latest_run(&self) -> Option<&RunInfo> {
        self.runs.last()
    }

    /// The run at position `run_id`.
    pub fn run(&self, run_id: u32) -> Option<&RunInfo> {
        self.runs.get(run_id as usize)
    }
}

/// Descriptor of an artifact uploaded by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    pub storage_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

/// One page of an artifact listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactPage {
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
}

/// A task inside a task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphTask {
    pub label: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub reruns: u32,
    pub task: TaskDefinition,
}

/// A task graph submitted to the scheduler.
///
/// Task templates may reference `{{key}}` placeholders which the scheduler
/// fills in from `params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGraph {
    pub version: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub routing: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub metadata: TaskMetadata,
    pub tasks: Vec<GraphTask>,
}

impl TaskGraph {
    /// Replace every `{{key}}` in `template` with the matching parameter.
    /// Unknown placeholders are left as they are.
    pub fn substitute(&self, template: &str) -> String {
        self.params
            .iter()
            .fold(template.to_string(), |acc, (key, value)| {
                acc.replace(&format!("{{{{{key}}}}}"), value)
            })
    }

    /// The graph's task at `index` with routing placeholders resolved.
    pub fn resolved_task(&self, index: usize) -> Option<TaskDefinition> {
        let mut task = self.tasks.get(index)?.task.clone();
        task.provisioner_id = self.substitute(&task.provisioner_id);
        task.worker_type = self.substitute(&task.worker_type);
        Some(task)
    }
}

/// Scheduler acknowledgment for a created task graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGraphStatus {
    pub task_graph_id: String,
    pub state: String,
}
