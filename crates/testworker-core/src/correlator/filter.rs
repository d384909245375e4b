//! Completion filters and the messages they select.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::process::WorkerIdentity;
use crate::queue::TaskStatus;

/// Exchange on which the queue announces completed tasks.
pub const TASK_COMPLETED_EXCHANGE: &str = "exchange/taskcluster-queue/v1/task-completed";

/// Which completion notifications a subscription should deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionFilter {
    /// Exactly one task, whose id the caller minted before submitting.
    Task { task_id: String },
    /// Any task completed by this worker. Used when the submission itself
    /// assigns the task id; two concurrent submissions on the same identity
    /// cannot be told apart.
    Worker(WorkerIdentity),
}

impl CompletionFilter {
    /// Match only `task_id`.
    pub fn task(task_id: impl Into<String>) -> Self {
        Self::Task {
            task_id: task_id.into(),
        }
    }

    /// Match any task completed by `identity`.
    pub fn worker(identity: WorkerIdentity) -> Self {
        Self::Worker(identity)
    }

    /// Routing-key pattern to bind on [`TASK_COMPLETED_EXCHANGE`].
    ///
    /// Key layout: `primary.<taskId>.<runId>.<workerGroup>.<workerId>.`
    /// `<provisionerId>.<workerType>.#`, with `*` for unconstrained words.
    pub fn routing_key_pattern(&self) -> String {
        let (task_id, worker_id, provisioner_id, worker_type) = match self {
            Self::Task { task_id } => (task_id.as_str(), "*", "*", "*"),
            Self::Worker(identity) => (
                "*",
                identity.worker_id.as_str(),
                identity.provisioner_id.as_str(),
                identity.worker_type.as_str(),
            ),
        };
        format!("primary.{task_id}.*.*.{worker_id}.{provisioner_id}.{worker_type}.#")
    }

    /// Client-side check that a decoded completion really belongs to this
    /// filter.
    pub fn matches(&self, completion: &TaskCompleted) -> bool {
        let status = &completion.status;
        match self {
            Self::Task { task_id } => &status.task_id == task_id,
            Self::Worker(identity) => {
                let worker_id = completion
                    .worker_id
                    .as_deref()
                    .or_else(|| status.latest_run().and_then(|run| run.worker_id.as_deref()));
                status.provisioner_id == identity.provisioner_id
                    && status.worker_type == identity.worker_type
                    && worker_id.is_none_or(|id| id == identity.worker_id)
            }
        }
    }
}

/// A raw message delivered by the notification channel.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Value,
}

/// Decoded payload of a task-completed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompleted {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl CompletionMessage {
    /// Decode the payload as a task-completed event.
    pub fn decode(&self) -> serde_json::Result<TaskCompleted> {
        serde_json::from_value(self.payload.clone())
    }
}
