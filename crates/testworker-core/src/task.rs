//! Builds task definitions and task graphs routed to the worker under test.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::HarnessConfig;
use crate::process::WorkerIdentity;
use crate::queue::{GraphTask, TaskDefinition, TaskGraph, TaskMetadata};

/// Label of the single task inside graphs built by [`TaskFactory::graph`].
pub const GRAPH_TASK_LABEL: &str = "test_task";
pub const TASK_GRAPH_VERSION: &str = "0.2.0";

const SOURCE: &str = "http://github.com/taskcluster/docker-worker";
const DESCRIPTION: &str = "Task created by the worker test harness";

#[derive(Debug, Clone)]
pub struct TaskFactory {
    identity: WorkerIdentity,
    deadline_offset: chrono::Duration,
    graph_task_timeout_secs: u64,
    metadata: TaskMetadata,
}

impl TaskFactory {
    /// Factory for tasks routed to `identity`, with deadlines, metadata and
    /// graph timeouts taken from `config`.
    pub fn new(identity: WorkerIdentity, config: &HarnessConfig) -> Self {
        Self {
            identity,
            deadline_offset: config.deadline_offset(),
            graph_task_timeout_secs: config.graph_task_timeout_secs,
            metadata: TaskMetadata {
                name: config.task_name.clone(),
                description: DESCRIPTION.to_string(),
                owner: config.owner.clone(),
                source: SOURCE.to_string(),
            },
        }
    }

    /// Identity every task is routed to.
    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// A task for the harness's worker, created now.
    pub fn task(&self, payload: Value) -> TaskDefinition {
        let created = Utc::now();
        TaskDefinition {
            provisioner_id: self.identity.provisioner_id.clone(),
            worker_type: self.identity.worker_type.clone(),
            routes: Vec::new(),
            retries: 0,
            created,
            deadline: created
                .checked_add_signed(self.deadline_offset)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            timeout: None,
            scopes: Vec::new(),
            payload,
            metadata: self.metadata.clone(),
            tags: BTreeMap::new(),
        }
    }

    /// A single-task graph whose task routes through the `provisionerId`
    /// and `workerType` graph parameters.
    pub fn graph(&self, payload: Value) -> TaskGraph {
        let mut task = self.task(payload);
        task.provisioner_id = "{{provisionerId}}".to_string();
        task.worker_type = "{{workerType}}".to_string();
        task.timeout = Some(self.graph_task_timeout_secs);

        TaskGraph {
            version: TASK_GRAPH_VERSION.to_string(),
            tags: BTreeMap::new(),
            routing: String::new(),
            params: BTreeMap::from([
                (
                    "provisionerId".to_string(),
                    self.identity.provisioner_id.clone(),
                ),
                ("workerType".to_string(), self.identity.worker_type.clone()),
            ]),
            metadata: self.metadata.clone(),
            tasks: vec![GraphTask {
                label: GRAPH_TASK_LABEL.to_string(),
                requires: Vec::new(),
                reruns: 0,
                task,
            }],
        }
    }
}
