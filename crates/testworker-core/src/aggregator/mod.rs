//! Assembles the result snapshot of one task run.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::queue::{Artifact, ArtifactStore, Queue, RunInfo, TaskStatus};

/// Everything a test wants to know about a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunSnapshot {
    pub task_id: String,
    pub run_id: u32,
    pub status: TaskStatus,
    /// The run record at index `run_id`.
    pub run: RunInfo,
    /// Content of the live log artifact.
    pub log: String,
    /// Artifacts by name. On duplicate names the later listing entry wins.
    pub artifacts: HashMap<String, Artifact>,
}

/// Fetches status, live log and artifact listing for a run.
#[derive(Clone)]
pub struct ResultAggregator {
    queue: Arc<dyn Queue>,
    artifacts: Arc<dyn ArtifactStore>,
    live_log_name: String,
}

impl std::fmt::Debug for ResultAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultAggregator")
            .field("live_log_name", &self.live_log_name)
            .finish_non_exhaustive()
    }
}

impl ResultAggregator {
    /// Aggregator reading the log from the artifact named `live_log_name`.
    pub fn new(
        queue: Arc<dyn Queue>,
        artifacts: Arc<dyn ArtifactStore>,
        live_log_name: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            artifacts,
            live_log_name: live_log_name.into(),
        }
    }

    pub fn live_log_name(&self) -> &str {
        &self.live_log_name
    }

    /// Build the snapshot of run `run_id` of `task_id`.
    ///
    /// The three fetches run concurrently; any failure fails the whole
    /// snapshot.
    pub async fn snapshot(&self, task_id: &str, run_id: u32) -> Result<TaskRunSnapshot> {
        let status = async {
            self.queue
                .task_status(task_id)
                .await
                .map_err(HarnessError::Queue)
        };
        let (status, log, listing) = tokio::try_join!(
            status,
            self.fetch_log(task_id, run_id),
            self.list_all(task_id, run_id)
        )?;

        let run = status
            .run(run_id)
            .cloned()
            .ok_or_else(|| HarnessError::RunNotFound {
                task_id: task_id.to_string(),
                run_id,
            })?;

        let artifacts: HashMap<String, Artifact> = listing
            .into_iter()
            .map(|artifact| (artifact.name.clone(), artifact))
            .collect();

        debug!(
            task_id,
            run_id,
            artifacts = artifacts.len(),
            log_bytes = log.len(),
            "snapshot assembled"
        );

        Ok(TaskRunSnapshot {
            task_id: task_id.to_string(),
            run_id,
            status,
            run,
            log,
            artifacts,
        })
    }

    async fn fetch_log(&self, task_id: &str, run_id: u32) -> Result<String> {
        let bytes = self
            .artifacts
            .fetch_artifact(task_id, run_id, &self.live_log_name)
            .await
            .map_err(|source| HarnessError::ArtifactFetch {
                name: self.live_log_name.clone(),
                source,
            })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Every artifact of the run, following continuation tokens.
    async fn list_all(&self, task_id: &str, run_id: u32) -> Result<Vec<Artifact>> {
        let mut all = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .queue
                .list_artifacts(task_id, run_id, continuation.as_deref())
                .await
                .map_err(|source| HarnessError::ArtifactFetch {
                    name: "artifact listing".to_string(),
                    source,
                })?;
            all.extend(page.artifacts);
            match page.continuation_token {
                Some(token) => continuation = Some(token),
                None => return Ok(all),
            }
        }
    }
}
