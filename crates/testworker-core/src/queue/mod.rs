//! Interfaces of the external queue, scheduler and artifact store.
//!
//! The harness never implements these services; it consumes them through
//! the traits below. Tests substitute in-memory fakes, real deployments
//! plug in API clients. Every trait is object safe so implementations can
//! be shared as `Arc<dyn Trait>`.

pub mod types;

use anyhow::Result;
use async_trait::async_trait;

pub use types::{
    Artifact, ArtifactPage, GraphTask, RunInfo, TaskDefinition, TaskGraph, TaskGraphStatus,
    TaskMetadata, TaskState, TaskStatus,
};

/// The task queue.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Create `task` under the caller-chosen `task_id`.
    async fn create_task(&self, task_id: &str, task: &TaskDefinition) -> Result<TaskStatus>;

    /// Current status of a task.
    async fn task_status(&self, task_id: &str) -> Result<TaskStatus>;

    /// One page of the artifacts uploaded by a run. Pass the previous page's
    /// continuation token to fetch the next one.
    async fn list_artifacts(
        &self,
        task_id: &str,
        run_id: u32,
        continuation: Option<&str>,
    ) -> Result<ArtifactPage>;

    /// Connection string for the channel that publishes task events.
    async fn notification_endpoint(&self) -> Result<String>;
}

/// The task-graph scheduler.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn create_task_graph(&self, graph_id: &str, graph: &TaskGraph)
    -> Result<TaskGraphStatus>;
}

/// Retrieval of artifact content.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn fetch_artifact(&self, task_id: &str, run_id: u32, name: &str) -> Result<Vec<u8>>;
}

// Compile-time assertion: the collaborator traits must stay object safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Queue, _: &dyn Scheduler, _: &dyn ArtifactStore) {}
};
