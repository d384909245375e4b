//! The test harness facade.
//!
//! A [`TestWorker`] owns one worker subprocess and the clients it needs to
//! push work through the queue and collect the results.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::aggregator::{ResultAggregator, TaskRunSnapshot};
use crate::config::HarnessConfig;
use crate::correlator::{CompletionCorrelator, CompletionFilter, NotificationChannel};
use crate::error::{HarnessError, Result};
use crate::events::{ConsoleSink, EventBus, StdoutSink};
use crate::process::{ExitDisposition, LaunchOptions, WorkerIdentity, WorkerLauncher, WorkerProcess};
use crate::queue::{ArtifactStore, Queue, Scheduler, TaskStatus};
use crate::slugid;
use crate::task::TaskFactory;

/// External services the harness talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub queue: Arc<dyn Queue>,
    pub scheduler: Arc<dyn Scheduler>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub channel: Arc<dyn NotificationChannel>,
}

pub struct TestWorker {
    launcher: Arc<dyn WorkerLauncher>,
    identity: WorkerIdentity,
    bus: EventBus,
    sink: Arc<dyn ConsoleSink>,
    options: LaunchOptions,
    process: Option<WorkerProcess>,
    queue: Arc<dyn Queue>,
    scheduler: Arc<dyn Scheduler>,
    correlator: CompletionCorrelator,
    aggregator: ResultAggregator,
    tasks: TaskFactory,
}

impl std::fmt::Debug for TestWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestWorker")
            .field("identity", &self.identity)
            .field("launcher", &self.launcher.program())
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

impl TestWorker {
    /// Create a harness for a worker that is not running yet.
    ///
    /// A fresh worker type is generated when `worker_type` is `None`; the
    /// worker id defaults to the worker type.
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        collaborators: Collaborators,
        config: &HarnessConfig,
        worker_type: Option<String>,
        worker_id: Option<String>,
    ) -> Self {
        let identity = WorkerIdentity::new(config.provisioner_id.clone(), worker_type, worker_id);
        let Collaborators {
            queue,
            scheduler,
            artifacts,
            channel,
        } = collaborators;

        Self {
            launcher,
            tasks: TaskFactory::new(identity.clone(), config),
            identity,
            bus: EventBus::new(),
            sink: Arc::new(StdoutSink),
            options: config.launch_options(),
            process: None,
            correlator: CompletionCorrelator::new(Arc::clone(&queue), channel),
            aggregator: ResultAggregator::new(
                Arc::clone(&queue),
                artifacts,
                config.live_log_artifact.clone(),
            ),
            queue,
            scheduler,
        }
    }

    /// Send the worker's non-event stdout somewhere other than this
    /// process's stdout.
    pub fn with_console_sink(mut self, sink: Arc<dyn ConsoleSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Routing identity passed to the worker and used for every task.
    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Events decoded from the worker's stdout. Handlers registered before
    /// [`TestWorker::launch`] see every event, `start` included.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// The launched process, if any. Cleared by [`TestWorker::terminate`].
    pub fn process(&self) -> Option<&WorkerProcess> {
        self.process.as_ref()
    }

    /// Start the worker and wait until it reports that it is ready.
    ///
    /// A previous process that has already exited is replaced.
    pub async fn launch(&mut self) -> Result<&WorkerProcess> {
        if self.process.as_ref().is_some_and(WorkerProcess::is_running) {
            return Err(HarnessError::AlreadyLaunched);
        }
        let process = WorkerProcess::launch(
            self.launcher.as_ref(),
            self.identity.clone(),
            &self.bus,
            Arc::clone(&self.sink),
            &self.options,
        )
        .await?;
        Ok(&*self.process.insert(process))
    }

    /// Stop the worker and release it.
    pub async fn terminate(&mut self) -> Result<ExitDisposition> {
        let process = self.process.take().ok_or(HarnessError::NotLaunched)?;
        let status = process.terminate().await?;
        info!(worker_type = %self.identity.worker_type, %status, "worker terminated");
        Ok(status)
    }

    /// Resolves when the current worker process exits.
    pub fn exited(&self) -> Result<impl Future<Output = ExitDisposition> + Send + use<>> {
        self.process
            .as_ref()
            .map(WorkerProcess::exited)
            .ok_or(HarnessError::NotLaunched)
    }

    /// Submit `payload` as a task under a fresh task id and return the
    /// snapshot of the run that completed it.
    pub async fn post_to_queue(&self, payload: Value) -> Result<TaskRunSnapshot> {
        self.post_to_queue_with_id(&slugid::nice(), payload).await
    }

    /// Like [`TestWorker::post_to_queue`] with a caller-chosen task id.
    pub async fn post_to_queue_with_id(
        &self,
        task_id: &str,
        payload: Value,
    ) -> Result<TaskRunSnapshot> {
        let task = self.tasks.task(payload);
        let submission = self.queue.create_task(task_id, &task);
        let (completion, _) = self
            .correlator
            .await_completion(CompletionFilter::task(task_id), submission)
            .await?;

        self.fetch_task_stats(task_id, completion.run_id).await
    }

    /// Submit `payload` inside a single-task graph and return the status
    /// carried by the completion.
    ///
    /// The graph scheduler assigns the task id, so the completion is matched
    /// on the worker identity alone. Two `post` calls running concurrently
    /// on the same harness may therefore observe each other's completion.
    pub async fn post(&self, payload: Value) -> Result<TaskStatus> {
        let graph = self.tasks.graph(payload);
        let graph_id = slugid::nice();
        let submission = self.scheduler.create_task_graph(&graph_id, &graph);
        let (completion, _) = self
            .correlator
            .await_completion(CompletionFilter::worker(self.identity.clone()), submission)
            .await?;

        info!(
            graph_id = %graph_id,
            task_id = %completion.task_id(),
            run_id = completion.run_id,
            "graph task completed"
        );
        Ok(completion.status)
    }

    /// Snapshot of run `run_id` of `task_id`.
    pub async fn fetch_task_stats(&self, task_id: &str, run_id: u32) -> Result<TaskRunSnapshot> {
        self.aggregator.snapshot(task_id, run_id).await
    }
}
