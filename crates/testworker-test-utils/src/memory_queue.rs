//! In-process stand-in for the queue, scheduler, artifact store and
//! notification broker.
//!
//! Submitted tasks can be completed automatically by running the payload's
//! `cmd` through `sh -c`; its combined output becomes the live log. A
//! completion is published on every bound subscription whose routing-key
//! pattern matches, the way a topic exchange would route it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use testworker_core::config::DEFAULT_LIVE_LOG_ARTIFACT;
use testworker_core::correlator::{
    CompletionFilter, CompletionMessage, NotificationChannel, Subscription, SubscriptionState,
    TASK_COMPLETED_EXCHANGE, TaskCompleted,
};
use testworker_core::queue::{
    Artifact, ArtifactPage, ArtifactStore, Queue, RunInfo, Scheduler, TaskDefinition, TaskGraph,
    TaskGraphStatus, TaskState, TaskStatus,
};
use testworker_core::slugid;

pub const MEMORY_ENDPOINT: &str = "memory://in-memory-queue";
const WORKER_GROUP: &str = "in-memory";

/// When submitted tasks get completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Only through [`InMemoryQueue::complete_task`].
    Manual,
    /// In a background task after the submission returned.
    Background,
    /// Before the submission call returns, so the completion is published
    /// while the submitter is still waiting for its acknowledgment.
    BeforeAck,
}

/// Failures that can be switched on for any operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Submission,
    Endpoint,
    Connect,
    NextMessage,
    Close,
    Status,
    ArtifactFetch,
}

/// What happened to one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub id: u64,
    pub endpoint: String,
    pub binding: String,
    pub states: Vec<SubscriptionState>,
    pub closes: usize,
}

impl SubscriptionRecord {
    pub fn state(&self) -> SubscriptionState {
        self.states
            .last()
            .copied()
            .unwrap_or(SubscriptionState::Unbound)
    }
}

struct TaskRecord {
    definition: TaskDefinition,
    status: TaskStatus,
    log: Vec<u8>,
    artifacts: Vec<Artifact>,
}

struct Binding {
    id: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<CompletionMessage>,
}

struct State {
    mode: CompletionMode,
    worker_id: Option<String>,
    live_log_name: String,
    page_size: usize,
    faults: HashSet<Fault>,
    tasks: HashMap<String, TaskRecord>,
    graphs: Vec<String>,
    bindings: Vec<Binding>,
    subscriptions: Vec<SubscriptionRecord>,
    next_subscription: u64,
}

struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, fault: Fault) -> anyhow::Result<()> {
        if self.lock().faults.contains(&fault) {
            bail!("injected {fault:?} failure");
        }
        Ok(())
    }

    fn record(&self, id: u64, state: SubscriptionState) {
        if let Some(record) = self.lock().subscriptions.iter_mut().find(|r| r.id == id) {
            record.states.push(state);
        }
    }
}

/// Shared handle; clones talk to the same queue.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("InMemoryQueue")
            .field("mode", &state.mode)
            .field("tasks", &state.tasks.len())
            .field("bindings", &state.bindings.len())
            .finish()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    mode: CompletionMode::Background,
                    worker_id: None,
                    live_log_name: DEFAULT_LIVE_LOG_ARTIFACT.to_string(),
                    page_size: 1000,
                    faults: HashSet::new(),
                    tasks: HashMap::new(),
                    graphs: Vec::new(),
                    bindings: Vec::new(),
                    subscriptions: Vec::new(),
                    next_subscription: 1,
                }),
            }),
        }
    }

    pub fn with_mode(self, mode: CompletionMode) -> Self {
        self.inner.lock().mode = mode;
        self
    }

    /// Worker id recorded on completed runs. Defaults to the task's worker
    /// type, matching the harness's default identity.
    pub fn with_worker_id(self, worker_id: impl Into<String>) -> Self {
        self.inner.lock().worker_id = Some(worker_id.into());
        self
    }

    pub fn with_live_log_name(self, name: impl Into<String>) -> Self {
        self.inner.lock().live_log_name = name.into();
        self
    }

    /// Artifacts per listing page.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.inner.lock().page_size = page_size.max(1);
        self
    }

    pub fn inject(&self, fault: Fault) {
        self.inner.lock().faults.insert(fault);
    }

    pub fn clear(&self, fault: Fault) {
        self.inner.lock().faults.remove(&fault);
    }

    /// Ids of all tasks created so far, graph tasks included.
    pub fn task_ids(&self) -> Vec<String> {
        self.inner.lock().tasks.keys().cloned().collect()
    }

    pub fn task(&self, task_id: &str) -> Option<TaskDefinition> {
        self.inner
            .lock()
            .tasks
            .get(task_id)
            .map(|record| record.definition.clone())
    }

    pub fn graph_ids(&self) -> Vec<String> {
        self.inner.lock().graphs.clone()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.inner.lock().subscriptions.clone()
    }

    /// Number of bindings currently receiving messages.
    pub fn open_bindings(&self) -> usize {
        self.inner.lock().bindings.len()
    }

    /// Resolve the latest run of `task_id` and publish its completion.
    pub fn complete_task(
        &self,
        task_id: &str,
        success: bool,
        log: &str,
        artifacts: &[&str],
    ) -> anyhow::Result<()> {
        self.finish(
            task_id,
            success,
            log.as_bytes().to_vec(),
            artifacts.iter().map(|name| artifact(name)).collect(),
        )
    }

    /// Deliver `message` to every binding whose pattern matches its routing
    /// key. Returns the number of bindings reached.
    pub fn publish(&self, message: &CompletionMessage) -> usize {
        let state = self.inner.lock();
        state
            .bindings
            .iter()
            .filter(|binding| topic_matches(&binding.pattern, &message.routing_key))
            .filter(|binding| binding.tx.send(message.clone()).is_ok())
            .inspect(|binding| debug!(subscription = binding.id, key = %message.routing_key, "delivered"))
            .count()
    }

    fn finish(
        &self,
        task_id: &str,
        success: bool,
        log: Vec<u8>,
        artifacts: Vec<Artifact>,
    ) -> anyhow::Result<()> {
        let message = {
            let mut state = self.inner.lock();
            let worker_id = state.worker_id.clone();
            let record = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| anyhow!("unknown task {task_id}"))?;

            let worker_id = worker_id.unwrap_or_else(|| record.status.worker_type.clone());
            let resolved = if success {
                TaskState::Completed
            } else {
                TaskState::Failed
            };
            let now = Utc::now();
            let run = record
                .status
                .runs
                .last_mut()
                .ok_or_else(|| anyhow!("task {task_id} has no run"))?;
            run.state = resolved;
            run.success = Some(success);
            let reason = if success { "completed" } else { "failed" };
            run.reason_resolved = Some(reason.to_string());
            run.worker_group = Some(WORKER_GROUP.to_string());
            run.worker_id = Some(worker_id.clone());
            run.started.get_or_insert(now);
            run.resolved = Some(now);
            let run_id = run.run_id;

            record.status.state = resolved;
            record.log = log;
            record.artifacts = artifacts;

            completion_message(&record.status, run_id, &worker_id)?
        };
        self.publish(&message);
        Ok(())
    }

    async fn run_payload(&self, task_id: String) {
        let payload = self.task(&task_id).map(|task| task.payload);
        let (success, log, artifacts) = execute(payload.as_ref()).await;
        if let Err(e) = self.finish(&task_id, success, log, artifacts) {
            debug!(task_id = %task_id, error = %e, "could not complete task");
        }
    }

    async fn submit(&self, task_id: &str, task: &TaskDefinition) -> anyhow::Result<TaskStatus> {
        self.inner.check(Fault::Submission)?;
        let (status, mode) = {
            let mut state = self.inner.lock();
            if state.tasks.contains_key(task_id) {
                bail!("task {task_id} already exists");
            }
            let status = TaskStatus {
                task_id: task_id.to_string(),
                provisioner_id: task.provisioner_id.clone(),
                worker_type: task.worker_type.clone(),
                deadline: task.deadline,
                state: TaskState::Pending,
                retries_left: task.retries,
                runs: vec![RunInfo {
                    run_id: 0,
                    state: TaskState::Pending,
                    reason_created: Some("scheduled".to_string()),
                    reason_resolved: None,
                    worker_group: None,
                    worker_id: None,
                    success: None,
                    scheduled: Some(Utc::now()),
                    started: None,
                    resolved: None,
                }],
            };
            state.tasks.insert(
                task_id.to_string(),
                TaskRecord {
                    definition: task.clone(),
                    status: status.clone(),
                    log: Vec::new(),
                    artifacts: Vec::new(),
                },
            );
            (status, state.mode)
        };
        debug!(task_id, ?mode, "task created");

        match mode {
            CompletionMode::Manual => {}
            CompletionMode::Background => {
                let queue = self.clone();
                let task_id = task_id.to_string();
                tokio::spawn(async move { queue.run_payload(task_id).await });
            }
            CompletionMode::BeforeAck => self.run_payload(task_id.to_string()).await,
        }
        Ok(status)
    }
}

fn artifact(name: &str) -> Artifact {
    Artifact {
        name: name.to_string(),
        storage_type: "s3".to_string(),
        content_type: Some("text/plain".to_string()),
        expires: None,
    }
}

/// Run the payload's `cmd`, if any. The payload's `artifacts` (a list of
/// names) are registered for the run.
async fn execute(payload: Option<&Value>) -> (bool, Vec<u8>, Vec<Artifact>) {
    let artifacts = payload
        .and_then(|p| p.get("artifacts"))
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).map(artifact).collect())
        .unwrap_or_default();

    let Some(cmd) = payload.and_then(|p| p.get("cmd")).and_then(Value::as_str) else {
        return (true, Vec::new(), artifacts);
    };

    match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
    {
        Ok(output) => {
            let mut log = output.stdout;
            log.extend_from_slice(&output.stderr);
            (output.status.success(), log, artifacts)
        }
        Err(e) => (false, format!("failed to run {cmd:?}: {e}\n").into_bytes(), artifacts),
    }
}

fn completion_message(
    status: &TaskStatus,
    run_id: u32,
    worker_id: &str,
) -> anyhow::Result<CompletionMessage> {
    let routing_key = format!(
        "primary.{}.{run_id}.{WORKER_GROUP}.{worker_id}.{}.{}.in-memory.{}._",
        status.task_id, status.provisioner_id, status.worker_type, status.task_id
    );
    let payload = serde_json::to_value(TaskCompleted {
        status: status.clone(),
        run_id: Some(run_id),
        worker_group: Some(WORKER_GROUP.to_string()),
        worker_id: Some(worker_id.to_string()),
    })
    .context("failed to encode completion")?;
    Ok(CompletionMessage {
        exchange: TASK_COMPLETED_EXCHANGE.to_string(),
        routing_key,
        payload,
    })
}

/// Topic-exchange matching: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| go(rest, &key[skip..])),
            Some((word, rest)) => match key.split_first() {
                Some((first, key_rest)) => (*word == "*" || word == first) && go(rest, key_rest),
                None => false,
            },
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    go(&pattern, &key)
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn create_task(&self, task_id: &str, task: &TaskDefinition) -> anyhow::Result<TaskStatus> {
        self.submit(task_id, task).await
    }

    async fn task_status(&self, task_id: &str) -> anyhow::Result<TaskStatus> {
        self.inner.check(Fault::Status)?;
        self.inner
            .lock()
            .tasks
            .get(task_id)
            .map(|record| record.status.clone())
            .ok_or_else(|| anyhow!("task {task_id} not found"))
    }

    async fn list_artifacts(
        &self,
        task_id: &str,
        _run_id: u32,
        continuation: Option<&str>,
    ) -> anyhow::Result<ArtifactPage> {
        let start = continuation
            .map(|token| token.parse::<usize>().context("bad continuation token"))
            .transpose()?
            .unwrap_or(0);
        let state = self.inner.lock();
        let record = state
            .tasks
            .get(task_id)
            .ok_or_else(|| anyhow!("task {task_id} not found"))?;
        let end = (start + state.page_size).min(record.artifacts.len());
        Ok(ArtifactPage {
            artifacts: record.artifacts.get(start..end).unwrap_or_default().to_vec(),
            continuation_token: (end < record.artifacts.len()).then(|| end.to_string()),
        })
    }

    async fn notification_endpoint(&self) -> anyhow::Result<String> {
        self.inner.check(Fault::Endpoint)?;
        Ok(MEMORY_ENDPOINT.to_string())
    }
}

#[async_trait]
impl Scheduler for InMemoryQueue {
    async fn create_task_graph(
        &self,
        graph_id: &str,
        graph: &TaskGraph,
    ) -> anyhow::Result<TaskGraphStatus> {
        self.inner.check(Fault::Submission)?;
        self.inner.lock().graphs.push(graph_id.to_string());
        for index in 0..graph.tasks.len() {
            let task = graph
                .resolved_task(index)
                .ok_or_else(|| anyhow!("graph task {index} disappeared"))?;
            self.submit(&slugid::nice(), &task).await?;
        }
        Ok(TaskGraphStatus {
            task_graph_id: graph_id.to_string(),
            state: "running".to_string(),
        })
    }
}

#[async_trait]
impl ArtifactStore for InMemoryQueue {
    async fn fetch_artifact(&self, task_id: &str, _run_id: u32, name: &str) -> anyhow::Result<Vec<u8>> {
        self.inner.check(Fault::ArtifactFetch)?;
        let state = self.inner.lock();
        let record = state
            .tasks
            .get(task_id)
            .ok_or_else(|| anyhow!("task {task_id} not found"))?;
        if name == state.live_log_name {
            return Ok(record.log.clone());
        }
        record
            .artifacts
            .iter()
            .find(|a| a.name == name)
            .map(|a| format!("artifact {}", a.name).into_bytes())
            .ok_or_else(|| anyhow!("artifact {name} not found"))
    }
}

#[async_trait]
impl NotificationChannel for InMemoryQueue {
    async fn subscribe(
        &self,
        endpoint: &str,
        filter: &CompletionFilter,
    ) -> anyhow::Result<Arc<dyn Subscription>> {
        if endpoint != MEMORY_ENDPOINT {
            bail!("unknown endpoint {endpoint}");
        }
        let pattern = filter.routing_key_pattern();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.inner.lock();
            let id = state.next_subscription;
            state.next_subscription += 1;
            state.bindings.push(Binding {
                id,
                pattern: pattern.clone(),
                tx,
            });
            state.subscriptions.push(SubscriptionRecord {
                id,
                endpoint: endpoint.to_string(),
                binding: pattern,
                states: vec![SubscriptionState::Bound],
                closes: 0,
            });
            id
        };
        Ok(Arc::new(MemorySubscription {
            id,
            inner: Arc::clone(&self.inner),
            rx: tokio::sync::Mutex::new(rx),
        }))
    }
}

struct MemorySubscription {
    id: u64,
    inner: Arc<Inner>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CompletionMessage>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn connect(&self) -> anyhow::Result<()> {
        self.inner.check(Fault::Connect)?;
        self.inner.record(self.id, SubscriptionState::Connected);
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.inner.record(self.id, SubscriptionState::Active);
        Ok(())
    }

    async fn next_message(&self) -> anyhow::Result<CompletionMessage> {
        self.inner.check(Fault::NextMessage)?;
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow!("subscription {} closed", self.id))
    }

    async fn close(&self) -> anyhow::Result<()> {
        {
            let mut state = self.inner.lock();
            state.bindings.retain(|binding| binding.id != self.id);
            if let Some(record) = state.subscriptions.iter_mut().find(|r| r.id == self.id) {
                record.closes += 1;
                record.states.push(SubscriptionState::Closed);
            }
        }
        self.inner.check(Fault::Close)
    }
}
