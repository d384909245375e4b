//! Correlates a submission with its completion notification.
//!
//! The subscription must be bound and connected before the submission can
//! have any observable effect, otherwise a worker that finishes quickly
//! publishes a completion nobody is listening for. The correlator takes the
//! submission as a future: futures do nothing until polled, and the
//! correlator polls it only after the subscription is connected.
//!
//! ```text
//! endpoint --> subscribe(filter) --> connect --+--> wait for match --+
//!                                              +--> submission ------+--> close --> Completion
//!                                              '--> resume ----------'
//! ```

pub mod filter;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::queue::{Queue, TaskStatus};

pub use filter::{CompletionFilter, CompletionMessage, TASK_COMPLETED_EXCHANGE, TaskCompleted};

/// Lifecycle of a subscription on the notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unbound,
    Bound,
    Connected,
    Active,
    Closed,
}

/// Publish/subscribe transport that carries queue events.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Open a subscription on `endpoint` bound to `filter`. The returned
    /// subscription is bound but not yet connected.
    async fn subscribe(
        &self,
        endpoint: &str,
        filter: &CompletionFilter,
    ) -> anyhow::Result<Arc<dyn Subscription>>;
}

/// One bound subscription.
///
/// Methods take `&self` because waiting for a message and activating
/// delivery run concurrently.
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;

    /// Start delivery, for channels that hold messages until activated.
    async fn resume(&self) -> anyhow::Result<()>;

    async fn next_message(&self) -> anyhow::Result<CompletionMessage>;

    async fn close(&self) -> anyhow::Result<()>;
}

// Compile-time assertion: both traits must be usable as trait objects.
const _: () = {
    fn _assert_object_safe(_: &dyn NotificationChannel, _: &dyn Subscription) {}
};

/// A matched completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Status embedded in the notification.
    pub status: TaskStatus,
    /// The most recent run of the task.
    pub run_id: u32,
    pub message: CompletionMessage,
}

impl Completion {
    pub fn task_id(&self) -> &str {
        &self.status.task_id
    }
}

/// Closes its subscription exactly once: explicitly through
/// [`CloseGuard::close`], or from `Drop` when the owning future is
/// cancelled.
struct CloseGuard {
    subscription: Option<Arc<dyn Subscription>>,
}

impl CloseGuard {
    fn new(subscription: Arc<dyn Subscription>) -> Self {
        Self {
            subscription: Some(subscription),
        }
    }

    async fn close(mut self) {
        if let Some(subscription) = self.subscription.take() {
            close_quietly(subscription).await;
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_quietly(subscription));
            }
            Err(_) => warn!("no runtime available, subscription left open"),
        }
    }
}

async fn close_quietly(subscription: Arc<dyn Subscription>) {
    match subscription.close().await {
        Ok(()) => debug!("subscription closed"),
        Err(e) => warn!(error = %e, "error during subscription close"),
    }
}

/// Wait for the first message that decodes and passes `filter`. A match
/// that carries no runs is malformed.
async fn wait_for_match(
    subscription: &dyn Subscription,
    filter: &CompletionFilter,
) -> Result<Completion> {
    loop {
        let message = subscription
            .next_message()
            .await
            .map_err(HarnessError::Channel)?;

        let completed = match message.decode() {
            Ok(completed) => completed,
            Err(e) => {
                debug!(
                    routing_key = %message.routing_key,
                    error = %e,
                    "skipping undecodable completion message"
                );
                continue;
            }
        };

        if !filter.matches(&completed) {
            debug!(
                task_id = %completed.status.task_id,
                routing_key = %message.routing_key,
                "skipping completion for another task"
            );
            continue;
        }

        let run_id = completed
            .status
            .latest_run()
            .map(|run| run.run_id)
            .ok_or_else(|| {
                HarnessError::MalformedCompletion(format!(
                    "task {} completed without any runs",
                    completed.status.task_id
                ))
            })?;

        return Ok(Completion {
            status: completed.status,
            run_id,
            message,
        });
    }
}

/// Waits for completion notifications on behalf of submissions.
#[derive(Clone)]
pub struct CompletionCorrelator {
    queue: Arc<dyn Queue>,
    channel: Arc<dyn NotificationChannel>,
}

impl std::fmt::Debug for CompletionCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionCorrelator").finish_non_exhaustive()
    }
}

impl CompletionCorrelator {
    /// `queue` resolves the channel endpoint; `channel` opens subscriptions.
    pub fn new(queue: Arc<dyn Queue>, channel: Arc<dyn NotificationChannel>) -> Self {
        Self { queue, channel }
    }

    /// Subscribe with `filter`, run `submission`, and return the first
    /// matching completion together with the submission's result.
    ///
    /// The message wait, the submission and the delivery activation are
    /// driven together once the subscription is connected; the call
    /// returns when the match has arrived and the submission was
    /// acknowledged. The subscription is closed on every path, and a close
    /// failure is only logged. No timeout is applied here.
    pub async fn await_completion<F, T>(
        &self,
        filter: CompletionFilter,
        submission: F,
    ) -> Result<(Completion, T)>
    where
        F: Future<Output = anyhow::Result<T>> + Send,
        T: Send,
    {
        let endpoint = self
            .queue
            .notification_endpoint()
            .await
            .map_err(HarnessError::ChannelConnect)?;

        let subscription = self
            .channel
            .subscribe(&endpoint, &filter)
            .await
            .map_err(HarnessError::ChannelConnect)?;
        debug!(binding = %filter.routing_key_pattern(), "subscription bound");

        let guard = CloseGuard::new(Arc::clone(&subscription));
        let result = correlate(subscription.as_ref(), &filter, submission).await;
        guard.close().await;

        if let Ok((completion, _)) = &result {
            info!(
                task_id = %completion.task_id(),
                run_id = completion.run_id,
                "task completed"
            );
        }
        result
    }
}

async fn correlate<F, T>(
    subscription: &dyn Subscription,
    filter: &CompletionFilter,
    submission: F,
) -> Result<(Completion, T)>
where
    F: Future<Output = anyhow::Result<T>> + Send,
{
    subscription
        .connect()
        .await
        .map_err(HarnessError::ChannelConnect)?;
    debug!("subscription connected");

    let matched = wait_for_match(subscription, filter);
    let submitted = async { submission.await.map_err(HarnessError::SubmissionFailure) };
    let resumed = async { subscription.resume().await.map_err(HarnessError::Channel) };

    let (completion, acknowledgment, ()) = tokio::try_join!(matched, submitted, resumed)?;
    Ok((completion, acknowledgment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ArtifactPage, RunInfo, TaskDefinition, TaskState};
    use anyhow::anyhow;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct EndpointQueue {
        fail: bool,
    }

    #[async_trait]
    impl Queue for EndpointQueue {
        async fn create_task(&self, _: &str, _: &TaskDefinition) -> anyhow::Result<TaskStatus> {
            unreachable!("not used by the correlator")
        }
        async fn task_status(&self, _: &str) -> anyhow::Result<TaskStatus> {
            unreachable!("not used by the correlator")
        }
        async fn list_artifacts(
            &self,
            _: &str,
            _: u32,
            _: Option<&str>,
        ) -> anyhow::Result<ArtifactPage> {
            unreachable!("not used by the correlator")
        }
        async fn notification_endpoint(&self) -> anyhow::Result<String> {
            if self.fail {
                Err(anyhow!("endpoint unavailable"))
            } else {
                Ok("amqp://localhost".to_string())
            }
        }
    }

    /// Subscription fed by a channel; records its state transitions.
    struct ScriptedSubscription {
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<anyhow::Result<CompletionMessage>>>,
        states: Mutex<Vec<SubscriptionState>>,
        closes: AtomicUsize,
        fail_close: bool,
    }

    #[async_trait]
    impl Subscription for ScriptedSubscription {
        async fn connect(&self) -> anyhow::Result<()> {
            self.states.lock().unwrap().push(SubscriptionState::Connected);
            Ok(())
        }
        async fn resume(&self) -> anyhow::Result<()> {
            self.states.lock().unwrap().push(SubscriptionState::Active);
            Ok(())
        }
        async fn next_message(&self) -> anyhow::Result<CompletionMessage> {
            match self.rx.lock().await.recv().await {
                Some(msg) => msg,
                None => Err(anyhow!("channel closed")),
            }
        }
        async fn close(&self) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.states.lock().unwrap().push(SubscriptionState::Closed);
            if self.fail_close {
                Err(anyhow!("close failed"))
            } else {
                Ok(())
            }
        }
    }

    struct ScriptedChannel {
        subscription: Arc<ScriptedSubscription>,
    }

    #[async_trait]
    impl NotificationChannel for ScriptedChannel {
        async fn subscribe(
            &self,
            _endpoint: &str,
            _filter: &CompletionFilter,
        ) -> anyhow::Result<Arc<dyn Subscription>> {
            self.subscription
                .states
                .lock()
                .unwrap()
                .push(SubscriptionState::Bound);
            Ok(self.subscription.clone())
        }
    }

    type Feed = mpsc::UnboundedSender<anyhow::Result<CompletionMessage>>;

    fn setup(fail_close: bool) -> (CompletionCorrelator, Arc<ScriptedSubscription>, Feed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Arc::new(ScriptedSubscription {
            rx: tokio::sync::Mutex::new(rx),
            states: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            fail_close,
        });
        let correlator = CompletionCorrelator::new(
            Arc::new(EndpointQueue { fail: false }),
            Arc::new(ScriptedChannel {
                subscription: subscription.clone(),
            }),
        );
        (correlator, subscription, tx)
    }

    fn message(task_id: &str, runs: u32) -> CompletionMessage {
        let runs: Vec<RunInfo> = (0..runs)
            .map(|run_id| RunInfo {
                run_id,
                state: TaskState::Completed,
                reason_created: None,
                reason_resolved: None,
                worker_group: None,
                worker_id: None,
                success: Some(true),
                scheduled: None,
                started: None,
                resolved: None,
            })
            .collect();
        let completed = TaskCompleted {
            status: TaskStatus {
                task_id: task_id.to_string(),
                provisioner_id: "prov".to_string(),
                worker_type: "wt".to_string(),
                deadline: Utc::now(),
                state: TaskState::Completed,
                retries_left: 0,
                runs,
            },
            run_id: None,
            worker_group: None,
            worker_id: None,
        };
        CompletionMessage {
            exchange: TASK_COMPLETED_EXCHANGE.to_string(),
            routing_key: format!("primary.{task_id}.0.g.w.prov.wt.#"),
            payload: serde_json::to_value(completed).unwrap(),
        }
    }

    #[tokio::test]
    async fn completion_published_during_submission_is_not_missed() {
        let (correlator, subscription, feed) = setup(false);

        // The "worker" finishes before the submission call even returns.
        let submission = async move {
            feed.send(Ok(message("T1", 1))).unwrap();
            Ok("ack")
        };
        let (completion, ack) = correlator
            .await_completion(CompletionFilter::task("T1"), submission)
            .await
            .unwrap();

        assert_eq!(ack, "ack");
        assert_eq!(completion.task_id(), "T1");
        assert_eq!(completion.run_id, 0);
        assert_eq!(subscription.closes.load(Ordering::SeqCst), 1);
        let states = subscription.states.lock().unwrap().clone();
        assert_eq!(states.first(), Some(&SubscriptionState::Bound));
        assert_eq!(states.get(1), Some(&SubscriptionState::Connected));
        assert_eq!(states.last(), Some(&SubscriptionState::Closed));
    }

    #[tokio::test]
    async fn submission_runs_only_after_connect() {
        let (correlator, subscription, feed) = setup(false);
        let observed = subscription.clone();

        let submission = async move {
            let states = observed.states.lock().unwrap().clone();
            assert!(
                states.contains(&SubscriptionState::Connected),
                "submission ran before connect: {states:?}"
            );
            feed.send(Ok(message("T1", 1))).unwrap();
            Ok(())
        };
        correlator
            .await_completion(CompletionFilter::task("T1"), submission)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn latest_run_id_is_reported() {
        let (correlator, _subscription, feed) = setup(false);
        feed.send(Ok(message("T1", 3))).unwrap();
        let (completion, ()) = correlator
            .await_completion(CompletionFilter::task("T1"), async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(completion.run_id, 2);
    }

    #[tokio::test]
    async fn non_matching_messages_are_skipped() {
        let (correlator, _subscription, feed) = setup(false);
        feed.send(Ok(message("other", 1))).unwrap();
        feed.send(Ok(message("T1", 1))).unwrap();
        let (completion, ()) = correlator
            .await_completion(CompletionFilter::task("T1"), async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(completion.task_id(), "T1");
    }

    #[tokio::test]
    async fn undecodable_messages_are_skipped() {
        let (correlator, subscription, feed) = setup(false);
        feed.send(Ok(CompletionMessage {
            exchange: TASK_COMPLETED_EXCHANGE.to_string(),
            routing_key: "primary.garbage".to_string(),
            payload: serde_json::json!({ "status": "not a status" }),
        }))
        .unwrap();
        feed.send(Ok(message("T1", 1))).unwrap();
        let (completion, ()) = correlator
            .await_completion(CompletionFilter::task("T1"), async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(completion.task_id(), "T1");
        assert_eq!(subscription.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submission_failure_closes_subscription() {
        let (correlator, subscription, _feed) = setup(false);
        let err = correlator
            .await_completion::<_, ()>(CompletionFilter::task("T1"), async {
                Err(anyhow!("queue rejected task"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::SubmissionFailure(_)), "got {err:?}");
        assert_eq!(subscription.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_error_closes_subscription_once() {
        let (correlator, subscription, feed) = setup(false);
        feed.send(Err(anyhow!("connection reset"))).unwrap();
        let err = correlator
            .await_completion(CompletionFilter::task("T1"), async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Channel(_)), "got {err:?}");
        assert_eq!(subscription.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_failure_does_not_mask_success() {
        let (correlator, subscription, feed) = setup(true);
        feed.send(Ok(message("T1", 1))).unwrap();
        let result = correlator
            .await_completion(CompletionFilter::task("T1"), async { Ok(()) })
            .await;
        assert!(result.is_ok());
        assert_eq!(subscription.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn completion_without_runs_is_malformed() {
        let (correlator, subscription, feed) = setup(false);
        feed.send(Ok(message("T1", 0))).unwrap();
        let err = correlator
            .await_completion(CompletionFilter::task("T1"), async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::MalformedCompletion(_)), "got {err:?}");
        assert_eq!(subscription.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn endpoint_failure_opens_nothing() {
        let (_, subscription, _feed) = setup(false);
        let correlator = CompletionCorrelator::new(
            Arc::new(EndpointQueue { fail: true }),
            Arc::new(ScriptedChannel {
                subscription: subscription.clone(),
            }),
        );
        let err = correlator
            .await_completion(CompletionFilter::task("T1"), async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::ChannelConnect(_)), "got {err:?}");
        assert!(subscription.states.lock().unwrap().is_empty());
        assert_eq!(subscription.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_wait_still_closes_subscription() {
        let (correlator, subscription, _feed) = setup(false);
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            correlator.await_completion(CompletionFilter::task("T1"), async { Ok(()) }),
        )
        .await;
        assert!(result.is_err(), "nothing was published, the wait must time out");

        // The close runs on a spawned task; give it a chance to run.
        for _ in 0..50 {
            if subscription.closes.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(subscription.closes.load(Ordering::SeqCst), 1);
    }
}
