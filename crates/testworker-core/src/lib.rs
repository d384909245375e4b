//! Integration-test harness for queue-driven workers.
//!
//! Launches a worker binary as a subprocess, turns its structured stdout
//! into events, submits tasks to the queue and waits for the matching
//! completion notification, then collects the run's status, live log and
//! artifacts into a [`TaskRunSnapshot`].
//!
//! The queue, scheduler, artifact store and notification channel are
//! consumed through traits; see [`Collaborators`].

pub mod aggregator;
pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod process;
pub mod queue;
pub mod slugid;
pub mod task;
pub mod worker;

pub use aggregator::{ResultAggregator, TaskRunSnapshot};
pub use config::HarnessConfig;
pub use correlator::{Completion, CompletionCorrelator, CompletionFilter};
pub use error::{HarnessError, Result};
pub use events::{Event, EventBus};
pub use process::{ExitDisposition, LocalWorker, WorkerIdentity, WorkerProcess};
pub use worker::{Collaborators, TestWorker};
