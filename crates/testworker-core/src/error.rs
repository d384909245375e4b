//! Error taxonomy for the harness.
//!
//! External collaborators (queue, scheduler, notification channel, artifact
//! store) report failures as `anyhow::Error`; the harness wraps them in the
//! variant that says which step failed. Decode failures on the worker's
//! stdout are never errors, and subscription-close failures are only logged.

use std::time::Duration;

use crate::process::ExitDisposition;

/// Errors surfaced by harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("failed to spawn worker binary '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker did not emit a start event within {timeout:?}")]
    LaunchTimeout { timeout: Duration },

    #[error("worker exited before emitting a start event ({status})")]
    ProcessExitedEarly { status: ExitDisposition },

    #[error("failed to terminate worker: {0}")]
    Terminate(String),

    #[error("worker has not been launched")]
    NotLaunched,

    #[error("worker is already running")]
    AlreadyLaunched,

    #[error("failed to connect to the notification channel")]
    ChannelConnect(#[source] anyhow::Error),

    #[error("notification channel failed while waiting for completion")]
    Channel(#[source] anyhow::Error),

    #[error("task submission failed")]
    SubmissionFailure(#[source] anyhow::Error),

    #[error("malformed completion message: {0}")]
    MalformedCompletion(String),

    #[error("queue request failed")]
    Queue(#[source] anyhow::Error),

    #[error("failed to fetch artifact {name:?}")]
    ArtifactFetch {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task {task_id} has no run {run_id}")]
    RunNotFound { task_id: String, run_id: u32 },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HarnessError>;
