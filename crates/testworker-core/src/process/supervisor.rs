//! Launch, observe, and terminate a worker subprocess.

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ExitDisposition, LaunchOptions, START_EVENT, WorkerIdentity, WorkerLauncher};
use crate::error::{HarnessError, Result};
use crate::events::{ConsoleSink, DecodeStats, EventBus, EventDecoder};

type ExitWatch = watch::Receiver<Option<ExitDisposition>>;

/// A running worker subprocess.
///
/// The child itself is owned by a background reaper task; this handle
/// talks to it through an exit watch channel and a kill token. Dropping a
/// handle whose process is still running kills the process.
pub struct WorkerProcess {
    identity: WorkerIdentity,
    pid: Option<u32>,
    exit_rx: ExitWatch,
    force_kill: CancellationToken,
    shutdown_grace: Duration,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("identity", &self.identity)
            .field("pid", &self.pid)
            .field("exit", &*self.exit_rx.borrow())
            .finish()
    }
}

/// How long the reaper keeps draining stdout after the worker exits. A
/// descendant that inherited the pipe can hold it open indefinitely.
const STDOUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Wait until the reaper publishes an exit status. `None` means the reaper
/// went away without publishing one.
async fn wait_for_exit(mut rx: ExitWatch) -> Option<ExitDisposition> {
    match rx.wait_for(Option::is_some).await {
        Ok(status) => *status,
        Err(_) => None,
    }
}

/// Send `signal` to the worker's process group. Returns false if the
/// signal could not be delivered.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    // SAFETY: the worker leads its own process group (see `launch`), so
    // the negated pid addresses only the worker and its descendants.
    unsafe { libc::kill(-(pid as libc::pid_t), signal) == 0 }
}

/// Own the child until it exits, then publish its status.
///
/// Stdout is drained before the status is published, so every event the
/// worker printed is on the bus before anyone observes the exit. The drain
/// is bounded by [`STDOUT_DRAIN_GRACE`]; after that the worker's leftover
/// descendants are killed and the rest of their output is dropped.
async fn reap(
    mut child: Child,
    mut decoder: JoinHandle<DecodeStats>,
    exit_tx: watch::Sender<Option<ExitDisposition>>,
    force_kill: CancellationToken,
    pid: Option<u32>,
) {
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        () = force_kill.cancelled() => None,
    };
    let status = match waited {
        Some(status) => status,
        None => {
            debug!(?pid, "killing worker");
            #[cfg(unix)]
            if let Some(pid) = pid {
                signal_group(pid, libc::SIGKILL);
            }
            if let Err(e) = child.start_kill() {
                warn!(?pid, error = %e, "failed to kill worker");
            }
            child.wait().await
        }
    };

    let disposition = match status {
        Ok(status) => ExitDisposition::from(status),
        Err(e) => {
            warn!(?pid, error = %e, "error waiting for worker process");
            ExitDisposition::default()
        }
    };

    match tokio::time::timeout(STDOUT_DRAIN_GRACE, &mut decoder).await {
        Ok(Ok(_stats)) => {}
        Ok(Err(e)) => warn!(?pid, error = %e, "worker stdout decoder task failed"),
        Err(_elapsed) => {
            debug!(?pid, "worker stdout still open after exit, killing descendants");
            #[cfg(unix)]
            if let Some(pid) = pid {
                signal_group(pid, libc::SIGKILL);
            }
            decoder.abort();
        }
    }

    info!(?pid, status = %disposition, "worker exited");
    exit_tx.send_replace(Some(disposition));
}

impl WorkerProcess {
    /// Spawn the worker and wait for its `start` event.
    ///
    /// Fails with [`HarnessError::ProcessExitedEarly`] if the process exits
    /// before `start`, and with [`HarnessError::LaunchTimeout`] (after
    /// killing the process) if `options.launch_timeout` elapses first. A
    /// `start` event that was printed right before exiting still counts.
    pub async fn launch(
        launcher: &dyn WorkerLauncher,
        identity: WorkerIdentity,
        bus: &EventBus,
        sink: Arc<dyn ConsoleSink>,
        options: &LaunchOptions,
    ) -> Result<Self> {
        // Register before spawning so a fast worker cannot beat us to it.
        let started = bus.wait_for(START_EVENT);

        let mut cmd = launcher.command(&identity);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| HarnessError::Spawn {
            program: launcher.program(),
            source,
        })?;
        let pid = child.id();
        info!(
            ?pid,
            worker_type = %identity.worker_type,
            worker_id = %identity.worker_id,
            "spawned worker"
        );

        let stdout = child.stdout.take();
        let decoder = EventDecoder::new(bus.clone(), sink);
        let decode_task = tokio::spawn(async move {
            match stdout {
                Some(stdout) => decoder.run(stdout).await,
                None => DecodeStats::default(),
            }
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let force_kill = CancellationToken::new();
        tokio::spawn(reap(child, decode_task, exit_tx, force_kill.clone(), pid));

        let process = Self {
            identity,
            pid,
            exit_rx,
            force_kill,
            shutdown_grace: options.shutdown_grace,
        };

        let exit = wait_for_exit(process.exit_rx.clone());
        let ready = async {
            tokio::select! {
                biased;
                Some(_) = started => Ok(()),
                status = exit => Err(HarnessError::ProcessExitedEarly {
                    status: status.unwrap_or_default(),
                }),
            }
        };

        let outcome = match options.launch_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, ready).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => {
                    warn!(?pid, ?timeout, "worker did not start in time, killing it");
                    process.force_kill.cancel();
                    wait_for_exit(process.exit_rx.clone()).await;
                    Err(HarnessError::LaunchTimeout { timeout })
                }
            },
            None => ready.await,
        };

        outcome?;
        info!(?pid, "worker started");
        Ok(process)
    }

    /// Identity the worker was launched with.
    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// OS process id, which is also the worker's process group id.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, if the process has already exited.
    pub fn exit_status(&self) -> Option<ExitDisposition> {
        *self.exit_rx.borrow()
    }

    /// True until the reaper has published an exit status.
    pub fn is_running(&self) -> bool {
        self.exit_status().is_none()
    }

    /// Resolves once the process has exited, however the exit came about.
    ///
    /// Any number of observers may wait; an observer created after the exit
    /// resolves immediately with the same status.
    pub fn exited(&self) -> impl Future<Output = ExitDisposition> + Send + use<> {
        let rx = self.exit_rx.clone();
        async move { wait_for_exit(rx).await.unwrap_or_default() }
    }

    /// Ask the worker to shut down and wait for it to exit.
    ///
    /// Sends SIGTERM to the worker's process group, waits up to the shutdown
    /// grace period, then kills the group. Calling this after the process exited returns the recorded
    /// status.
    pub async fn terminate(&self) -> Result<ExitDisposition> {
        if let Some(status) = self.exit_status() {
            return Ok(status);
        }

        self.signal_terminate();

        let graceful = tokio::time::timeout(
            self.shutdown_grace,
            wait_for_exit(self.exit_rx.clone()),
        )
        .await;

        let status = match graceful {
            Ok(status) => status,
            Err(_elapsed) => {
                debug!(pid = ?self.pid, "worker ignored SIGTERM, killing it");
                self.force_kill.cancel();
                wait_for_exit(self.exit_rx.clone()).await
            }
        };

        status.ok_or_else(|| {
            HarnessError::Terminate("worker reaper stopped without reporting an exit status".into())
        })
    }

    #[cfg(unix)]
    fn signal_terminate(&self) {
        let Some(pid) = self.pid else {
            self.force_kill.cancel();
            return;
        };
        if !signal_group(pid, libc::SIGTERM) {
            warn!(pid, "SIGTERM failed, killing worker");
            self.force_kill.cancel();
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) {
        self.force_kill.cancel();
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.is_running() {
            self.force_kill.cancel();
        }
    }
}
