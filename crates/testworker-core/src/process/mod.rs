//! Worker subprocess management.
//!
//! A [`WorkerLauncher`] knows how to build the command for a worker with a
//! given [`WorkerIdentity`]; [`WorkerProcess`] owns the running subprocess,
//! feeds its stdout through the event decoder, and reports its exit.
//!
//! ```text
//! WorkerProcess::launch
//!     |-- spawn(command)          stderr -> inherited
//!     |-- decoder task            stdout -> EventDecoder -> EventBus
//!     |-- reaper task             wait + drain stdout -> exit watch
//!     '-- await "start" | exit | launch timeout
//! ```

pub mod supervisor;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::slugid;

pub use supervisor::WorkerProcess;

/// Event kind the worker emits once it is ready to claim tasks.
pub const START_EVENT: &str = "start";

/// Routing identity of the worker under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerIdentity {
    pub provisioner_id: String,
    pub worker_type: String,
    pub worker_id: String,
}

impl WorkerIdentity {
    /// Build an identity, generating a fresh worker type when none is given.
    /// The worker id defaults to the worker type.
    pub fn new(
        provisioner_id: impl Into<String>,
        worker_type: Option<String>,
        worker_id: Option<String>,
    ) -> Self {
        let worker_type = worker_type.unwrap_or_else(slugid::nice);
        let worker_id = worker_id.unwrap_or_else(|| worker_type.clone());
        Self {
            provisioner_id: provisioner_id.into(),
            worker_type,
            worker_id,
        }
    }
}

/// Builds the command that starts a worker.
///
/// The supervisor overrides stdio, so implementations only need to set the
/// program, arguments, environment and working directory.
pub trait WorkerLauncher: Send + Sync {
    /// Program name, used in spawn errors.
    fn program(&self) -> String;

    /// Command for a worker with `identity`.
    fn command(&self, identity: &WorkerIdentity) -> Command;
}

/// Launches a local executable, passing the identity through the
/// `PROVISIONER_ID`, `WORKER_TYPE` and `WORKER_ID` environment variables.
#[derive(Debug, Clone)]
pub struct LocalWorker {
    program: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    current_dir: Option<PathBuf>,
}

impl LocalWorker {
    /// Launch `program` with no extra arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            current_dir: None,
        }
    }

    /// Append a command-line argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an extra environment variable. The identity variables win over
    /// one with the same name.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Run the worker from `dir` instead of the current directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

impl WorkerLauncher for LocalWorker {
    fn program(&self) -> String {
        self.program.display().to_string()
    }

    fn command(&self, identity: &WorkerIdentity) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        // Merge into the inherited environment rather than replacing it.
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.env("PROVISIONER_ID", &identity.provisioner_id)
            .env("WORKER_TYPE", &identity.worker_type)
            .env("WORKER_ID", &identity.worker_id);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Timing knobs for launch and shutdown.
#[derive(Debug, Clone, Copy)]
pub struct LaunchOptions {
    /// Give up on `start` after this long. `None` waits indefinitely and
    /// leaves the deadline to the caller.
    pub launch_timeout: Option<Duration>,
    /// Time between SIGTERM and SIGKILL in [`WorkerProcess::terminate`].
    pub shutdown_grace: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            launch_timeout: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// How the worker process ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitDisposition {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed (unix only).
    pub signal: Option<i32>,
}

impl ExitDisposition {
    /// True for exit code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitDisposition {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_defaults_to_worker_type() {
        let identity = WorkerIdentity::new("prov", Some("wt".to_string()), None);
        assert_eq!(identity.worker_type, "wt");
        assert_eq!(identity.worker_id, "wt");
    }

    #[test]
    fn worker_type_is_generated_when_missing() {
        let a = WorkerIdentity::new("prov", None, None);
        let b = WorkerIdentity::new("prov", None, None);
        assert_eq!(a.worker_type.len(), 22);
        assert_ne!(a.worker_type, b.worker_type);
        assert_eq!(a.worker_id, a.worker_type);
    }

    #[test]
    fn explicit_worker_id_is_kept() {
        let identity =
            WorkerIdentity::new("prov", Some("wt".to_string()), Some("host-1".to_string()));
        assert_eq!(identity.worker_id, "host-1");
    }

    #[test]
    fn identity_serializes_camel_case() {
        let identity = WorkerIdentity::new("prov", Some("wt".to_string()), None);
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"provisionerId": "prov", "workerType": "wt", "workerId": "wt"})
        );
    }

    #[test]
    fn local_worker_command_carries_identity() {
        let identity = WorkerIdentity::new("prov", Some("wt".to_string()), Some("id".to_string()));
        let launcher = LocalWorker::new("/bin/worker")
            .arg("--verbose")
            .env("EXTRA", "1")
            .current_dir("/tmp");
        let cmd = launcher.command(&identity);
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "/bin/worker");
        assert_eq!(std_cmd.get_args().collect::<Vec<_>>(), vec!["--verbose"]);
        let envs: HashMap<_, _> = std_cmd
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_string(), v?.to_str()?.to_string())))
            .collect();
        assert_eq!(envs.get("PROVISIONER_ID").map(String::as_str), Some("prov"));
        assert_eq!(envs.get("WORKER_TYPE").map(String::as_str), Some("wt"));
        assert_eq!(envs.get("WORKER_ID").map(String::as_str), Some("id"));
        assert_eq!(envs.get("EXTRA").map(String::as_str), Some("1"));
        assert_eq!(std_cmd.get_current_dir(), Some(std::path::Path::new("/tmp")));
        assert_eq!(launcher.program(), "/bin/worker");
    }

    #[test]
    fn exit_disposition_display() {
        let ok = ExitDisposition {
            code: Some(0),
            signal: None,
        };
        assert!(ok.success());
        assert_eq!(ok.to_string(), "exit code 0");

        let killed = ExitDisposition {
            code: None,
            signal: Some(9),
        };
        assert!(!killed.success());
        assert_eq!(killed.to_string(), "killed by signal 9");
        assert_eq!(ExitDisposition::default().to_string(), "unknown exit status");
    }
}
