//! Shared test utilities for testworker integration tests.
//!
//! Provides an in-memory queue that stands in for every external service
//! the harness talks to, `/bin/sh` stub workers, a console sink that
//! captures lines, and tracing setup for test binaries.

mod memory_queue;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use testworker_core::events::ConsoleSink;
use testworker_core::process::LocalWorker;
use testworker_core::worker::Collaborators;

pub use memory_queue::{
    CompletionMode, Fault, InMemoryQueue, MEMORY_ENDPOINT, SubscriptionRecord, topic_matches,
};

/// Install a fmt subscriber honouring `RUST_LOG` (default `info`). Safe to
/// call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Collaborators that all point at `queue`.
pub fn collaborators(queue: &InMemoryQueue) -> Collaborators {
    let queue = Arc::new(queue.clone());
    Collaborators {
        queue: queue.clone(),
        scheduler: queue.clone(),
        artifacts: queue.clone(),
        channel: queue,
    }
}

/// Write an executable `/bin/sh` script with `body` into `dir`.
pub fn write_stub_worker(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("stub-worker.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write stub worker");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to make stub worker executable");
    }
    path
}

/// A stub worker in a fresh temp dir. Keep the `TempDir` alive for as long
/// as the worker runs.
pub fn stub_worker(body: &str) -> (TempDir, LocalWorker) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = write_stub_worker(dir.path(), body);
    (dir, LocalWorker::new(path))
}

/// Stub body that announces readiness and then idles until signalled.
pub const IDLE_WORKER: &str = r#"echo '{"type":"start"}'
exec sleep 600"#;

/// Console sink that keeps every line it receives.
#[derive(Debug, Default, Clone)]
pub struct CapturedConsole {
    lines: Arc<Mutex<Vec<String>>>,
}

impl CapturedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConsoleSink for CapturedConsole {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
    }
}
