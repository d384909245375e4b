//! Harness configuration.
//!
//! Values come from a TOML file at `$TESTWORKER_CONFIG`, or
//! `$XDG_CONFIG_HOME/testworker/config.toml`, or
//! `~/.config/testworker/config.toml`. Resolution chain:
//! explicit value > env var > config file > default. Explicit values are
//! assigned on the resolved [`HarnessConfig`], whose fields are public.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};
use crate::process::LaunchOptions;

/// Provisioner id under which test workers claim work. Nothing real
/// provisions it, so no production worker will pick up test tasks.
pub const TEST_PROVISIONER_ID: &str = "no-provisioning-nope";

pub const DEFAULT_DEADLINE_MINUTES: u64 = 10;
pub const DEFAULT_GRAPH_TASK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_OWNER: &str = "unknown@localhost.local";
pub const DEFAULT_TASK_NAME: &str = "Task from docker-worker test suite";
pub const DEFAULT_LIVE_LOG_ARTIFACT: &str = "public/logs/terminal_live.log";
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

const ENV_CONFIG: &str = "TESTWORKER_CONFIG";
const ENV_PROVISIONER_ID: &str = "TESTWORKER_PROVISIONER_ID";
const ENV_DEADLINE_MINUTES: &str = "TESTWORKER_DEADLINE_MINUTES";
const ENV_OWNER: &str = "TESTWORKER_OWNER";
const ENV_LAUNCH_TIMEOUT_SECS: &str = "TESTWORKER_LAUNCH_TIMEOUT_SECS";
const ENV_CLIENT_ID: &str = "TASKCLUSTER_CLIENT_ID";
const ENV_ACCESS_TOKEN: &str = "TASKCLUSTER_ACCESS_TOKEN";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

/// On-disk layout. Every key is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub provisioner_id: Option<String>,
    pub deadline_minutes: Option<u64>,
    pub graph_task_timeout_secs: Option<u64>,
    pub owner: Option<String>,
    pub task_name: Option<String>,
    pub live_log_artifact: Option<String>,
    pub launch_timeout_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    pub credentials: Option<CredentialsSection>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsSection {
    pub client_id: Option<String>,
    pub access_token: Option<String>,
}

/// Queue credentials. Opaque to the harness; handed to collaborators.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub access_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Config file location for the given environment.
///
/// Uses XDG layout rather than `dirs::config_dir()`, which points into
/// `~/Library/Application Support` on macOS.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(explicit) = env(ENV_CONFIG) {
        return PathBuf::from(explicit);
    }
    let base = match env("XDG_CONFIG_HOME") {
        Some(xdg) => PathBuf::from(xdg),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config"),
    };
    base.join("testworker").join("config.toml")
}

/// Config file location for the process environment.
pub fn config_path() -> PathBuf {
    config_path_with(process_env)
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_file(&contents)
            .map_err(|e| HarnessError::Config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(HarnessError::Config(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

fn parse_file(contents: &str) -> std::result::Result<ConfigFile, toml::de::Error> {
    toml::from_str(contents)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub provisioner_id: String,
    /// Task deadline, as an offset from creation.
    pub deadline_minutes: u64,
    /// Maximum run time of tasks created inside task graphs.
    pub graph_task_timeout_secs: u64,
    pub owner: String,
    pub task_name: String,
    /// Name of the artifact holding the run's live log.
    pub live_log_artifact: String,
    /// How long `launch` waits for the start event. `None` waits forever.
    pub launch_timeout_secs: Option<u64>,
    /// Grace period between SIGTERM and SIGKILL.
    pub shutdown_grace_secs: u64,
    pub credentials: Option<Credentials>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            provisioner_id: TEST_PROVISIONER_ID.to_string(),
            deadline_minutes: DEFAULT_DEADLINE_MINUTES,
            graph_task_timeout_secs: DEFAULT_GRAPH_TASK_TIMEOUT_SECS,
            owner: DEFAULT_OWNER.to_string(),
            task_name: DEFAULT_TASK_NAME.to_string(),
            live_log_artifact: DEFAULT_LIVE_LOG_ARTIFACT.to_string(),
            launch_timeout_secs: None,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            credentials: None,
        }
    }
}

impl HarnessConfig {
    /// Resolve from the process environment and the config file it points
    /// at. A missing file means defaults.
    pub fn load() -> Result<Self> {
        Self::load_with(process_env)
    }

    /// Like [`HarnessConfig::load`], reading variables through `env`.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file = read_config_file(&config_path_with(&env))?;
        Self::resolve(file, env)
    }

    /// Parse a config file body, ignoring the environment.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file = parse_file(contents).map_err(|e| HarnessError::Config(e.to_string()))?;
        Self::resolve(file, |_| None)
    }

    /// Apply env > file > default to an already parsed file.
    pub fn resolve(file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let provisioner_id = env(ENV_PROVISIONER_ID)
            .or(file.provisioner_id)
            .unwrap_or(defaults.provisioner_id);
        let deadline_minutes = parse_env(&env, ENV_DEADLINE_MINUTES)?
            .or(file.deadline_minutes)
            .unwrap_or(defaults.deadline_minutes);
        let owner = env(ENV_OWNER).or(file.owner).unwrap_or(defaults.owner);
        let launch_timeout_secs =
            parse_env(&env, ENV_LAUNCH_TIMEOUT_SECS)?.or(file.launch_timeout_secs);

        let section = file.credentials.unwrap_or_default();
        let client_id = env(ENV_CLIENT_ID).or(section.client_id);
        let access_token = env(ENV_ACCESS_TOKEN).or(section.access_token);
        let credentials = match (client_id, access_token) {
            (Some(client_id), Some(access_token)) => Some(Credentials {
                client_id,
                access_token,
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(HarnessError::Config(
                    "client_id is set but access_token is missing".to_string(),
                ));
            }
            (None, Some(_)) => {
                return Err(HarnessError::Config(
                    "access_token is set but client_id is missing".to_string(),
                ));
            }
        };

        Ok(Self {
            provisioner_id,
            deadline_minutes,
            graph_task_timeout_secs: file
                .graph_task_timeout_secs
                .unwrap_or(defaults.graph_task_timeout_secs),
            owner,
            task_name: file.task_name.unwrap_or(defaults.task_name),
            live_log_artifact: file
                .live_log_artifact
                .unwrap_or(defaults.live_log_artifact),
            launch_timeout_secs,
            shutdown_grace_secs: file
                .shutdown_grace_secs
                .unwrap_or(defaults.shutdown_grace_secs),
            credentials,
        })
    }

    /// Offset from creation to deadline for new tasks.
    pub fn deadline_offset(&self) -> chrono::Duration {
        i64::try_from(self.deadline_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Process supervision settings.
    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            launch_timeout: self.launch_timeout_secs.map(Duration::from_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

fn parse_env(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| HarnessError::Config(format!("{key}={raw:?} is not a number: {e}")))
        })
        .transpose()
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
