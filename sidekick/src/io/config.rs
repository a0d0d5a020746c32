//! Orchestrator configuration stored in `sidekick.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::paths::{expand_home, write_atomic};

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "sidekick.toml";

/// Orchestrator configuration (TOML).
///
/// Populated once at startup. Missing fields default to the values the daemon
/// has always run with; a missing file is an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SidekickConfig {
    pub feed: FeedConfig,
    pub worker: WorkerConfig,
    pub state: StateConfig,
    /// Project name to working directory. Merged into feed rows at fetch time.
    pub projects: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeedConfig {
    /// JSON file holding the project rows.
    pub path: PathBuf,
    /// Seconds between loop iterations.
    pub poll_interval_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("projects.json"),
            poll_interval_secs: 60,
        }
    }
}

/// How the worker process is hosted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Child process with piped stdin.
    Direct,
    /// Detached tmux session.
    Session,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub mode: WorkerMode,
    /// Agent executable (e.g. `claude`).
    pub command: String,
    pub extra_args: Vec<String>,
    /// Identity pushed to the feed alongside `In Progress`.
    pub agent_name: String,
    /// Prefix for tmux session names.
    pub session_prefix: String,
    /// Wait after creating a session before checking that it is alive.
    pub settle_delay_ms: u64,
    /// Grace window between SIGTERM and SIGKILL in direct mode.
    pub stop_grace_secs: u64,
    /// Timeout for quick tmux queries (`has-session`, `send-keys`, ...).
    pub session_command_timeout_secs: u64,
    /// Timeout for `tmux new-session` and `kill-session` on stop.
    pub session_create_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: WorkerMode::Session,
            command: "claude".to_string(),
            extra_args: Vec::new(),
            agent_name: "Claude".to_string(),
            session_prefix: "claude".to_string(),
            settle_delay_ms: 500,
            stop_grace_secs: 10,
            session_command_timeout_secs: 5,
            session_create_timeout_secs: 10,
        }
    }
}

impl WorkerConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn session_command_timeout(&self) -> Duration {
        Duration::from_secs(self.session_command_timeout_secs)
    }

    pub fn session_create_timeout(&self) -> Duration {
        Duration::from_secs(self.session_create_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StateConfig {
    /// Persisted orchestrator state (JSON).
    pub state_file: PathBuf,
    /// Optional diagnostics log file, in addition to stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("./state/orchestrator.json"),
            log_file: None,
        }
    }
}

impl SidekickConfig {
    pub fn validate(&self) -> Result<()> {
        if self.feed.poll_interval_secs == 0 {
            return Err(anyhow!("feed.poll_interval_secs must be > 0"));
        }
        if self.feed.path.as_os_str().is_empty() {
            return Err(anyhow!("feed.path must not be empty"));
        }
        if self.worker.command.trim().is_empty() {
            return Err(anyhow!("worker.command must not be empty"));
        }
        if self.worker.session_prefix.trim().is_empty() {
            return Err(anyhow!("worker.session_prefix must not be empty"));
        }
        if self.worker.session_command_timeout_secs == 0
            || self.worker.session_create_timeout_secs == 0
        {
            return Err(anyhow!("worker session timeouts must be > 0"));
        }
        if self.state.state_file.as_os_str().is_empty() {
            return Err(anyhow!("state.state_file must not be empty"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.feed.poll_interval_secs)
    }

    /// Expand `~` in every configured path.
    fn expand_paths(&mut self) {
        self.feed.path = expand_home(&self.feed.path);
        self.state.state_file = expand_home(&self.state.state_file);
        self.state.log_file = self.state.log_file.as_deref().map(expand_home);
        for dir in self.projects.values_mut() {
            *dir = expand_home(dir);
        }
    }
}

/// Load config from a TOML file.
///
/// A missing file is a startup error: the daemon has nothing sensible to run
/// against without a feed and directory map.
pub fn load_config(path: &Path) -> Result<SidekickConfig> {
    if !path.exists() {
        return Err(anyhow!(
            "config file not found: {} (pass --config or create sidekick.toml)",
            path.display()
        ));
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: SidekickConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    cfg.expand_paths();
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SidekickConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
