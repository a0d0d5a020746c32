//! Durable orchestrator state: active project pointer, completions and history.
//!
//! The store owns the state file exclusively. Every mutation is followed by
//! exactly one full rewrite (temp file + rename). Write failures are logged
//! and swallowed: the in-memory state stays authoritative and the next
//! successful write catches the file up.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::core::types::{
    ActiveProject, CompletionRecord, HistoryEvent, HistoryEventKind, Project, lenient_timestamp,
};
use crate::io::paths::write_atomic;

/// Schema version written to fresh state files.
pub const STATE_VERSION: &str = "1.0";

/// Number of history events retained. Older events are dropped.
pub const HISTORY_CAPACITY: usize = 100;

/// Entire persisted orchestrator state.
///
/// Unknown top-level fields written by newer tools are kept in `extra` and
/// written back untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistedState {
    pub version: String,
    #[serde(deserialize_with = "lenient_timestamp::deserialize_option")]
    pub last_update: Option<DateTime<Utc>>,
    pub active_project: Option<ActiveProject>,
    pub completed_projects: Vec<CompletionRecord>,
    pub history: Vec<HistoryEvent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            last_update: None,
            active_project: None,
            completed_projects: Vec::new(),
            history: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// Load persisted state, failing on a missing or malformed file.
pub fn load_state(path: &Path) -> Result<PersistedState> {
    debug!(path = %path.display(), "loading state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    let state: PersistedState = serde_json::from_str(&contents)
        .with_context(|| format!("parse state {}", path.display()))?;
    Ok(state)
}

/// Atomically write state to disk (temp file + rename).
pub fn write_state(path: &Path, state: &PersistedState) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(state).context("serialize state")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write-through store over the state file.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: PersistedState,
}

impl StateStore {
    /// Open the store at `path`.
    ///
    /// A missing or unreadable file is treated as a first run and yields a
    /// fresh default state; corruption is never fatal.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = if path.exists() {
            match load_state(&path) {
                Ok(state) => state,
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        err = %format!("{err:#}"),
                        "state unreadable, starting fresh"
                    );
                    PersistedState::default()
                }
            }
        } else {
            debug!(path = %path.display(), "no state file, starting fresh");
            PersistedState::default()
        };
        Self { path, state }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn active_project(&self) -> Option<&ActiveProject> {
        self.state.active_project.as_ref()
    }

    /// Point the active project at `project`, or clear it.
    pub fn set_active_project(&mut self, project: Option<&Project>) {
        self.state.active_project = project.map(|p| ActiveProject {
            name: p.name.clone(),
            priority: p.priority,
            started_at: Utc::now(),
        });
        self.save();
    }

    /// Append a completion record and its derived `completion` history event.
    pub fn record_completion(&mut self, project: &Project, success: bool, details: &str) {
        self.record_outcome(&project.name, project.priority, success, details);
    }

    /// [`StateStore::record_completion`] for a project known only by name and
    /// priority, such as the active project of a previous run.
    pub fn record_outcome(&mut self, name: &str, priority: i64, success: bool, details: &str) {
        self.state.completed_projects.push(CompletionRecord {
            name: name.to_string(),
            priority,
            completed_at: Utc::now(),
            success,
            details: details.to_string(),
        });
        let verb = if success { "Completed" } else { "Failed" };
        self.push_event(
            HistoryEventKind::Completion,
            format!("{verb}: {name}"),
            details.to_string(),
        );
        self.save();
    }

    pub fn add_history_event(
        &mut self,
        kind: HistoryEventKind,
        message: impl Into<String>,
        details: impl Into<String>,
    ) {
        self.push_event(kind, message.into(), details.into());
        self.save();
    }

    /// The last `limit` history events, oldest first.
    pub fn recent_history(&self, limit: usize) -> &[HistoryEvent] {
        let history = &self.state.history;
        &history[history.len().saturating_sub(limit)..]
    }

    fn push_event(&mut self, kind: HistoryEventKind, message: String, details: String) {
        self.state.history.push(HistoryEvent {
            timestamp: Utc::now(),
            kind,
            message,
            details,
        });
        let overflow = self.state.history.len().saturating_sub(HISTORY_CAPACITY);
        if overflow > 0 {
            self.state.history.drain(..overflow);
        }
    }

    fn save(&mut self) {
        self.state.last_update = Some(Utc::now());
        if let Err(err) = write_state(&self.path, &self.state) {
            error!(
                path = %self.path.display(),
                err = %format!("{err:#}"),
                "failed to persist state"
            );
        }
    }
}
