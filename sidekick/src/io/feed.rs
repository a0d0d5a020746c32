//! Project feed: where project rows come from and where status goes back.
//!
//! The orchestrator only sees [`ProjectFeed`]. [`FileFeed`] keeps the rows in
//! a local JSON array shaped like the spreadsheet the daemon was built
//! around, one object per row:
//!
//! ```json
//! [{"Project": "Alpha", "Priority": 1, "Status": "Pending",
//!   "Next Action": "Write tests", "Deadline": "2026-11-01",
//!   "Agent": "", "Last Update": "2026-10-01T09:00:00Z"}]
//! ```
//!
//! Feed failures never propagate: a bad read is "no data this cycle" and a
//! bad write is logged and dropped.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use crate::core::types::{DEFAULT_PRIORITY, Project, ProjectStatus, parse_timestamp};
use crate::io::paths::write_atomic;

const COL_PROJECT: &str = "Project";
const COL_STATUS: &str = "Status";
const COL_NEXT_ACTION: &str = "Next Action";
const COL_AGENT: &str = "Agent";
const COL_LAST_UPDATE: &str = "Last Update";

/// Source of project rows and sink for status updates.
pub trait ProjectFeed {
    /// Current project list, in feed order, with directories merged in from
    /// `directories` by name. Errors yield an empty list.
    fn fetch_projects(&mut self, directories: &BTreeMap<String, PathBuf>) -> Vec<Project>;

    /// Set a project's status label, and its agent when given. Unknown
    /// projects are a logged no-op.
    fn push_status(&mut self, name: &str, status: ProjectStatus, agent: Option<&str>);

    fn push_next_action(&mut self, name: &str, text: &str);
}

/// One feed row as written by humans. Every column is optional.
#[derive(Debug, Deserialize)]
struct FeedRow {
    #[serde(rename = "Project", default)]
    project: String,
    #[serde(rename = "Priority", default)]
    priority: Value,
    #[serde(rename = "Status", default)]
    status: Option<String>,
    #[serde(rename = "Next Action", default)]
    next_action: Option<String>,
    #[serde(rename = "Deadline", default)]
    deadline: Option<String>,
    #[serde(rename = "Agent", default)]
    agent: Option<String>,
    #[serde(rename = "Last Update", default)]
    last_update: Option<String>,
}

impl FeedRow {
    fn into_project(self, directories: &BTreeMap<String, PathBuf>) -> Option<Project> {
        let name = self.project.trim().to_string();
        if name.is_empty() {
            return None;
        }
        Some(Project {
            directory: directories.get(&name).cloned(),
            priority: parse_priority(&self.priority),
            status: self
                .status
                .as_deref()
                .map(ProjectStatus::from_label)
                .unwrap_or(ProjectStatus::Pending),
            next_action: self.next_action.unwrap_or_default().trim().to_string(),
            deadline: non_empty(self.deadline),
            agent: non_empty(self.agent),
            last_update: self.last_update.as_deref().and_then(parse_timestamp),
            name,
        })
    }
}

/// Integers or numeric strings; anything else is [`DEFAULT_PRIORITY`].
fn parse_priority(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(DEFAULT_PRIORITY),
        Value::String(s) => s.trim().parse().unwrap_or(DEFAULT_PRIORITY),
        _ => DEFAULT_PRIORITY,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Feed backed by a JSON array of rows on disk.
#[derive(Debug, Clone)]
pub struct FileFeed {
    path: PathBuf,
}

impl FileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open a feed whose backing file must already exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(anyhow!(
                "project feed not found: {} (create a JSON array of project rows)",
                path.display()
            ));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_rows(&self) -> Result<Vec<Value>> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read feed {}", self.path.display()))?;
        let rows: Vec<Value> = serde_json::from_str(&contents)
            .with_context(|| format!("parse feed {}", self.path.display()))?;
        Ok(rows)
    }

    fn write_rows(&self, rows: &[Value]) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(rows).context("serialize feed")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }

    /// Parse every row, skipping unnamed and malformed ones.
    pub fn load_projects(&self, directories: &BTreeMap<String, PathBuf>) -> Result<Vec<Project>> {
        let rows = self.read_rows()?;
        let mut projects = Vec::with_capacity(rows.len());
        for (index, row) in rows.into_iter().enumerate() {
            match serde_json::from_value::<FeedRow>(row) {
                Ok(row) => match row.into_project(directories) {
                    Some(project) => projects.push(project),
                    None => debug!(index, "skipping row without a project name"),
                },
                Err(err) => warn!(index, err = %err, "skipping malformed feed row"),
            }
        }
        Ok(projects)
    }

    /// Apply `update` to the row named `name` and write the feed back.
    ///
    /// Returns `Ok(false)` when no such row exists.
    fn update_row(
        &self,
        name: &str,
        update: impl FnOnce(&mut serde_json::Map<String, Value>),
    ) -> Result<bool> {
        let mut rows = self.read_rows()?;
        let Some(row) = rows.iter_mut().find_map(|row| {
            let obj = row.as_object_mut()?;
            let matches = obj
                .get(COL_PROJECT)
                .and_then(Value::as_str)
                .is_some_and(|p| p.trim() == name);
            matches.then_some(obj)
        }) else {
            return Ok(false);
        };
        update(row);
        row.insert(
            COL_LAST_UPDATE.to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        self.write_rows(&rows)?;
        Ok(true)
    }

    /// Set `Status` (and `Agent` when given) on the row named `name`.
    ///
    /// Returns `Ok(false)` when no such row exists.
    pub fn update_status(
        &self,
        name: &str,
        status: ProjectStatus,
        agent: Option<&str>,
    ) -> Result<bool> {
        self.update_row(name, |row| {
            row.insert(
                COL_STATUS.to_string(),
                Value::String(status.as_str().to_string()),
            );
            if let Some(agent) = agent {
                row.insert(COL_AGENT.to_string(), Value::String(agent.to_string()));
            }
        })
    }

    /// Set `Next Action` on the row named `name`.
    pub fn update_next_action(&self, name: &str, text: &str) -> Result<bool> {
        self.update_row(name, |row| {
            row.insert(COL_NEXT_ACTION.to_string(), Value::String(text.to_string()));
        })
    }

    fn log_update(&self, name: &str, what: &str, result: Result<bool>) {
        match result {
            Ok(true) => debug!(project = name, what, "feed updated"),
            Ok(false) => warn!(project = name, what, "project not found in feed"),
            Err(err) => error!(
                project = name,
                what,
                path = %self.path.display(),
                err = %format!("{err:#}"),
                "feed update failed"
            ),
        }
    }
}

impl ProjectFeed for FileFeed {
    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn fetch_projects(&mut self, directories: &BTreeMap<String, PathBuf>) -> Vec<Project> {
        match self.load_projects(directories) {
            Ok(projects) => {
                debug!(count = projects.len(), "fetched projects");
                projects
            }
            Err(err) => {
                error!(err = %format!("{err:#}"), "feed fetch failed, no data this cycle");
                Vec::new()
            }
        }
    }

    fn push_status(&mut self, name: &str, status: ProjectStatus, agent: Option<&str>) {
        let result = self.update_status(name, status, agent);
        self.log_update(name, "status", result);
    }

    fn push_next_action(&mut self, name: &str, text: &str) {
        let result = self.update_next_action(name, text);
        self.log_update(name, "next_action", result);
    }
}
