//! Test-only builders and scripted collaborators for the orchestrator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::types::{Project, ProjectStatus};
use crate::io::feed::ProjectFeed;
use crate::io::worker::{StartError, StopError, Worker, WorkerExit, WorkerPhase};

/// Create a ready `Pending` project working in `/tmp`.
pub fn project(name: &str, priority: i64) -> Project {
    Project {
        name: name.to_string(),
        priority,
        status: ProjectStatus::Pending,
        next_action: "Do something".to_string(),
        directory: Some(PathBuf::from("/tmp")),
        deadline: Some("2026-12-31".to_string()),
        agent: None,
        last_update: None,
    }
}

pub fn project_with_status(name: &str, priority: i64, status: ProjectStatus) -> Project {
    Project {
        status,
        ..project(name, priority)
    }
}

/// Create a ready project working in `dir`.
pub fn project_in(name: &str, priority: i64, dir: &Path) -> Project {
    Project {
        directory: Some(dir.to_path_buf()),
        ..project(name, priority)
    }
}

/// A status write observed by [`ScriptedFeed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPush {
    pub name: String,
    pub status: ProjectStatus,
    pub agent: Option<String>,
}

/// In-memory feed that serves a fixed project list and records writes.
///
/// Writes are recorded only; they do not change what the next fetch returns.
#[derive(Debug, Default)]
pub struct ScriptedFeed {
    pub projects: Vec<Project>,
    pub fetches: usize,
    /// Fetches up to this count panic instead of returning projects.
    pub failing_fetches: usize,
    pub status_pushes: Vec<StatusPush>,
    pub next_action_pushes: Vec<(String, String)>,
}

impl ScriptedFeed {
    pub fn new(projects: Vec<Project>) -> Self {
        Self {
            projects,
            ..Self::default()
        }
    }

    /// Total number of writes of any kind.
    pub fn write_count(&self) -> usize {
        self.status_pushes.len() + self.next_action_pushes.len()
    }
}

impl ProjectFeed for ScriptedFeed {
    fn fetch_projects(&mut self, _directories: &BTreeMap<String, PathBuf>) -> Vec<Project> {
        self.fetches += 1;
        if self.fetches <= self.failing_fetches {
            panic!("scripted fetch failure {}", self.fetches);
        }
        self.projects.clone()
    }

    fn push_status(&mut self, name: &str, status: ProjectStatus, agent: Option<&str>) {
        self.status_pushes.push(StatusPush {
            name: name.to_string(),
            status,
            agent: agent.map(str::to_string),
        });
    }

    fn push_next_action(&mut self, name: &str, text: &str) {
        self.next_action_pushes.push((name.to_string(), text.to_string()));
    }
}

/// Worker double with no processes behind it.
#[derive(Debug, Default)]
pub struct FakeWorker {
    occupant: Option<Project>,
    last_exit: Option<WorkerExit>,
    /// When set, every `start` fails with a session error.
    pub fail_starts: bool,
    /// `(project name, prompt)` for every successful start.
    pub starts: Vec<(String, String)>,
    pub stops: usize,
    /// Project names passed to `release_orphan`.
    pub orphan_releases: Vec<String>,
}

impl FakeWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            ..Self::default()
        }
    }

    /// Simulate the agent ending on its own.
    pub fn end_externally(&mut self, success: bool) {
        if let Some(project) = self.occupant.take() {
            self.last_exit = Some(WorkerExit {
                project,
                success,
                details: "ended outside the orchestrator".to_string(),
            });
        }
    }
}

impl Worker for FakeWorker {
    fn start(&mut self, project: &Project, prompt: &str) -> Result<(), StartError> {
        if let Some(current) = &self.occupant {
            return Err(StartError::AlreadyRunning {
                project: current.name.clone(),
            });
        }
        if self.fail_starts {
            return Err(StartError::Session("scripted start failure".to_string()));
        }
        self.starts.push((project.name.clone(), prompt.to_string()));
        self.occupant = Some(project.clone());
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.occupant.is_some()
    }

    fn stop(&mut self) -> Result<(), StopError> {
        if self.occupant.take().is_some() {
            self.stops += 1;
        }
        Ok(())
    }

    fn current_project(&self) -> Option<&Project> {
        self.occupant.as_ref()
    }

    fn phase(&self) -> WorkerPhase {
        if self.occupant.is_some() {
            WorkerPhase::Running
        } else {
            WorkerPhase::Idle
        }
    }

    fn status_text(&mut self) -> String {
        match &self.occupant {
            Some(project) => format!("Running: {}", project.name),
            None => "Idle".to_string(),
        }
    }

    fn capture_output(&mut self, _max_lines: usize) -> String {
        String::new()
    }

    fn take_exit(&mut self) -> Option<WorkerExit> {
        self.last_exit.take()
    }

    fn release_orphan(&mut self, project_name: &str) -> Result<bool, StopError> {
        self.orphan_releases.push(project_name.to_string());
        Ok(true)
    }
}
