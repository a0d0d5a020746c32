//! Worker lifecycle: one external agent process bound to at most one project.
//!
//! The [`Worker`] trait decouples the orchestrator loop from how the agent is
//! hosted. [`AgentWorker`] is the real controller; it hosts the agent either
//! as a direct child process or inside a detached tmux session, chosen by
//! configuration. Tests drive the loop with scripted workers instead.
//!
//! State machine: `Idle -> Starting -> Running -> Stopping -> Idle`, plus
//! `Running -> Idle` when [`Worker::is_running`] notices the agent died.

mod direct;
mod session;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::core::types::Project;
use crate::io::config::{WorkerConfig, WorkerMode};

pub use direct::DirectProcess;
pub use session::{TmuxSession, tmux_available};

/// Returned by [`Worker::capture_output`] when the backend cannot capture.
pub const DIRECT_OUTPUT_UNSUPPORTED: &str = "(output capture is not supported in direct mode)";

#[derive(Debug, Error)]
pub enum StartError {
    #[error("worker already running on {project}")]
    AlreadyRunning { project: String },
    #[error("invalid project directory for {project}: {reason}")]
    InvalidDirectory { project: String, reason: String },
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker session failed: {0}")]
    Session(String),
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("failed to terminate worker: {0}")]
    Terminate(String),
    #[error("failed to destroy worker session: {0}")]
    Session(String),
}

/// Lifecycle phase of the worker controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// A worker session that ended on its own, noticed during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub project: Project,
    /// True only for a direct process that exited with status 0.
    pub success: bool,
    pub details: String,
}

/// Capability interface over the single worker slot.
pub trait Worker {
    /// Bind the worker to `project` and deliver `prompt` as its first input.
    ///
    /// Fails with [`StartError::AlreadyRunning`] while occupied; the existing
    /// occupant is left untouched.
    fn start(&mut self, project: &Project, prompt: &str) -> Result<(), StartError>;

    /// True while the agent is alive.
    ///
    /// If the agent died since the last check, clears the occupant, stores a
    /// [`WorkerExit`] for [`Worker::take_exit`] and returns false.
    fn is_running(&mut self) -> bool;

    /// Stop the agent. Succeeds as a no-op when idle. The occupant is always
    /// cleared on return, even when cleanup reports an error.
    fn stop(&mut self) -> Result<(), StopError>;

    fn current_project(&self) -> Option<&Project>;

    fn phase(&self) -> WorkerPhase;

    /// Human-readable status line (`Idle`, `Running: <name>`, ...).
    fn status_text(&mut self) -> String;

    /// Best-effort snapshot of recent agent output. Never changes occupancy.
    fn capture_output(&mut self, max_lines: usize) -> String;

    /// Take the exit noticed by the last reconciliation, if any.
    fn take_exit(&mut self) -> Option<WorkerExit>;

    /// Destroy whatever a previous daemon left running for `project_name`.
    ///
    /// Returns true when something was found and destroyed. Never touches
    /// the current occupant.
    fn release_orphan(&mut self, project_name: &str) -> Result<bool, StopError>;
}

/// Live process or session backing the current occupant.
#[derive(Debug)]
enum WorkerHandle {
    Direct(DirectProcess),
    Session(TmuxSession),
}

#[derive(Debug)]
struct Occupancy {
    project: Project,
    handle: WorkerHandle,
}

/// Worker controller that runs the configured agent command.
#[derive(Debug)]
pub struct AgentWorker {
    config: WorkerConfig,
    mode: WorkerMode,
    phase: WorkerPhase,
    occupant: Option<Occupancy>,
    last_exit: Option<WorkerExit>,
}

impl AgentWorker {
    /// Build a controller for `config`.
    ///
    /// Session mode falls back to direct mode when tmux is not installed.
    pub fn new(config: WorkerConfig) -> Self {
        let mut mode = config.mode;
        if mode == WorkerMode::Session && !tmux_available(config.session_command_timeout()) {
            warn!("tmux not found, falling back to direct subprocess");
            mode = WorkerMode::Direct;
        }
        Self {
            config,
            mode,
            phase: WorkerPhase::Idle,
            occupant: None,
            last_exit: None,
        }
    }

    /// Hosting mode in effect after the tmux availability check.
    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    /// PID of the direct child process, if one is running.
    pub fn worker_pid(&self) -> Option<u32> {
        match &self.occupant.as_ref()?.handle {
            WorkerHandle::Direct(process) => Some(process.pid()),
            WorkerHandle::Session(_) => None,
        }
    }

    /// Name of the tmux session, if one is running.
    pub fn session_name(&self) -> Option<&str> {
        match &self.occupant.as_ref()?.handle {
            WorkerHandle::Session(session) => Some(session.name()),
            WorkerHandle::Direct(_) => None,
        }
    }

    fn validate_directory(project: &Project) -> Result<PathBuf, StartError> {
        let invalid = |reason: String| StartError::InvalidDirectory {
            project: project.name.clone(),
            reason,
        };
        let dir = match &project.directory {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => return Err(invalid("no directory configured".to_string())),
        };
        if !dir.is_dir() {
            return Err(invalid(format!("{} does not exist", dir.display())));
        }
        Ok(dir.clone())
    }

    fn spawn_handle(
        &self,
        project: &Project,
        workdir: &Path,
        prompt: &str,
    ) -> Result<WorkerHandle, StartError> {
        match self.mode {
            WorkerMode::Direct => DirectProcess::spawn(
                &self.config.command,
                &self.config.extra_args,
                workdir,
                prompt,
            )
            .map(WorkerHandle::Direct),
            WorkerMode::Session => {
                TmuxSession::start(&self.config, &project.name, workdir, prompt)
                    .map(WorkerHandle::Session)
            }
        }
    }
}

impl Worker for AgentWorker {
    fn start(&mut self, project: &Project, prompt: &str) -> Result<(), StartError> {
        if self.is_running() {
            let current = self
                .current_project()
                .map(|p| p.name.clone())
                .unwrap_or_default();
            warn!(current = %current, requested = %project.name, "worker already running");
            return Err(StartError::AlreadyRunning { project: current });
        }

        let workdir = Self::validate_directory(project)?;
        self.phase = WorkerPhase::Starting;
        info!(
            project = %project.name,
            dir = %workdir.display(),
            mode = ?self.mode,
            "starting worker"
        );

        match self.spawn_handle(project, &workdir, prompt) {
            Ok(handle) => {
                self.occupant = Some(Occupancy {
                    project: project.clone(),
                    handle,
                });
                self.last_exit = None;
                self.phase = WorkerPhase::Running;
                Ok(())
            }
            Err(err) => {
                self.phase = WorkerPhase::Idle;
                Err(err)
            }
        }
    }

    fn is_running(&mut self) -> bool {
        let Some(occupant) = self.occupant.as_mut() else {
            return false;
        };

        let ended = match &mut occupant.handle {
            WorkerHandle::Direct(process) => process.poll_exit(),
            WorkerHandle::Session(session) => session.poll_ended(),
        };
        let Some((success, details)) = ended else {
            return true;
        };

        if let Some(occupant) = self.occupant.take() {
            info!(project = %occupant.project.name, details = %details, "worker ended");
            self.last_exit = Some(WorkerExit {
                project: occupant.project,
                success,
                details,
            });
        }
        self.phase = WorkerPhase::Idle;
        false
    }

    fn stop(&mut self) -> Result<(), StopError> {
        if !self.is_running() {
            return Ok(());
        }
        let Some(occupant) = self.occupant.take() else {
            return Ok(());
        };

        self.phase = WorkerPhase::Stopping;
        info!(project = %occupant.project.name, "stopping worker");
        let result = match occupant.handle {
            WorkerHandle::Direct(process) => process.terminate(self.config.stop_grace()),
            WorkerHandle::Session(session) => session.kill(),
        };
        self.phase = WorkerPhase::Idle;

        if let Err(err) = &result {
            warn!(project = %occupant.project.name, err = %err, "worker cleanup reported an error");
        }
        result
    }

    fn current_project(&self) -> Option<&Project> {
        self.occupant.as_ref().map(|o| &o.project)
    }

    fn phase(&self) -> WorkerPhase {
        self.phase
    }

    fn status_text(&mut self) -> String {
        if !self.is_running() {
            return "Idle".to_string();
        }
        match &self.occupant {
            Some(Occupancy {
                project,
                handle: WorkerHandle::Session(session),
            }) => format!("Running: {} (tmux: {})", project.name, session.name()),
            Some(occupant) => format!("Running: {}", occupant.project.name),
            None => "Idle".to_string(),
        }
    }

    fn capture_output(&mut self, max_lines: usize) -> String {
        if !self.is_running() {
            return String::new();
        }
        match self.occupant.as_ref().map(|o| &o.handle) {
            Some(WorkerHandle::Session(session)) => match session.capture(max_lines) {
                Ok(output) => output,
                Err(err) => {
                    warn!(session = %session.name(), err = %format!("{err:#}"), "capture failed");
                    String::new()
                }
            },
            Some(WorkerHandle::Direct(_)) => DIRECT_OUTPUT_UNSUPPORTED.to_string(),
            None => String::new(),
        }
    }

    fn take_exit(&mut self) -> Option<WorkerExit> {
        self.last_exit.take()
    }

    fn release_orphan(&mut self, project_name: &str) -> Result<bool, StopError> {
        // A direct child dies with its parent; only sessions outlive a restart.
        if self.mode != WorkerMode::Session {
            return Ok(false);
        }
        let orphan = TmuxSession::for_project(&self.config, project_name);
        if self.session_name() == Some(orphan.name()) {
            return Ok(false);
        }
        let alive = orphan
            .exists()
            .map_err(|err| StopError::Session(format!("{err:#}")))?;
        if !alive {
            return Ok(false);
        }
        info!(session = %orphan.name(), "destroying session left by a previous run");
        orphan.kill()?;
        Ok(true)
    }
}
