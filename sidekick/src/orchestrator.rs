//! The polling loop that keeps the worker on the most urgent ready project.
//!
//! Each iteration: reconcile the worker, fetch the feed, preempt if a strictly
//! more urgent project is ready, otherwise start the best candidate when
//! idle. Results go to the state store; status labels go back to the feed.
//! The loop is the only writer of the occupancy slot and the state file.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::core::scheduler::{select_next, should_preempt};
use crate::core::types::{ActiveProject, HistoryEvent, HistoryEventKind, Project, ProjectStatus};
use crate::io::config::SidekickConfig;
use crate::io::feed::ProjectFeed;
use crate::io::prompt::render_worker_prompt;
use crate::io::state_store::StateStore;
use crate::io::worker::Worker;
use crate::shutdown::ShutdownSignal;

/// Details recorded when a running project is paused for a more urgent one.
pub const PREEMPTION_DETAILS: &str = "Paused for higher priority work";

/// Details recorded for an active project inherited from a previous run.
pub const RESTART_DETAILS: &str = "Stopped after restart";

/// History events included in a status snapshot.
pub const STATUS_HISTORY_LIMIT: usize = 5;

/// Loop parameters taken from configuration.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    /// Identity pushed to the feed with `In Progress`.
    pub agent_name: String,
    pub directories: BTreeMap<String, PathBuf>,
}

impl LoopSettings {
    pub fn from_config(config: &SidekickConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            agent_name: config.worker.agent_name.clone(),
            directories: config.projects.clone(),
        }
    }
}

/// What a single iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Worker idle and nothing ready.
    Idle,
    /// Worker kept on its current project.
    Continued { project: String },
    Started {
        project: String,
        preempted: Option<String>,
    },
    StartFailed {
        project: String,
        preempted: Option<String>,
    },
}

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    /// True while the loop is running and no shutdown was requested.
    pub running: bool,
    pub worker_status: String,
    pub active_project: Option<ActiveProject>,
    pub recent_history: Vec<HistoryEvent>,
}

pub struct Orchestrator<F, W> {
    feed: F,
    worker: W,
    store: StateStore,
    settings: LoopSettings,
    shutdown: ShutdownSignal,
    loop_active: bool,
}

impl<F: ProjectFeed, W: Worker> Orchestrator<F, W> {
    pub fn new(
        feed: F,
        worker: W,
        store: StateStore,
        settings: LoopSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            feed,
            worker,
            store,
            settings,
            shutdown,
            loop_active: false,
        }
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    pub fn feed_mut(&mut self) -> &mut F {
        &mut self.feed
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    pub fn worker_mut(&mut self) -> &mut W {
        &mut self.worker
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run iterations until shutdown is requested, then stop the worker.
    ///
    /// Iteration errors and panics become `error` history events and never
    /// end the loop.
    pub fn run(&mut self) {
        info!(
            interval_secs = self.settings.poll_interval.as_secs(),
            "orchestrator started"
        );
        self.clear_stale_active_project();
        self.loop_active = true;

        while !self.shutdown.is_requested() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_iteration()))
                .unwrap_or_else(|payload| {
                    Err(anyhow!("iteration panicked: {}", panic_message(&*payload)))
                });
            match result {
                Ok(outcome) => debug!(?outcome, "iteration finished"),
                Err(err) => {
                    error!(err = %format!("{err:#}"), "iteration failed");
                    self.store.add_history_event(
                        HistoryEventKind::Error,
                        format!("Main loop error: {err:#}"),
                        "",
                    );
                }
            }
            if self.shutdown.wait_timeout(self.settings.poll_interval) {
                break;
            }
        }

        info!("shutting down");
        self.stop_for_shutdown();
        self.loop_active = false;
    }

    /// One pass of reconcile, fetch, preempt and start.
    pub fn run_iteration(&mut self) -> Result<IterationOutcome> {
        self.reconcile_worker();
        let projects = self.feed.fetch_projects(&self.settings.directories);

        let mut preempted = None;
        if let Some(current) = self.worker.current_project().cloned() {
            if !should_preempt(&current, &projects) {
                return Ok(IterationOutcome::Continued {
                    project: current.name,
                });
            }
            self.preempt(&current);
            preempted = Some(current.name);
        }

        let Some(next) = select_next(&projects).cloned() else {
            debug!(count = projects.len(), "no ready projects");
            return Ok(IterationOutcome::Idle);
        };
        self.start_project(next, preempted)
    }

    pub fn status(&mut self) -> OrchestratorStatus {
        OrchestratorStatus {
            running: self.loop_active && !self.shutdown.is_requested(),
            worker_status: self.worker.status_text(),
            active_project: self.store.active_project().cloned(),
            recent_history: self.store.recent_history(STATUS_HISTORY_LIMIT).to_vec(),
        }
    }

    /// Record a worker that ended on its own since the last iteration.
    fn reconcile_worker(&mut self) {
        if self.worker.is_running() {
            return;
        }
        let Some(exit) = self.worker.take_exit() else {
            return;
        };
        info!(
            project = %exit.project.name,
            success = exit.success,
            "worker finished on its own"
        );
        self.store.record_completion(&exit.project, exit.success, &exit.details);
        self.store.set_active_project(None);
    }

    fn preempt(&mut self, current: &Project) {
        info!(project = %current.name, "preempting for higher priority work");
        if let Err(err) = self.worker.stop() {
            warn!(project = %current.name, err = %err, "stop during preemption failed");
            self.store.add_history_event(
                HistoryEventKind::Error,
                format!("Failed to stop work on {}", current.name),
                err.to_string(),
            );
        }
        self.store.record_completion(current, false, PREEMPTION_DETAILS);
        self.feed.push_status(&current.name, ProjectStatus::Paused, None);
        self.store.set_active_project(None);
    }

    fn start_project(
        &mut self,
        project: Project,
        preempted: Option<String>,
    ) -> Result<IterationOutcome> {
        let prompt = render_worker_prompt(&project)?;
        self.feed.push_status(
            &project.name,
            ProjectStatus::InProgress,
            Some(&self.settings.agent_name),
        );

        match self.worker.start(&project, &prompt) {
            Ok(()) => {
                info!(project = %project.name, priority = project.priority, "work started");
                self.store.set_active_project(Some(&project));
                self.store.add_history_event(
                    HistoryEventKind::Start,
                    format!("Started work on {}", project.name),
                    format!(
                        "Priority: {}, Action: {}",
                        project.priority, project.next_action
                    ),
                );
                Ok(IterationOutcome::Started {
                    project: project.name,
                    preempted,
                })
            }
            Err(err) => {
                warn!(project = %project.name, err = %err, "worker failed to start");
                self.feed.push_status(&project.name, ProjectStatus::Blocked, None);
                self.store.add_history_event(
                    HistoryEventKind::Error,
                    format!("Failed to start work on {}", project.name),
                    err.to_string(),
                );
                Ok(IterationOutcome::StartFailed {
                    project: project.name,
                    preempted,
                })
            }
        }
    }

    /// Settle an active project left behind by a previous process: destroy
    /// its worker if it outlived the daemon, record it as stopped and clear
    /// the pointer.
    fn clear_stale_active_project(&mut self) {
        if self.worker.is_running() {
            return;
        }
        let Some(stale) = self.store.active_project().cloned() else {
            return;
        };
        warn!(project = %stale.name, "clearing active project from a previous run");
        if let Err(err) = self.worker.release_orphan(&stale.name) {
            warn!(project = %stale.name, err = %err, "could not destroy leftover worker");
            self.store.add_history_event(
                HistoryEventKind::Error,
                format!("Failed to stop leftover work on {}", stale.name),
                err.to_string(),
            );
        }
        self.store.record_outcome(&stale.name, stale.priority, false, RESTART_DETAILS);
        self.store.set_active_project(None);
    }

    fn stop_for_shutdown(&mut self) {
        let Some(current) = self.worker.current_project().cloned() else {
            return;
        };
        if !self.worker.is_running() {
            self.reconcile_worker();
            return;
        }
        if let Err(err) = self.worker.stop() {
            warn!(project = %current.name, err = %err, "stop at shutdown failed");
        }
        self.store.record_completion(&current, false, "Stopped at shutdown");
        self.store.set_active_project(None);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeWorker, ScriptedFeed, project};
    use std::thread;
    use std::time::Instant;

    fn orchestrator(
        temp: &tempfile::TempDir,
        projects: Vec<Project>,
        worker: FakeWorker,
    ) -> Orchestrator<ScriptedFeed, FakeWorker> {
        Orchestrator::new(
            ScriptedFeed::new(projects),
            worker,
            StateStore::load(temp.path().join("state.json")),
            LoopSettings {
                poll_interval: Duration::from_secs(60),
                agent_name: "Claude".to_string(),
                directories: BTreeMap::new(),
            },
            ShutdownSignal::new(),
        )
    }

    #[test]
    fn start_pushes_in_progress_then_records_start() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(&temp, vec![project("Alpha", 2)], FakeWorker::new());

        let outcome = orch.run_iteration().expect("iteration");
        assert_eq!(
            outcome,
            IterationOutcome::Started {
                project: "Alpha".to_string(),
                preempted: None
            }
        );

        let push = &orch.feed().status_pushes[0];
        assert_eq!(push.status, ProjectStatus::InProgress);
        assert_eq!(push.agent.as_deref(), Some("Claude"));

        let (name, prompt) = &orch.worker().starts[0];
        assert_eq!(name, "Alpha");
        assert!(prompt.contains("Next Action: Do something"));

        let event = orch.store().recent_history(1)[0].clone();
        assert_eq!(event.kind, HistoryEventKind::Start);
        assert_eq!(event.message, "Started work on Alpha");
        assert_eq!(event.details, "Priority: 2, Action: Do something");
        assert_eq!(
            orch.store().active_project().map(|a| a.name.as_str()),
            Some("Alpha")
        );
    }

    #[test]
    fn occupied_worker_continues_without_feed_writes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(&temp, vec![project("Alpha", 2)], FakeWorker::new());
        orch.run_iteration().expect("first");
        let writes = orch.feed().write_count();

        orch.feed_mut().projects = vec![project("Alpha", 2), project("Tie", 2)];
        let outcome = orch.run_iteration().expect("second");

        assert_eq!(
            outcome,
            IterationOutcome::Continued {
                project: "Alpha".to_string()
            }
        );
        assert_eq!(orch.feed().write_count(), writes);
    }

    #[test]
    fn natural_exit_is_recorded_and_frees_the_slot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(&temp, vec![project("Alpha", 2)], FakeWorker::new());
        orch.run_iteration().expect("start");

        orch.worker_mut().end_externally(true);
        orch.feed_mut().projects.clear();
        let outcome = orch.run_iteration().expect("reconcile");

        assert_eq!(outcome, IterationOutcome::Idle);
        let state = orch.store().state();
        assert!(state.active_project.is_none());
        assert_eq!(state.completed_projects.len(), 1);
        assert!(state.completed_projects[0].success);
    }

    #[test]
    fn status_reports_worker_and_recent_history() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(&temp, vec![project("Alpha", 2)], FakeWorker::new());
        for i in 0..7 {
            orch.store.add_history_event(HistoryEventKind::Error, format!("noise {i}"), "");
        }
        orch.run_iteration().expect("start");

        let status = orch.status();
        assert!(!status.running);
        assert_eq!(status.worker_status, "Running: Alpha");
        assert_eq!(
            status.active_project.map(|a| a.name),
            Some("Alpha".to_string())
        );
        assert_eq!(status.recent_history.len(), STATUS_HISTORY_LIMIT);
        assert_eq!(
            status.recent_history.last().map(|e| e.message.as_str()),
            Some("Started work on Alpha")
        );
    }

    #[test]
    fn run_exits_promptly_on_shutdown_and_stops_worker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(&temp, vec![project("Alpha", 2)], FakeWorker::new());
        let trigger = orch.shutdown_signal();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.request();
        });

        let started = Instant::now();
        orch.run();
        handle.join().expect("join");

        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(orch.worker().stops, 1);
        assert!(orch.worker().current_project().is_none());
        assert!(orch.store().active_project().is_none());
        let last = orch.store().state().completed_projects.last().cloned();
        assert_eq!(last.map(|c| c.details), Some("Stopped at shutdown".to_string()));
        assert!(!orch.status().running);
    }

    #[test]
    fn stale_active_project_is_released_and_recorded_on_startup() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let mut store = StateStore::load(temp.path().join("state.json"));
            store.set_active_project(Some(&project("Ghost", 1)));
        }
        let mut orch = orchestrator(&temp, Vec::new(), FakeWorker::new());
        orch.shutdown_signal().request();
        orch.run();

        assert_eq!(orch.worker().orphan_releases, vec!["Ghost".to_string()]);
        assert!(orch.store().active_project().is_none());
        assert_eq!(orch.feed().fetches, 0);

        let record = &orch.store().state().completed_projects[0];
        assert_eq!(record.name, "Ghost");
        assert_eq!(record.priority, 1);
        assert!(!record.success);
        assert_eq!(record.details, RESTART_DETAILS);
        assert_eq!(orch.store().recent_history(1)[0].message, "Failed: Ghost");
    }

    #[test]
    fn startup_without_stale_pointer_releases_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(&temp, Vec::new(), FakeWorker::new());
        orch.shutdown_signal().request();
        orch.run();

        assert!(orch.worker().orphan_releases.is_empty());
        assert!(orch.store().state().completed_projects.is_empty());
    }

    #[test]
    fn failing_iteration_is_recorded_and_the_loop_keeps_going() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut orch = orchestrator(&temp, vec![project("Alpha", 2)], FakeWorker::new());
        orch.settings.poll_interval = Duration::from_millis(10);
        orch.feed_mut().failing_fetches = 1;

        let trigger = orch.shutdown_signal();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            trigger.request();
        });
        orch.run();
        handle.join().expect("join");

        let errors: Vec<&HistoryEvent> = orch
            .store()
            .state()
            .history
            .iter()
            .filter(|e| e.kind == HistoryEventKind::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.starts_with("Main loop error"));
        assert!(errors[0].message.contains("scripted fetch failure"));

        assert!(orch.feed().fetches >= 2);
        assert_eq!(orch.worker().starts[0].0, "Alpha", "next iteration still ran");
    }
}
