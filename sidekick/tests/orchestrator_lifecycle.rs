//! End-to-end loop scenarios against a scripted feed.
//!
//! The feed and worker are in-memory doubles; the state store is real and
//! writes to a temp directory so persistence is checked from disk.

use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use sidekick::core::types::{HistoryEventKind, ProjectStatus};
use sidekick::io::config::{WorkerConfig, WorkerMode};
use sidekick::io::state_store::{StateStore, load_state};
use sidekick::io::worker::{AgentWorker, Worker};
use sidekick::orchestrator::{IterationOutcome, LoopSettings, Orchestrator, PREEMPTION_DETAILS};
use sidekick::shutdown::ShutdownSignal;
use sidekick::test_support::{
    FakeWorker, ScriptedFeed, StatusPush, project, project_in, project_with_status,
};

fn settings() -> LoopSettings {
    LoopSettings {
        poll_interval: Duration::from_secs(60),
        agent_name: "Claude".to_string(),
        directories: BTreeMap::new(),
    }
}

fn orchestrator<W: Worker>(
    temp: &tempfile::TempDir,
    feed: ScriptedFeed,
    worker: W,
) -> Orchestrator<ScriptedFeed, W> {
    Orchestrator::new(
        feed,
        worker,
        StateStore::load(temp.path().join("state").join("orchestrator.json")),
        settings(),
        ShutdownSignal::new(),
    )
}

#[test]
fn higher_priority_project_preempts_running_work() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut orch = orchestrator(
        &temp,
        ScriptedFeed::new(vec![project("A", 5)]),
        FakeWorker::new(),
    );
    orch.run_iteration().expect("start A");
    assert_eq!(
        orch.worker().current_project().map(|p| p.name.as_str()),
        Some("A")
    );

    // A now shows as In Progress; B arrives with a more urgent priority.
    orch.feed_mut().projects = vec![
        project_with_status("A", 5, ProjectStatus::InProgress),
        project("B", 1),
    ];
    let outcome = orch.run_iteration().expect("preempt");

    assert_eq!(
        outcome,
        IterationOutcome::Started {
            project: "B".to_string(),
            preempted: Some("A".to_string()),
        }
    );
    assert_eq!(
        orch.worker().current_project().map(|p| p.name.as_str()),
        Some("B")
    );
    assert_eq!(orch.worker().stops, 1);

    let pushes = &orch.feed().status_pushes;
    assert!(pushes.contains(&StatusPush {
        name: "A".to_string(),
        status: ProjectStatus::Paused,
        agent: None,
    }));
    let paused_at = pushes
        .iter()
        .position(|p| p.name == "A" && p.status == ProjectStatus::Paused)
        .expect("A paused");
    let b_started_at = pushes
        .iter()
        .position(|p| p.name == "B" && p.status == ProjectStatus::InProgress)
        .expect("B in progress");
    assert!(paused_at < b_started_at, "preemption completes before the new start");

    let state = load_state(orch.store().path()).expect("state on disk");
    let record = &state.completed_projects[0];
    assert_eq!(record.name, "A");
    assert!(!record.success);
    assert_eq!(record.details, PREEMPTION_DETAILS);
    assert_eq!(state.active_project.map(|a| a.name), Some("B".to_string()));

    let last = state.history.last().expect("history");
    assert_eq!(last.kind, HistoryEventKind::Start);
    assert_eq!(last.message, "Started work on B");
}

#[test]
fn equal_priority_never_preempts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut orch = orchestrator(
        &temp,
        ScriptedFeed::new(vec![project("A", 3)]),
        FakeWorker::new(),
    );
    orch.run_iteration().expect("start A");

    orch.feed_mut().projects = vec![
        project_with_status("A", 3, ProjectStatus::InProgress),
        project("Peer", 3),
        project("Later", 9),
    ];
    for _ in 0..3 {
        let outcome = orch.run_iteration().expect("iteration");
        assert_eq!(
            outcome,
            IterationOutcome::Continued {
                project: "A".to_string()
            }
        );
    }
    assert_eq!(orch.worker().stops, 0);
    assert_eq!(orch.worker().starts.len(), 1);
}

#[test]
fn exhausted_feed_leaves_everything_untouched() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut orch = orchestrator(
        &temp,
        ScriptedFeed::new(vec![
            project_with_status("Done", 1, ProjectStatus::Completed),
            project_with_status("Stuck", 2, ProjectStatus::Blocked),
            project_with_status("Waiting", 3, ProjectStatus::Paused),
        ]),
        FakeWorker::new(),
    );

    for _ in 0..3 {
        assert_eq!(orch.run_iteration().expect("iteration"), IterationOutcome::Idle);
    }

    assert_eq!(orch.feed().write_count(), 0);
    assert!(orch.worker().current_project().is_none());
    assert!(orch.worker().starts.is_empty());
    assert!(orch.store().state().history.is_empty());
    assert!(!orch.store().path().exists(), "no state writes when idle");
}

#[test]
fn resumes_lower_priority_work_when_urgent_project_is_done() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut orch = orchestrator(
        &temp,
        ScriptedFeed::new(vec![
            project("Low", 5),
            project_with_status("High", 1, ProjectStatus::Completed),
        ]),
        FakeWorker::new(),
    );

    let outcome = orch.run_iteration().expect("iteration");
    assert_eq!(
        outcome,
        IterationOutcome::Started {
            project: "Low".to_string(),
            preempted: None,
        }
    );
    assert_eq!(orch.worker().starts[0].0, "Low");
}

#[test]
fn failed_start_marks_project_blocked_without_retry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut orch = orchestrator(
        &temp,
        ScriptedFeed::new(vec![project("A", 1), project("B", 2)]),
        FakeWorker::failing(),
    );

    let outcome = orch.run_iteration().expect("iteration");
    assert_eq!(
        outcome,
        IterationOutcome::StartFailed {
            project: "A".to_string(),
            preempted: None,
        }
    );

    let pushes = &orch.feed().status_pushes;
    assert_eq!(pushes.len(), 2);
    assert_eq!(pushes[0].status, ProjectStatus::InProgress);
    assert_eq!(pushes[1].status, ProjectStatus::Blocked);
    assert!(pushes.iter().all(|p| p.name == "A"), "B is not tried this cycle");

    let history = orch.store().recent_history(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, HistoryEventKind::Error);
    assert_eq!(history[0].message, "Failed to start work on A");
    assert!(history[0].details.contains("scripted start failure"));
    assert!(orch.store().active_project().is_none());
}

#[test]
fn state_survives_a_restart() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = {
        let mut orch = orchestrator(
            &temp,
            ScriptedFeed::new(vec![project("Alpha", 4)]),
            FakeWorker::new(),
        );
        orch.run_iteration().expect("start");
        orch.store().path().to_path_buf()
    };

    let reloaded = StateStore::load(&path);
    let active = reloaded.active_project().expect("active");
    assert_eq!(active.name, "Alpha");
    assert_eq!(active.priority, 4);
    assert_eq!(
        reloaded.recent_history(1)[0].details,
        "Priority: 4, Action: Do something"
    );
}

#[test]
fn real_worker_death_is_reconciled_by_the_loop() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workdir = temp.path().join("work");
    fs::create_dir_all(&workdir).expect("workdir");

    let worker = AgentWorker::new(WorkerConfig {
        mode: WorkerMode::Direct,
        command: "sh".to_string(),
        extra_args: vec!["-c".to_string(), "exit 0".to_string()],
        ..WorkerConfig::default()
    });
    let mut orch = orchestrator(
        &temp,
        ScriptedFeed::new(vec![project_in("Quick", 1, &workdir)]),
        worker,
    );
    orch.run_iteration().expect("start");

    // Once the agent has exited, the next iteration records it and frees the slot.
    let mut recorded = false;
    for _ in 0..100 {
        orch.feed_mut().projects.clear();
        orch.run_iteration().expect("iteration");
        if !orch.store().state().completed_projects.is_empty() {
            recorded = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(recorded, "worker exit was never reconciled");

    let record = &orch.store().state().completed_projects[0];
    assert_eq!(record.name, "Quick");
    assert!(record.success);
    assert!(orch.store().active_project().is_none());
    assert!(orch.worker().current_project().is_none());
}
