//! Single-agent work orchestrator.
//!
//! Polls a prioritized project feed (`projects.json`) and keeps one coding
//! agent working on the most urgent ready project, switching when something
//! strictly more urgent appears. Configuration lives in `sidekick.toml`.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use sidekick::core::scheduler::select_next;
use sidekick::exit_codes;
use sidekick::io::config::{DEFAULT_CONFIG_PATH, SidekickConfig, load_config};
use sidekick::io::feed::{FileFeed, ProjectFeed};
use sidekick::io::state_store::StateStore;
use sidekick::io::worker::AgentWorker;
use sidekick::logging;
use sidekick::orchestrator::{LoopSettings, Orchestrator};
use sidekick::shutdown::{ShutdownSignal, install_signal_listener};

/// Completions listed by `sidekick status`.
const STATUS_COMPLETIONS: usize = 3;
/// History events listed by `sidekick status`.
const STATUS_EVENTS: usize = 5;

#[derive(Parser)]
#[command(
    name = "sidekick",
    version,
    about = "Keep one coding agent on the most urgent ready project"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator loop until SIGINT or SIGTERM.
    Run,
    /// Print the persisted orchestrator state.
    Status {
        /// Print the raw state as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the project that would be started next, without starting it.
    Select,
    /// Set a project's next action in the feed.
    NextAction {
        /// Project name as it appears in the feed.
        project: String,
        text: String,
    },
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run => cmd_run(&cli.config),
        Command::Status { json } => cmd_status(&cli.config, json),
        Command::Select => cmd_select(&cli.config),
        Command::NextAction { project, text } => cmd_next_action(&cli.config, &project, &text),
    }
}

fn cmd_run(config_path: &Path) -> Result<i32> {
    // Must precede every other thread so the signal mask is inherited.
    let shutdown = ShutdownSignal::new();
    install_signal_listener(shutdown.clone())?;

    let config = load_config(config_path)?;
    let _guard = logging::init("info", config.state.log_file.as_deref())?;
    let feed = FileFeed::open(&config.feed.path)?;
    let worker = AgentWorker::new(config.worker.clone());
    let store = StateStore::load(&config.state.state_file);
    info!(
        config = %config_path.display(),
        feed = %feed.path().display(),
        state = %store.path().display(),
        mode = ?worker.mode(),
        "configuration loaded"
    );

    let mut orchestrator = Orchestrator::new(
        feed,
        worker,
        store,
        LoopSettings::from_config(&config),
        shutdown,
    );
    orchestrator.run();
    Ok(exit_codes::OK)
}

fn cmd_status(config_path: &Path, json: bool) -> Result<i32> {
    let config = load_cli_config(config_path)?;
    let store = StateStore::load(&config.state.state_file);
    let state = store.state();

    if json {
        println!("{}", serde_json::to_string_pretty(state)?);
        return Ok(exit_codes::OK);
    }

    match &state.active_project {
        Some(active) => println!(
            "Active project: {} (P{}) since {}",
            active.name,
            active.priority,
            active.started_at.to_rfc3339()
        ),
        None => println!("Active project: none"),
    }
    match state.last_update {
        Some(ts) => println!("Last update: {}", ts.to_rfc3339()),
        None => println!("Last update: never"),
    }

    println!("Recent history:");
    for event in store.recent_history(STATUS_EVENTS) {
        let kind = event.kind.as_str();
        if event.details.is_empty() {
            println!("  {} [{kind}] {}", event.timestamp.to_rfc3339(), event.message);
        } else {
            println!(
                "  {} [{kind}] {} ({})",
                event.timestamp.to_rfc3339(),
                event.message,
                event.details
            );
        }
    }

    println!("Recent completions:");
    let completed = &state.completed_projects;
    for record in &completed[completed.len().saturating_sub(STATUS_COMPLETIONS)..] {
        let outcome = if record.success { "ok" } else { "failed" };
        println!(
            "  {} {} (P{}) {outcome}: {}",
            record.completed_at.to_rfc3339(),
            record.name,
            record.priority,
            record.details
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_select(config_path: &Path) -> Result<i32> {
    let config = load_cli_config(config_path)?;
    let mut feed = FileFeed::open(&config.feed.path)?;
    let projects = feed.fetch_projects(&config.projects);
    match select_next(&projects) {
        Some(project) => {
            println!("{project}");
            Ok(exit_codes::OK)
        }
        None => {
            println!("no ready projects");
            Ok(exit_codes::IDLE)
        }
    }
}

fn cmd_next_action(config_path: &Path, project: &str, text: &str) -> Result<i32> {
    let config = load_cli_config(config_path)?;
    let feed = FileFeed::open(&config.feed.path)?;
    if !feed.update_next_action(project, text)? {
        bail!("project not found in feed: {project}");
    }
    println!("{project}: next action set");
    Ok(exit_codes::OK)
}

/// Load config for one-shot commands, with quiet diagnostics.
fn load_cli_config(config_path: &Path) -> Result<SidekickConfig> {
    logging::init("warn", None)?;
    load_config(config_path)
}
