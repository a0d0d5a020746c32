//! Session-mode worker: the agent runs inside a detached tmux session.
//!
//! All tmux calls are bounded by [`run_with_timeout`]; a hung tmux server
//! surfaces as an error instead of wedging the loop.

use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use super::{StartError, StopError};
use crate::io::config::WorkerConfig;
use crate::io::process::run_with_timeout;

/// Derive the tmux session name for a project.
///
/// Lowercased, with separators tmux treats specially replaced by `-`.
pub fn session_name(prefix: &str, project_name: &str) -> String {
    let slug: String = project_name
        .to_lowercase()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '.' | ':' => '-',
            other => other,
        })
        .collect();
    format!("{prefix}-{slug}")
}

/// Quote `arg` for `sh -c`, leaving plain words untouched.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// True when a `tmux` binary answers `tmux -V`.
pub fn tmux_available(timeout: Duration) -> bool {
    let mut cmd = Command::new("tmux");
    cmd.arg("-V");
    matches!(run_with_timeout(cmd, timeout, "tmux -V"), Ok(out) if out.success())
}

/// Handle to a live tmux session hosting the agent.
#[derive(Debug)]
pub struct TmuxSession {
    name: String,
    command_timeout: Duration,
    create_timeout: Duration,
}

impl TmuxSession {
    /// Create the session in `workdir`, running the configured agent command,
    /// then type `prompt` into it.
    ///
    /// A stale session with the same name is destroyed first.
    pub fn start(
        config: &WorkerConfig,
        project_name: &str,
        workdir: &Path,
        prompt: &str,
    ) -> Result<Self, StartError> {
        let session = Self::for_project(config, project_name);

        if session.exists().map_err(session_error)? {
            warn!(session = %session.name, "replacing stale session");
            session.kill_quietly();
            thread::sleep(config.settle_delay());
        }

        let command_line = std::iter::once(config.command.as_str())
            .chain(config.extra_args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ");
        let mut cmd = Command::new("tmux");
        cmd.arg("new-session")
            .arg("-d")
            .arg("-s")
            .arg(&session.name)
            .arg("-c")
            .arg(workdir)
            .arg(&command_line);
        let out = run_with_timeout(cmd, session.create_timeout, "tmux new-session")
            .map_err(session_error)?;
        if !out.success() {
            return Err(StartError::Session(format!(
                "tmux new-session {} failed: {}",
                session.name,
                out.stderr_lossy()
            )));
        }

        thread::sleep(config.settle_delay());
        if !session.exists().map_err(session_error)? {
            return Err(StartError::Session(format!(
                "session {} exited immediately",
                session.name
            )));
        }

        if let Err(err) = session.send_prompt(prompt) {
            session.kill_quietly();
            return Err(session_error(err));
        }

        info!(
            session = %session.name,
            attach = %format!("tmux attach -t {}", session.name),
            "agent session started"
        );
        Ok(session)
    }

    /// Handle for the session `project_name` would run in, without creating it.
    pub fn for_project(config: &WorkerConfig, project_name: &str) -> Self {
        Self {
            name: session_name(&config.session_prefix, project_name),
            command_timeout: config.session_command_timeout(),
            create_timeout: config.session_create_timeout(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Query `tmux has-session`.
    pub fn exists(&self) -> Result<bool> {
        let out = run_with_timeout(
            self.tmux(&["has-session", "-t"], self.session_target()),
            self.command_timeout,
            "tmux has-session",
        )?;
        Ok(out.success())
    }

    /// Liveness check for reconciliation. Returns `(success, details)` once
    /// the session is gone. A failed query keeps the session presumed alive.
    pub fn poll_ended(&self) -> Option<(bool, String)> {
        match self.exists() {
            Ok(true) => None,
            Ok(false) => Some((false, format!("tmux session {} ended", self.name))),
            Err(err) => {
                warn!(session = %self.name, err = %format!("{err:#}"), "session query failed");
                None
            }
        }
    }

    /// Last `max_lines` lines of the session's visible pane.
    pub fn capture(&self, max_lines: usize) -> Result<String> {
        let out = run_with_timeout(
            self.tmux(&["capture-pane", "-p", "-t"], self.pane_target()),
            self.command_timeout,
            "tmux capture-pane",
        )?;
        if !out.success() {
            bail!("tmux capture-pane failed: {}", out.stderr_lossy());
        }
        let text = out.stdout_lossy();
        let lines: Vec<&str> = text.trim_end().lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        Ok(lines[start..].join("\n"))
    }

    /// Destroy the session. An already-gone session counts as success.
    pub fn kill(self) -> Result<(), StopError> {
        let out = run_with_timeout(
            self.tmux(&["kill-session", "-t"], self.session_target()),
            self.create_timeout,
            "tmux kill-session",
        )
        .map_err(|err| StopError::Session(format!("{err:#}")))?;
        if out.success() {
            debug!(session = %self.name, "session destroyed");
            return Ok(());
        }
        match self.exists() {
            Ok(false) => Ok(()),
            _ => Err(StopError::Session(format!(
                "tmux kill-session {} failed: {}",
                self.name,
                out.stderr_lossy()
            ))),
        }
    }

    fn kill_quietly(&self) {
        if let Err(err) = run_with_timeout(
            self.tmux(&["kill-session", "-t"], self.session_target()),
            self.create_timeout,
            "tmux kill-session",
        ) {
            warn!(session = %self.name, err = %format!("{err:#}"), "kill-session failed");
        }
    }

    fn send_prompt(&self, prompt: &str) -> Result<()> {
        let mut literal = self.tmux(&["send-keys", "-t"], self.pane_target());
        literal.arg("-l").arg("--").arg(prompt);
        let out = run_with_timeout(literal, self.command_timeout, "tmux send-keys")?;
        if !out.success() {
            bail!("tmux send-keys failed: {}", out.stderr_lossy());
        }

        let mut enter = self.tmux(&["send-keys", "-t"], self.pane_target());
        enter.arg("Enter");
        let out = run_with_timeout(enter, self.command_timeout, "tmux send-keys Enter")?;
        if !out.success() {
            bail!("tmux send-keys Enter failed: {}", out.stderr_lossy());
        }
        Ok(())
    }

    // A leading `=` disables tmux's prefix matching, so `claude-app` never
    // resolves to a `claude-app-2` session.
    fn session_target(&self) -> String {
        format!("={}", self.name)
    }

    fn pane_target(&self) -> String {
        format!("={}:", self.name)
    }

    /// `tmux <args...> <target>`; `args` must end with the `-t` flag.
    fn tmux(&self, args: &[&str], target: String) -> Command {
        let mut cmd = Command::new("tmux");
        cmd.args(args).arg(target);
        cmd
    }
}

fn session_error(err: anyhow::Error) -> StartError {
    StartError::Session(format!("{err:#}"))
}
