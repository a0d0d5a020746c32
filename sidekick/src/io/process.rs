//! Bounded, synchronous helper for short-lived control commands (tmux, etc.).

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Bytes of stdout/stderr kept per stream. Control commands print little;
/// the cap only guards against a misbehaving binary.
pub const OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

/// Captured output of a finished control command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Run `cmd` to completion, killing it if it outlives `timeout`.
///
/// A timeout is an error (`"<description> timed out after .."`); a non-zero
/// exit is not, callers inspect `status`. Stdout and stderr are drained on
/// background threads so a chatty child cannot block on a full pipe.
#[instrument(skip_all, fields(description = %description, timeout_secs = timeout.as_secs()))]
pub fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    description: &str,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("{description} failed to spawn"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_limited(stdout, OUTPUT_LIMIT_BYTES));
    let stderr_handle = thread::spawn(move || read_limited(stderr, OUTPUT_LIMIT_BYTES));

    let status = match child
        .wait_timeout(timeout)
        .with_context(|| format!("{description} wait"))?
    {
        Some(status) => status,
        None => {
            warn!(description, "command timed out, killing");
            child
                .kill()
                .with_context(|| format!("{description} kill after timeout"))?;
            child.wait().ok();
            bail!("{description} timed out after {timeout:?}");
        }
    };

    let stdout = join_reader(stdout_handle).context("join stdout")?;
    let stderr = join_reader(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
    })
}

fn join_reader(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream to EOF, keeping at most `limit` bytes.
fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
    }
    Ok(buf)
}
