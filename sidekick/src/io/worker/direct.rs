//! Direct-mode worker: the agent runs as a child process of the daemon.

use std::io::Write;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use super::{StartError, StopError};

/// How long to wait for an exit when the prompt pipe is already closed.
const EXIT_PROBE: Duration = Duration::from_millis(500);

/// Agent child process with its stdin held open.
#[derive(Debug)]
pub struct DirectProcess {
    child: Child,
    // Dropping stdin would hand the agent EOF right after the prompt.
    stdin: Option<ChildStdin>,
}

impl DirectProcess {
    /// Spawn `command` in `workdir` and write `prompt` plus a newline to its stdin.
    pub fn spawn(
        command: &str,
        args: &[String],
        workdir: &Path,
        prompt: &str,
    ) -> Result<Self, StartError> {
        let mut child = Command::new(command)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let mut stdin = child.stdin.take();
        let delivered = match stdin.as_mut() {
            Some(pipe) => pipe
                .write_all(prompt.as_bytes())
                .and_then(|()| pipe.write_all(b"\n"))
                .and_then(|()| pipe.flush()),
            None => Err(std::io::Error::other("stdin was not piped")),
        };
        if let Err(err) = delivered {
            // An agent that already exited is left for reconciliation to
            // report; one that is alive but refuses input is a failed start.
            if matches!(child.wait_timeout(EXIT_PROBE), Ok(None)) {
                child.kill().ok();
                child.wait().ok();
                return Err(StartError::Spawn(err));
            }
            debug!(err = %err, "agent exited before reading its prompt");
        }

        debug!(pid = child.id(), "spawned agent process");
        Ok(Self { child, stdin })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking exit check. Returns `(success, details)` once the child
    /// has exited.
    pub fn poll_exit(&mut self) -> Option<(bool, String)> {
        match self.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => {
                let details = match status.code() {
                    Some(code) => format!("process exited with code {code}"),
                    None => format!("process terminated ({status})"),
                };
                Some((status.success(), details))
            }
            Err(err) => {
                warn!(pid = self.child.id(), err = %err, "exit status unavailable");
                Some((false, format!("exit status unavailable: {err}")))
            }
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    pub fn terminate(mut self, grace: Duration) -> Result<(), StopError> {
        drop(self.stdin.take());

        let pid = i32::try_from(self.child.id())
            .map_err(|_| StopError::Terminate(format!("pid {} out of range", self.child.id())))?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => return Err(StopError::Terminate(format!("SIGTERM: {errno}"))),
        }

        match self.child.wait_timeout(grace) {
            Ok(Some(status)) => {
                debug!(pid, %status, "agent exited after SIGTERM");
                Ok(())
            }
            Ok(None) => {
                warn!(pid, grace_secs = grace.as_secs(), "agent ignored SIGTERM, killing");
                self.force_kill()
            }
            Err(err) => {
                warn!(pid, err = %err, "wait after SIGTERM failed, killing");
                self.force_kill()
            }
        }
    }

    fn force_kill(&mut self) -> Result<(), StopError> {
        self.child
            .kill()
            .map_err(|err| StopError::Terminate(format!("SIGKILL: {err}")))?;
        self.child
            .wait()
            .map_err(|err| StopError::Terminate(format!("reap: {err}")))?;
        Ok(())
    }
}
