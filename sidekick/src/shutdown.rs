//! Shutdown flag with an interruptible wait, plus the SIGINT/SIGTERM listener.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, Signal};
use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

#[derive(Debug, Default)]
struct Inner {
    requested: Mutex<bool>,
    wake: Condvar,
}

/// Cloneable handle to a one-way shutdown flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter.
    pub fn request(&self) {
        let mut requested = self.inner.requested.lock();
        *requested = true;
        self.inner.wake.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.inner.requested.lock()
    }

    /// Sleep for up to `timeout`, returning early on shutdown.
    ///
    /// Returns true if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut requested = self.inner.requested.lock();
        while !*requested {
            if self
                .inner
                .wake
                .wait_until(&mut requested, deadline)
                .timed_out()
            {
                break;
            }
        }
        *requested
    }
}

/// Route SIGINT and SIGTERM to `signal` through a dedicated listener thread.
///
/// The signals are blocked on the calling thread, and every thread spawned
/// afterwards inherits the mask, so call this before starting any other
/// thread (including the log writer).
pub fn install_signal_listener(signal: ShutdownSignal) -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block()
        .context("block SIGINT/SIGTERM on the main thread")?;

    thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || {
            loop {
                match set.wait() {
                    Ok(received) => {
                        info!(signal = %received, "shutdown requested");
                        signal.request();
                    }
                    Err(errno) => {
                        error!(err = %errno, "signal listener failed");
                        return;
                    }
                }
            }
        })
        .context("spawn signal listener")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_times_out_without_request() {
        let signal = ShutdownSignal::new();
        let started = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(!signal.is_requested());
    }

    #[test]
    fn request_wakes_waiter_early() {
        let signal = ShutdownSignal::new();
        let trigger = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.request();
        });

        let started = Instant::now();
        assert!(signal.wait_timeout(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(10));
        handle.join().expect("join");
    }

    #[test]
    fn request_is_sticky() {
        let signal = ShutdownSignal::new();
        signal.request();
        assert!(signal.is_requested());
        assert!(signal.wait_timeout(Duration::from_secs(30)));
    }
}
