//! Single-agent work orchestrator.
//!
//! Keeps one external coding agent busy on the most urgent ready project from
//! a prioritized feed, preempting it when something strictly more urgent
//! becomes ready. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (project model, selection,
//!   preemption). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (config, feed, state file, worker
//!   processes and tmux sessions). Behind traits where tests need doubles.
//!
//! [`orchestrator`] coordinates the two in a polling loop; [`shutdown`]
//! provides the cancellable wait it sleeps on.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod shutdown;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
