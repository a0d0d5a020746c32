//! Side-effecting adapters: config, feed, state file, processes and the worker.

pub mod config;
pub mod feed;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod state_store;
pub mod worker;
