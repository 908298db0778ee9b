//! agent-queue — autonomous task queue that drives a coding-agent CLI.
//!
//! The heartbeat alternates between assessing tasks (an LLM classification
//! call) and executing them (one agent subprocess per task, each in an
//! isolated git worktree, ending in a pull request for human review). All
//! state lives in the sqlite store; every change is mirrored onto the
//! event bus.

pub mod agent;
pub mod assess;
pub mod config;
pub mod engine;
pub mod events;
pub mod http;
pub mod rate_limit;
pub mod store;
pub mod vcs;
