//! Terminal session orchestration for termdeck.
//!
//! This crate runs a bounded set of PTY-backed shells, paces their output for
//! a rendering surface, and tracks which terminal (if any) currently hosts an
//! interactive CLI agent.
//!
//! Key components:
//! - `spawner`: PTY creation behind the `ProcessSpawner` seam (`portable-pty`)
//! - `registry`: terminal arena and the smallest-free id pool
//! - `lifecycle`: per-terminal process state machine
//! - `buffer`: per-terminal output queues with an adaptive flush interval
//! - `patterns` / `detection`: tiered agent signatures and the single-active-agent state machine
//! - `orchestrator`: the façade collaborators talk to, plus the event feed
//! - `snapshot`: descriptions handed to a persistence collaborator

pub mod buffer;
pub mod detection;
pub mod error;
pub mod event_bus;
pub mod lifecycle;
pub mod orchestrator;
pub mod patterns;
pub mod registry;
pub mod snapshot;
pub mod spawner;

pub use error::{Result, SessionError};
pub use orchestrator::{SessionOrchestrator, TerminalState};
