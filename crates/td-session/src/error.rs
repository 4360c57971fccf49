use td_core::config::ConfigError;
use td_core::types::{ProcessState, TerminalId};
use thiserror::Error;

use crate::patterns::PatternError;

/// Errors returned across the session core's public boundary.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Every id in the pool is taken; wait for a disposal.
    #[error("terminal pool is at capacity ({max})")]
    CapacityExceeded { max: u16 },

    #[error("failed to spawn {shell}: {reason}")]
    SpawnFailed { shell: String, reason: String },

    #[error("terminal not found: {0}")]
    NotFound(TerminalId),

    /// Write attempted after the process left `Launching`/`Running`.
    #[error("terminal {id} is not running (state: {state})")]
    NotRunning { id: TerminalId, state: ProcessState },

    #[error("terminal {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: TerminalId,
        from: ProcessState,
        to: ProcessState,
    },

    #[error("pty error: {0}")]
    Pty(String),

    #[error("pty I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("detection patterns: {0}")]
    Pattern(#[from] PatternError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
