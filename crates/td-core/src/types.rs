use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// TerminalId
// ---------------------------------------------------------------------------

/// Small integer identifier of a terminal, drawn from the bounded pool `1..=N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminalId(pub u16);

impl TerminalId {
    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for TerminalId {
    fn from(value: u16) -> Self {
        TerminalId(value)
    }
}

// ---------------------------------------------------------------------------
// ProcessState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Launching,
    Running,
    Exited,
    KilledByUser,
    KilledByHost,
}

impl ProcessState {
    /// Exit states are terminal: nothing moves out of them except a reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Exited | ProcessState::KilledByUser | ProcessState::KilledByHost
        )
    }

    /// Input may only be written while the process is launching or running.
    pub fn accepts_input(&self) -> bool {
        matches!(self, ProcessState::Launching | ProcessState::Running)
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &ProcessState) -> bool {
        matches!(
            (self, target),
            (ProcessState::Launching, ProcessState::Running)
                | (ProcessState::Launching, ProcessState::Exited)
                | (ProcessState::Launching, ProcessState::KilledByUser)
                | (ProcessState::Launching, ProcessState::KilledByHost)
                | (ProcessState::Running, ProcessState::Exited)
                | (ProcessState::Running, ProcessState::KilledByUser)
                | (ProcessState::Running, ProcessState::KilledByHost)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessState::Launching => "Launching",
            ProcessState::Running => "Running",
            ProcessState::Exited => "Exited",
            ProcessState::KilledByUser => "KilledByUser",
            ProcessState::KilledByHost => "KilledByHost",
        };
        write!(f, "{}", label)
    }
}

/// Who asked for a process to be torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateReason {
    /// The owning application closed the terminal.
    User,
    /// The host forced the teardown (e.g. resource pressure).
    Host,
}

impl TerminateReason {
    pub fn target_state(self) -> ProcessState {
        match self {
            TerminateReason::User => ProcessState::KilledByUser,
            TerminateReason::Host => ProcessState::KilledByHost,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentStatus
// ---------------------------------------------------------------------------

/// Per-terminal CLI agent state. At most one terminal registry-wide is
/// `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    None,
    Connected,
    Disconnected,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::None => "None",
            AgentStatus::Connected => "Connected",
            AgentStatus::Disconnected => "Disconnected",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// SessionEvent
// ---------------------------------------------------------------------------

/// Everything the core reports to its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        terminal_id: TerminalId,
        from: ProcessState,
        to: ProcessState,
    },
    Exited {
        terminal_id: TerminalId,
        state: ProcessState,
        exit_code: Option<u32>,
    },
    OutputBatch {
        terminal_id: TerminalId,
        data: String,
    },
    AgentStateChanged {
        terminal_id: TerminalId,
        from: AgentStatus,
        to: AgentStatus,
        agent_type: Option<String>,
    },
    /// Diagnostic only: the queue overflowed and was force-flushed.
    Overflow {
        terminal_id: TerminalId,
        queued: usize,
        overflow_count: u64,
    },
    /// Scrollback handed back to the renderer when a terminal is restored.
    ScrollbackRestored {
        terminal_id: TerminalId,
        data: String,
    },
    Disposed {
        terminal_id: TerminalId,
    },
}

impl SessionEvent {
    pub fn terminal_id(&self) -> TerminalId {
        match self {
            SessionEvent::StateChanged { terminal_id, .. }
            | SessionEvent::Exited { terminal_id, .. }
            | SessionEvent::OutputBatch { terminal_id, .. }
            | SessionEvent::AgentStateChanged { terminal_id, .. }
            | SessionEvent::Overflow { terminal_id, .. }
            | SessionEvent::ScrollbackRestored { terminal_id, .. }
            | SessionEvent::Disposed { terminal_id } => *terminal_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_state_moves_forward_only() {
        assert!(ProcessState::Launching.can_transition_to(&ProcessState::Running));
        assert!(ProcessState::Running.can_transition_to(&ProcessState::Exited));
        assert!(!ProcessState::Running.can_transition_to(&ProcessState::Launching));
        assert!(!ProcessState::Exited.can_transition_to(&ProcessState::Running));
        assert!(!ProcessState::KilledByUser.can_transition_to(&ProcessState::KilledByHost));
    }

    #[test]
    fn exit_states_are_terminal() {
        assert!(!ProcessState::Launching.is_terminal());
        assert!(!ProcessState::Running.is_terminal());
        assert!(ProcessState::Exited.is_terminal());
        assert!(ProcessState::KilledByUser.is_terminal());
        assert!(ProcessState::KilledByHost.is_terminal());
    }

    #[test]
    fn session_event_serializes_with_type_tag() {
        let ev = SessionEvent::AgentStateChanged {
            terminal_id: TerminalId(2),
            from: AgentStatus::None,
            to: AgentStatus::Connected,
            agent_type: Some("claude".into()),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "agent_state_changed");
        assert_eq!(json["terminal_id"], 2);
        assert_eq!(json["to"], "connected");
        assert_eq!(ev.terminal_id(), TerminalId(2));
    }
}
