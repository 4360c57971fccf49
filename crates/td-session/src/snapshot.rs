use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use td_core::types::{AgentStatus, ProcessState, TerminalId};

use crate::spawner::SpawnOptions;

/// Terminal description handed to the persistence collaborator, and accepted
/// back by `SessionOrchestrator::restore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSnapshot {
    pub id: TerminalId,
    pub options: SpawnOptions,
    pub created_at: DateTime<Utc>,
    pub process_state: ProcessState,
    pub agent_status: AgentStatus,
    pub agent_type: Option<String>,
    /// Bounded tail of the terminal's recent output.
    pub recent_output: String,
}

impl TerminalSnapshot {
    pub fn cwd(&self) -> Option<&str> {
        self.options.cwd.as_deref()
    }
}

/// Byte-bounded tail of a terminal's output, kept for snapshots.
#[derive(Debug, Clone, Default)]
pub struct Scrollback {
    text: String,
    max_bytes: usize,
}

impl Scrollback {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            text: String::new(),
            max_bytes,
        }
    }

    /// Append output, dropping the oldest text beyond the bound. The cut is
    /// moved forward to a char boundary so the tail stays valid UTF-8.
    pub fn push(&mut self, data: &str) {
        if self.max_bytes == 0 {
            return;
        }
        self.text.push_str(data);
        if self.text.len() > self.max_bytes {
            let mut cut = self.text.len() - self.max_bytes;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_tail() {
        let mut sb = Scrollback::new(5);
        sb.push("abc");
        sb.push("defgh");
        assert_eq!(sb.as_str(), "defgh");
        sb.push("ij");
        assert_eq!(sb.as_str(), "fghij");
    }

    #[test]
    fn cut_lands_on_char_boundary() {
        let mut sb = Scrollback::new(4);
        sb.push("aé€");
        // "é" is 2 bytes, "€" is 3; keeping 4 bytes would split "é".
        assert!(sb.len() <= 4);
        assert_eq!(sb.as_str(), "€");
    }

    #[test]
    fn zero_bound_keeps_nothing() {
        let mut sb = Scrollback::new(0);
        sb.push("hello");
        assert!(sb.is_empty());
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let snap = TerminalSnapshot {
            id: TerminalId(3),
            options: SpawnOptions::new("/bin/sh").cwd("/tmp"),
            created_at: Utc::now(),
            process_state: ProcessState::Running,
            agent_status: AgentStatus::Disconnected,
            agent_type: Some("codex".into()),
            recent_output: "$ ls\n".into(),
        };
        let json = serde_json::to_string(&snap).unwrap();
        let back: TerminalSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.cwd(), Some("/tmp"));
    }
}
