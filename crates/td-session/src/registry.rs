use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use td_core::types::{AgentStatus, ProcessState, TerminalId, TerminateReason};
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::snapshot::{Scrollback, TerminalSnapshot};
use crate::spawner::{PtyHandle, SpawnOptions};

// ---------------------------------------------------------------------------
// IdPool
// ---------------------------------------------------------------------------

/// Bounded pool of small integer ids `1..=capacity`, always handing out the
/// smallest free one.
#[derive(Debug, Clone)]
pub struct IdPool {
    capacity: u16,
    used: BTreeSet<u16>,
    ever_allocated: HashSet<u16>,
}

impl IdPool {
    pub fn new(capacity: u16) -> Self {
        Self {
            capacity,
            used: BTreeSet::new(),
            ever_allocated: HashSet::new(),
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }

    /// Take the smallest free id, or `None` when the pool is exhausted.
    pub fn allocate(&mut self) -> Option<TerminalId> {
        let id = (1..=self.capacity).find(|n| !self.used.contains(n))?;
        self.used.insert(id);
        self.ever_allocated.insert(id);
        Some(TerminalId(id))
    }

    /// Return an id to the pool. Returns `false` if it was not in use.
    pub fn release(&mut self, id: TerminalId) -> bool {
        self.used.remove(&id.0)
    }

    pub fn is_allocated(&self, id: TerminalId) -> bool {
        self.used.contains(&id.0)
    }

    /// Whether this id has been handed out at least once.
    pub fn was_allocated(&self, id: TerminalId) -> bool {
        self.ever_allocated.contains(&id.0)
    }
}

// ---------------------------------------------------------------------------
// TerminalInstance
// ---------------------------------------------------------------------------

/// Agent state of one terminal.
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub status: AgentStatus,
    /// Kept after disconnecting, for history/UI.
    pub agent_type: Option<String>,
    pub disconnected_at: Option<Instant>,
    /// Monotonic tie-break for equal `disconnected_at` values.
    pub disconnect_seq: u64,
}

/// One live terminal: its process handle plus everything the core tracks
/// about it.
#[derive(Debug)]
pub struct TerminalInstance {
    pub id: TerminalId,
    /// Registry-wide creation counter; distinguishes reuses of the same id.
    pub generation: u64,
    pub process_state: ProcessState,
    pub exit_code: Option<u32>,
    /// Set once the exit of the process has been observed (or assumed).
    pub exit_confirmed: bool,
    pub kill_reason: Option<TerminateReason>,
    pub created_at: DateTime<Utc>,
    /// Launch options; `cols`/`rows` track the current size.
    pub options: SpawnOptions,
    pub agent: AgentState,
    pub scrollback: Scrollback,
    pub(crate) process: Option<Arc<PtyHandle>>,
}

impl TerminalInstance {
    pub fn cwd(&self) -> Option<&str> {
        self.options.cwd.as_deref()
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    pub fn snapshot(&self) -> TerminalSnapshot {
        TerminalSnapshot {
            id: self.id,
            options: self.options.clone(),
            created_at: self.created_at,
            process_state: self.process_state,
            agent_status: self.agent.status,
            agent_type: self.agent.agent_type.clone(),
            recent_output: self.scrollback.as_str().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// TerminalRegistry
// ---------------------------------------------------------------------------

/// Arena of terminals keyed by pool id, plus the single active-agent slot.
#[derive(Debug)]
pub struct TerminalRegistry {
    pool: IdPool,
    terminals: BTreeMap<TerminalId, TerminalInstance>,
    next_generation: u64,
    active_agent: Option<TerminalId>,
    scrollback_bytes: usize,
}

impl TerminalRegistry {
    pub fn new(capacity: u16, scrollback_bytes: usize) -> Self {
        info!(capacity, "creating TerminalRegistry");
        Self {
            pool: IdPool::new(capacity),
            terminals: BTreeMap::new(),
            next_generation: 1,
            active_agent: None,
            scrollback_bytes,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.pool.capacity()
    }

    pub fn len(&self) -> usize {
        self.terminals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terminals.is_empty()
    }

    /// Allocate the smallest free id and register a new terminal in
    /// `Launching`.
    pub fn create(&mut self, options: SpawnOptions) -> Result<&TerminalInstance> {
        let id = self.pool.allocate().ok_or(SessionError::CapacityExceeded {
            max: self.pool.capacity(),
        })?;
        let generation = self.next_generation;
        self.next_generation += 1;

        let instance = TerminalInstance {
            id,
            generation,
            process_state: ProcessState::Launching,
            exit_code: None,
            exit_confirmed: false,
            kill_reason: None,
            created_at: Utc::now(),
            options,
            agent: AgentState::default(),
            scrollback: Scrollback::new(self.scrollback_bytes),
            process: None,
        };
        debug!(terminal_id = %id, generation, "terminal registered");
        Ok(self.terminals.entry(id).or_insert(instance))
    }

    /// Return the id to the pool. Only allowed once the process is in a
    /// terminal state.
    pub fn release(&mut self, id: TerminalId) -> Result<TerminalInstance> {
        match self.terminals.get(&id) {
            Some(t) if t.process_state.is_terminal() => {}
            Some(t) => {
                warn!(terminal_id = %id, state = %t.process_state, "release refused: process still live");
                return Err(SessionError::NotFound(id));
            }
            None => return Err(SessionError::NotFound(id)),
        }
        let instance = self
            .terminals
            .remove(&id)
            .ok_or(SessionError::NotFound(id))?;
        self.pool.release(id);
        if self.active_agent == Some(id) {
            self.active_agent = None;
        }
        info!(terminal_id = %id, "terminal released");
        Ok(instance)
    }

    /// Drop a terminal whose process never started, regardless of state.
    pub(crate) fn discard(&mut self, id: TerminalId) -> Option<TerminalInstance> {
        let instance = self.terminals.remove(&id)?;
        self.pool.release(id);
        if self.active_agent == Some(id) {
            self.active_agent = None;
        }
        debug!(terminal_id = %id, "terminal discarded");
        Some(instance)
    }

    pub fn lookup(&self, id: TerminalId) -> Result<&TerminalInstance> {
        self.terminals.get(&id).ok_or(SessionError::NotFound(id))
    }

    pub fn lookup_mut(&mut self, id: TerminalId) -> Result<&mut TerminalInstance> {
        self.terminals.get_mut(&id).ok_or(SessionError::NotFound(id))
    }

    /// Whether `id` is live and still the same terminal that `generation`
    /// refers to.
    pub fn is_current(&self, id: TerminalId, generation: u64) -> bool {
        self.terminals
            .get(&id)
            .is_some_and(|t| t.generation == generation)
    }

    /// Live terminals in ascending id order.
    pub fn list(&self) -> Vec<&TerminalInstance> {
        self.terminals.values().collect()
    }

    pub fn ids(&self) -> Vec<TerminalId> {
        self.terminals.keys().copied().collect()
    }

    pub(crate) fn terminals_mut(&mut self) -> impl Iterator<Item = &mut TerminalInstance> {
        self.terminals.values_mut()
    }

    /// Give a terminal a fresh generation so tasks bound to the old one go stale.
    pub(crate) fn bump_generation(&mut self, id: TerminalId) -> Result<u64> {
        let generation = self.next_generation;
        let instance = self.terminals.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        self.next_generation += 1;
        instance.generation = generation;
        Ok(generation)
    }

    pub fn was_allocated(&self, id: TerminalId) -> bool {
        self.pool.was_allocated(id)
    }

    /// The terminal currently holding the `Connected` agent, if any.
    pub fn active_agent(&self) -> Option<TerminalId> {
        self.active_agent
    }

    pub(crate) fn set_active_agent(&mut self, id: Option<TerminalId>) {
        self.active_agent = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> SpawnOptions {
        SpawnOptions::new("/bin/sh")
    }

    fn finish(reg: &mut TerminalRegistry, id: TerminalId) {
        reg.lookup_mut(id).unwrap().process_state = ProcessState::Exited;
    }

    #[test]
    fn pool_hands_out_smallest_free_id() {
        let mut pool = IdPool::new(3);
        assert_eq!(pool.allocate(), Some(TerminalId(1)));
        assert_eq!(pool.allocate(), Some(TerminalId(2)));
        assert_eq!(pool.allocate(), Some(TerminalId(3)));
        assert_eq!(pool.allocate(), None);
        assert!(pool.release(TerminalId(2)));
        assert!(!pool.release(TerminalId(2)));
        assert_eq!(pool.allocate(), Some(TerminalId(2)));
    }

    #[test]
    fn pool_remembers_allocation_history() {
        let mut pool = IdPool::new(3);
        let id = pool.allocate().unwrap();
        pool.release(id);
        assert!(!pool.is_allocated(id));
        assert!(pool.was_allocated(id));
        assert!(!pool.was_allocated(TerminalId(3)));
    }

    #[test]
    fn create_starts_in_launching() {
        let mut reg = TerminalRegistry::new(5, 1024);
        let t = reg.create(opts()).unwrap();
        assert_eq!(t.id, TerminalId(1));
        assert_eq!(t.process_state, ProcessState::Launching);
        assert_eq!(t.agent.status, AgentStatus::None);
        assert!(!t.has_process());
    }

    #[test]
    fn create_fails_when_full() {
        let mut reg = TerminalRegistry::new(2, 1024);
        reg.create(opts()).unwrap();
        reg.create(opts()).unwrap();
        match reg.create(opts()) {
            Err(SessionError::CapacityExceeded { max }) => assert_eq!(max, 2),
            other => panic!("expected CapacityExceeded, got: {other:?}"),
        }
    }

    #[test]
    fn disposed_id_is_reused_first() {
        let mut reg = TerminalRegistry::new(5, 1024);
        for _ in 0..3 {
            reg.create(opts()).unwrap();
        }
        finish(&mut reg, TerminalId(2));
        reg.release(TerminalId(2)).unwrap();
        assert_eq!(reg.create(opts()).unwrap().id, TerminalId(2));
        assert_eq!(reg.create(opts()).unwrap().id, TerminalId(4));
    }

    #[test]
    fn reuse_gets_a_new_generation() {
        let mut reg = TerminalRegistry::new(5, 1024);
        let first = reg.create(opts()).unwrap().generation;
        finish(&mut reg, TerminalId(1));
        reg.release(TerminalId(1)).unwrap();
        let second = reg.create(opts()).unwrap().generation;
        assert_ne!(first, second);
        assert!(reg.is_current(TerminalId(1), second));
        assert!(!reg.is_current(TerminalId(1), first));
    }

    #[test]
    fn release_requires_terminal_state() {
        let mut reg = TerminalRegistry::new(5, 1024);
        let id = reg.create(opts()).unwrap().id;
        assert!(matches!(reg.release(id), Err(SessionError::NotFound(_))));
        finish(&mut reg, id);
        assert!(reg.release(id).is_ok());
        assert!(matches!(reg.release(id), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn lookup_unknown_is_not_found() {
        let reg = TerminalRegistry::new(5, 1024);
        match reg.lookup(TerminalId(4)) {
            Err(SessionError::NotFound(id)) => assert_eq!(id, TerminalId(4)),
            other => panic!("expected NotFound, got: {other:?}"),
        }
    }

    #[test]
    fn release_clears_active_agent_slot() {
        let mut reg = TerminalRegistry::new(5, 1024);
        let id = reg.create(opts()).unwrap().id;
        reg.set_active_agent(Some(id));
        finish(&mut reg, id);
        reg.release(id).unwrap();
        assert_eq!(reg.active_agent(), None);
    }

    #[test]
    fn live_ids_stay_unique_and_bounded() {
        let mut reg = TerminalRegistry::new(4, 1024);
        // Deterministic create/dispose interleaving.
        let script = [true, true, false, true, true, true, false, false, true, true];
        let mut victim = 1u16;
        for create in script {
            if create {
                let _ = reg.create(opts());
            } else {
                let id = TerminalId(victim);
                if reg.lookup(id).is_ok() {
                    finish(&mut reg, id);
                    reg.release(id).unwrap();
                }
                victim = victim % 4 + 1;
            }
            let ids = reg.ids();
            let unique: BTreeSet<_> = ids.iter().collect();
            assert_eq!(unique.len(), ids.len());
            assert!(ids.iter().all(|id| (1..=4).contains(&id.0)));
        }
    }
}
