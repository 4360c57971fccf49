use std::collections::HashMap;
use std::time::{Duration, Instant};

use td_core::config::DetectionConfig;
use td_core::types::{AgentStatus, SessionEvent, TerminalId};
use tracing::{debug, info};

use crate::error::Result;
use crate::event_bus::EventBus;
use crate::patterns::{Detection, PatternError, PatternMatcher};
use crate::registry::TerminalRegistry;

const COMPONENT: &str = "detection";

/// Longest partially typed line kept per terminal.
const MAX_LINE_LEN: usize = 4096;

/// Keyword hits further apart than this do not add up.
const KEYWORD_WINDOW: Duration = Duration::from_secs(30);

/// What moved a terminal's agent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    /// A startup signature (command, banner, or enough keyword evidence).
    Detected,
    /// The shell prompt came back on the active terminal.
    PromptReturn,
    /// Another terminal took the active slot.
    Demoted,
    /// Picked up the active slot after its holder went away.
    Promoted,
    Cleared,
    ProcessExit,
    Disposed,
}

/// One agent-state change, as published on the event feed.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTransition {
    pub terminal_id: TerminalId,
    pub from: AgentStatus,
    pub to: AgentStatus,
    pub agent_type: Option<String>,
    pub cause: TransitionCause,
}

impl AgentTransition {
    pub fn to_event(&self) -> SessionEvent {
        SessionEvent::AgentStateChanged {
            terminal_id: self.terminal_id,
            from: self.from,
            to: self.to,
            agent_type: self.agent_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Evidence {
    total: f64,
    last_at: Instant,
}

#[derive(Debug, Default)]
struct Scratch {
    line: String,
    /// Keyword evidence per agent. Reset on connect and on a returned
    /// prompt; expires after `KEYWORD_WINDOW` without a new hit.
    evidence: HashMap<String, Evidence>,
}

/// Per-terminal agent state machine over `None`/`Connected`/`Disconnected`,
/// holding the registry-wide single active slot.
///
/// ```text
/// None ──signature──> Connected ──prompt──> Disconnected
///                        ^                      │
///                        └─signature/promotion──┘
/// any ──clear_detection──> None
/// ```
///
/// Every operation returns the transitions it caused, in order, after
/// publishing them as `AgentStateChanged`.
#[derive(Debug)]
pub struct CliAgentDetectionEngine {
    matcher: PatternMatcher,
    min_confidence: f64,
    scratch: HashMap<TerminalId, Scratch>,
    disconnect_seq: u64,
    bus: EventBus,
}

impl CliAgentDetectionEngine {
    pub fn new(config: &DetectionConfig, bus: EventBus) -> std::result::Result<Self, PatternError> {
        Ok(Self {
            matcher: PatternMatcher::from_config(config)?,
            min_confidence: config.min_confidence,
            scratch: HashMap::new(),
            disconnect_seq: 0,
            bus,
        })
    }

    pub fn matcher(&self) -> &PatternMatcher {
        &self.matcher
    }

    /// Inspect raw input before it reaches the process. Completed lines are
    /// classified against launch commands.
    pub fn on_input(
        &mut self,
        registry: &mut TerminalRegistry,
        id: TerminalId,
        data: &str,
    ) -> Vec<AgentTransition> {
        let mut out = Vec::new();
        if registry.lookup(id).is_err() {
            debug!(component = COMPONENT, terminal_id = %id, "input for unknown terminal ignored");
            return out;
        }

        let mut completed = Vec::new();
        let scratch = self.scratch.entry(id).or_default();
        for c in data.chars() {
            match c {
                '\r' | '\n' => completed.push(std::mem::take(&mut scratch.line)),
                '\x7f' | '\x08' => {
                    scratch.line.pop();
                }
                '\x03' | '\x15' => scratch.line.clear(),
                c if c.is_control() => {}
                c if scratch.line.len() < MAX_LINE_LEN => scratch.line.push(c),
                _ => {}
            }
        }

        for line in completed {
            if let Some(detection) = self.matcher.classify_input_line(&line) {
                debug!(component = COMPONENT, terminal_id = %id, agent = %detection.agent, "launch command typed");
                self.connect(registry, id, detection, &mut out);
            }
        }
        self.publish(&out);
        out
    }

    /// Inspect one flushed output batch.
    pub fn on_output(
        &mut self,
        registry: &mut TerminalRegistry,
        id: TerminalId,
        text: &str,
    ) -> Vec<AgentTransition> {
        self.observe_output(registry, id, text, Instant::now())
    }

    fn observe_output(
        &mut self,
        registry: &mut TerminalRegistry,
        id: TerminalId,
        text: &str,
        now: Instant,
    ) -> Vec<AgentTransition> {
        let mut out = Vec::new();
        let Ok(status) = registry.lookup(id).map(|t| t.agent.status) else {
            return out;
        };

        let mut connected_now = false;
        if let Some(detection) = self.matcher.classify_output(text) {
            if detection.tier.is_high() {
                connected_now = self.connect(registry, id, detection, &mut out);
            } else if status != AgentStatus::Connected {
                let total = self.add_evidence(id, &detection, now);
                debug!(component = COMPONENT, terminal_id = %id, agent = %detection.agent, total, "keyword evidence");
                if total >= self.min_confidence {
                    match registry.active_agent().filter(|active| *active != id) {
                        // Weak evidence never takes the slot from a live agent.
                        Some(active) => debug!(
                            component = COMPONENT,
                            terminal_id = %id,
                            active = %active,
                            "keyword threshold reached while another terminal holds the agent, ignored"
                        ),
                        None => connected_now = self.connect(registry, id, detection, &mut out),
                    }
                }
            }
        }

        let prompt = self.matcher.is_prompt_return(text);
        if prompt && !connected_now {
            if let Some(scratch) = self.scratch.get_mut(&id) {
                scratch.evidence.clear();
            }
        }
        let still_active = registry.active_agent() == Some(id);
        if !connected_now && still_active && prompt {
            self.disconnect(registry, id, TransitionCause::PromptReturn, &mut out);
            self.promote(registry, Some(id), &mut out);
        }
        self.publish(&out);
        out
    }

    /// Add one keyword hit and return the agent's running total. Hits
    /// older than `KEYWORD_WINDOW` are forgotten first.
    fn add_evidence(&mut self, id: TerminalId, detection: &Detection, now: Instant) -> f64 {
        let scratch = self.scratch.entry(id).or_default();
        let entry = scratch
            .evidence
            .entry(detection.agent.clone())
            .or_insert(Evidence { total: 0.0, last_at: now });
        if now.saturating_duration_since(entry.last_at) > KEYWORD_WINDOW {
            entry.total = 0.0;
        }
        entry.total += detection.confidence;
        entry.last_at = now;
        entry.total
    }

    /// Explicit recovery: return a terminal to `None` whatever its state.
    pub fn clear_detection(
        &mut self,
        registry: &mut TerminalRegistry,
        id: TerminalId,
    ) -> Result<Vec<AgentTransition>> {
        let mut out = Vec::new();
        let was_active = registry.active_agent() == Some(id);
        let instance = registry.lookup_mut(id)?;
        let from = instance.agent.status;
        instance.agent = Default::default();
        self.scratch.remove(&id);
        if from != AgentStatus::None {
            out.push(AgentTransition {
                terminal_id: id,
                from,
                to: AgentStatus::None,
                agent_type: None,
                cause: TransitionCause::Cleared,
            });
        }
        if was_active {
            registry.set_active_agent(None);
            self.promote(registry, Some(id), &mut out);
        }
        info!(component = COMPONENT, terminal_id = %id, %from, "detection cleared");
        self.publish(&out);
        Ok(out)
    }

    /// The terminal is being disposed: stop tracking it and hand the active
    /// slot on if it held it.
    pub fn forget(&mut self, registry: &mut TerminalRegistry, id: TerminalId) -> Vec<AgentTransition> {
        let mut out = Vec::new();
        self.scratch.remove(&id);
        let was_active = registry.active_agent() == Some(id);
        if let Ok(instance) = registry.lookup_mut(id) {
            let from = instance.agent.status;
            let agent_type = instance.agent.agent_type.clone();
            instance.agent = Default::default();
            if from != AgentStatus::None {
                out.push(AgentTransition {
                    terminal_id: id,
                    from,
                    to: AgentStatus::None,
                    agent_type,
                    cause: TransitionCause::Disposed,
                });
            }
        }
        if was_active {
            registry.set_active_agent(None);
            self.promote(registry, Some(id), &mut out);
        }
        self.publish(&out);
        out
    }

    /// The terminal's process ended; a connected agent there is gone.
    pub fn on_process_exit(
        &mut self,
        registry: &mut TerminalRegistry,
        id: TerminalId,
    ) -> Vec<AgentTransition> {
        let mut out = Vec::new();
        if let Some(scratch) = self.scratch.get_mut(&id) {
            scratch.line.clear();
        }
        if registry.active_agent() == Some(id) {
            self.disconnect(registry, id, TransitionCause::ProcessExit, &mut out);
            self.promote(registry, Some(id), &mut out);
        }
        self.publish(&out);
        out
    }

    /// Returns whether the terminal moved into `Connected`.
    fn connect(
        &mut self,
        registry: &mut TerminalRegistry,
        id: TerminalId,
        detection: Detection,
        out: &mut Vec<AgentTransition>,
    ) -> bool {
        let Ok(instance) = registry.lookup_mut(id) else {
            return false;
        };
        let from = instance.agent.status;

        if from == AgentStatus::Connected {
            if detection.tier.is_high() && instance.agent.agent_type.as_deref() != Some(detection.agent.as_str()) {
                instance.agent.agent_type = Some(detection.agent.clone());
                info!(component = COMPONENT, terminal_id = %id, agent = %detection.agent, "agent type changed");
                out.push(AgentTransition {
                    terminal_id: id,
                    from,
                    to: AgentStatus::Connected,
                    agent_type: Some(detection.agent),
                    cause: TransitionCause::Detected,
                });
            }
            return false;
        }

        if let Some(previous) = registry.active_agent().filter(|prev| *prev != id) {
            self.disconnect(registry, previous, TransitionCause::Demoted, out);
        }

        let Ok(instance) = registry.lookup_mut(id) else {
            return false;
        };
        instance.agent.status = AgentStatus::Connected;
        instance.agent.agent_type = Some(detection.agent.clone());
        instance.agent.disconnected_at = None;
        registry.set_active_agent(Some(id));
        if let Some(scratch) = self.scratch.get_mut(&id) {
            scratch.evidence.clear();
        }

        info!(
            component = COMPONENT,
            terminal_id = %id,
            agent = %detection.agent,
            tier = ?detection.tier,
            confidence = detection.confidence,
            %from,
            "agent connected"
        );
        out.push(AgentTransition {
            terminal_id: id,
            from,
            to: AgentStatus::Connected,
            agent_type: Some(detection.agent),
            cause: TransitionCause::Detected,
        });
        true
    }

    fn disconnect(
        &mut self,
        registry: &mut TerminalRegistry,
        id: TerminalId,
        cause: TransitionCause,
        out: &mut Vec<AgentTransition>,
    ) {
        self.disconnect_seq += 1;
        let seq = self.disconnect_seq;
        let Ok(instance) = registry.lookup_mut(id) else {
            return;
        };
        if instance.agent.status != AgentStatus::Connected {
            return;
        }
        instance.agent.status = AgentStatus::Disconnected;
        instance.agent.disconnected_at = Some(Instant::now());
        instance.agent.disconnect_seq = seq;
        let agent_type = instance.agent.agent_type.clone();
        if registry.active_agent() == Some(id) {
            registry.set_active_agent(None);
        }
        info!(component = COMPONENT, terminal_id = %id, ?cause, agent = ?agent_type, "agent disconnected");
        out.push(AgentTransition {
            terminal_id: id,
            from: AgentStatus::Connected,
            to: AgentStatus::Disconnected,
            agent_type,
            cause,
        });
    }

    /// Fill an empty active slot with the most recently disconnected
    /// terminal whose process is still alive.
    fn promote(
        &mut self,
        registry: &mut TerminalRegistry,
        exclude: Option<TerminalId>,
        out: &mut Vec<AgentTransition>,
    ) -> Option<TerminalId> {
        if registry.active_agent().is_some() {
            return None;
        }
        let candidate = registry
            .list()
            .into_iter()
            .filter(|t| Some(t.id) != exclude)
            .filter(|t| t.agent.status == AgentStatus::Disconnected)
            .filter(|t| !t.process_state.is_terminal())
            .max_by_key(|t| (t.agent.disconnected_at, t.agent.disconnect_seq))
            .map(|t| t.id);

        let Some(id) = candidate else {
            debug!(component = COMPONENT, "no disconnected terminal to promote, active slot empty");
            return None;
        };
        let instance = registry.lookup_mut(id).ok()?;
        instance.agent.status = AgentStatus::Connected;
        instance.agent.disconnected_at = None;
        let agent_type = instance.agent.agent_type.clone();
        registry.set_active_agent(Some(id));
        info!(component = COMPONENT, terminal_id = %id, agent = ?agent_type, "agent promoted");
        out.push(AgentTransition {
            terminal_id: id,
            from: AgentStatus::Disconnected,
            to: AgentStatus::Connected,
            agent_type,
            cause: TransitionCause::Promoted,
        });
        Some(id)
    }

    fn publish(&self, transitions: &[AgentTransition]) {
        for transition in transitions {
            self.bus.publish(transition.to_event());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::SpawnOptions;
    use td_core::config::AgentSignature;
    use td_core::types::ProcessState;

    fn config() -> DetectionConfig {
        let mut cfg = DetectionConfig::default();
        cfg.agents.push(AgentSignature {
            name: "X".into(),
            commands: vec!["start-agent-x".into()],
            banners: vec![r"^Agent X v\d+".into()],
            keywords: vec!["agentx".into()],
        });
        cfg
    }

    fn setup(terminals: usize) -> (CliAgentDetectionEngine, TerminalRegistry, EventBus) {
        let bus = EventBus::new();
        let engine = CliAgentDetectionEngine::new(&config(), bus.clone()).unwrap();
        let mut reg = TerminalRegistry::new(5, 1024);
        for _ in 0..terminals {
            reg.create(SpawnOptions::new("/bin/sh")).unwrap();
        }
        (engine, reg, bus)
    }

    fn status(reg: &TerminalRegistry, id: u16) -> AgentStatus {
        reg.lookup(TerminalId(id)).unwrap().agent.status
    }

    fn connected_count(reg: &TerminalRegistry) -> usize {
        reg.list()
            .iter()
            .filter(|t| t.agent.status == AgentStatus::Connected)
            .count()
    }

    #[test]
    fn typed_command_connects() {
        let (mut engine, mut reg, bus) = setup(1);
        let rx = bus.subscribe();
        let t1 = TerminalId(1);

        assert!(engine.on_input(&mut reg, t1, "start-").is_empty());
        let out = engine.on_input(&mut reg, t1, "agent-x\r");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, AgentStatus::Connected);
        assert_eq!(out[0].agent_type.as_deref(), Some("X"));
        assert_eq!(reg.active_agent(), Some(t1));
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::AgentStateChanged {
                terminal_id: t1,
                from: AgentStatus::None,
                to: AgentStatus::Connected,
                agent_type: Some("X".into()),
            }
        );
    }

    #[test]
    fn line_editing_is_respected() {
        let (mut engine, mut reg, _bus) = setup(1);
        let t1 = TerminalId(1);
        assert!(engine.on_input(&mut reg, t1, "claudx\x7fe\x03\n").is_empty());
        assert!(engine.on_input(&mut reg, t1, "ls\x15claude\n").len() == 1);
        assert_eq!(reg.lookup(t1).unwrap().agent.agent_type.as_deref(), Some("claude"));
    }

    #[test]
    fn prompt_return_disconnects_and_keeps_type() {
        let (mut engine, mut reg, _bus) = setup(1);
        let t1 = TerminalId(1);
        engine.on_input(&mut reg, t1, "start-agent-x\n");
        let out = engine.on_output(&mut reg, t1, "bye\r\nme@box:~$ ");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cause, TransitionCause::PromptReturn);
        assert_eq!(status(&reg, 1), AgentStatus::Disconnected);
        assert_eq!(reg.lookup(t1).unwrap().agent.agent_type.as_deref(), Some("X"));
        assert_eq!(reg.active_agent(), None);
    }

    #[test]
    fn prompt_in_connecting_batch_is_ignored() {
        let (mut engine, mut reg, _bus) = setup(1);
        let t1 = TerminalId(1);
        let out = engine.on_output(&mut reg, t1, "Agent X v2 ready\n$ ");
        assert_eq!(out.len(), 1);
        assert_eq!(status(&reg, 1), AgentStatus::Connected);
    }

    #[test]
    fn prompt_on_inactive_terminal_does_nothing() {
        let (mut engine, mut reg, _bus) = setup(2);
        engine.on_input(&mut reg, TerminalId(1), "codex\n");
        engine.on_output(&mut reg, TerminalId(1), "$ ");
        assert!(engine.on_output(&mut reg, TerminalId(1), "$ ").is_empty());
        assert!(engine.on_output(&mut reg, TerminalId(2), "$ ").is_empty());
        assert_eq!(status(&reg, 1), AgentStatus::Disconnected);
        assert_eq!(status(&reg, 2), AgentStatus::None);
    }

    #[test]
    fn keywords_accumulate_to_threshold() {
        let (mut engine, mut reg, _bus) = setup(1);
        let t1 = TerminalId(1);
        assert!(engine.on_output(&mut reg, t1, "loading agentx").is_empty());
        assert_eq!(status(&reg, 1), AgentStatus::None);
        let out = engine.on_output(&mut reg, t1, "agentx ready");
        assert_eq!(out.len(), 1);
        assert_eq!(status(&reg, 1), AgentStatus::Connected);
    }

    #[test]
    fn keyword_evidence_cannot_take_slot_from_active_agent() {
        let (mut engine, mut reg, _bus) = setup(2);
        let (t1, t2) = (TerminalId(1), TerminalId(2));
        engine.on_input(&mut reg, t1, "start-agent-x\n");

        assert!(engine.on_output(&mut reg, t2, "see the claude docs").is_empty());
        assert!(engine.on_output(&mut reg, t2, "claude is optional").is_empty());
        assert!(engine.on_output(&mut reg, t2, "claude again").is_empty());
        assert_eq!(status(&reg, 1), AgentStatus::Connected);
        assert_eq!(status(&reg, 2), AgentStatus::None);
        assert_eq!(reg.active_agent(), Some(t1));

        // A strong signature still wins the slot.
        let out = engine.on_output(&mut reg, t2, "Welcome to Claude Code!");
        assert_eq!(out[0].cause, TransitionCause::Demoted);
        assert_eq!(reg.active_agent(), Some(t2));
    }

    #[test]
    fn keyword_evidence_expires() {
        let (mut engine, mut reg, _bus) = setup(1);
        let t1 = TerminalId(1);
        let start = Instant::now();
        assert!(engine.observe_output(&mut reg, t1, "loading agentx", start).is_empty());
        let later = start + KEYWORD_WINDOW + Duration::from_secs(1);
        assert!(engine.observe_output(&mut reg, t1, "agentx ready", later).is_empty());
        assert_eq!(status(&reg, 1), AgentStatus::None);

        let out = engine.observe_output(&mut reg, t1, "agentx ready", later + Duration::from_secs(1));
        assert_eq!(out.len(), 1);
        assert_eq!(status(&reg, 1), AgentStatus::Connected);
    }

    #[test]
    fn prompt_return_resets_keyword_evidence() {
        let (mut engine, mut reg, _bus) = setup(1);
        let t1 = TerminalId(1);
        assert!(engine.on_output(&mut reg, t1, "grep agentx notes.txt\r\n$ ").is_empty());
        assert!(engine.on_output(&mut reg, t1, "agentx ready").is_empty());
        assert_eq!(status(&reg, 1), AgentStatus::None);
    }

    #[test]
    fn keyword_never_changes_connected_terminal() {
        let (mut engine, mut reg, _bus) = setup(1);
        let t1 = TerminalId(1);
        engine.on_input(&mut reg, t1, "claude\n");
        for _ in 0..3 {
            assert!(engine.on_output(&mut reg, t1, "asking gemini for help").is_empty());
        }
        assert_eq!(reg.lookup(t1).unwrap().agent.agent_type.as_deref(), Some("claude"));
    }

    #[test]
    fn strong_match_for_other_agent_updates_type() {
        let (mut engine, mut reg, _bus) = setup(1);
        let t1 = TerminalId(1);
        engine.on_input(&mut reg, t1, "claude\n");
        let out = engine.on_input(&mut reg, t1, "codex\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].from, AgentStatus::Connected);
        assert_eq!(out[0].to, AgentStatus::Connected);
        assert_eq!(reg.lookup(t1).unwrap().agent.agent_type.as_deref(), Some("codex"));
    }

    #[test]
    fn latest_connect_demotes_previous_holder() {
        let (mut engine, mut reg, _bus) = setup(2);
        engine.on_input(&mut reg, TerminalId(1), "claude\n");
        let out = engine.on_input(&mut reg, TerminalId(2), "codex\n");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].terminal_id, TerminalId(1));
        assert_eq!(out[0].cause, TransitionCause::Demoted);
        assert_eq!(out[1].terminal_id, TerminalId(2));
        assert_eq!(reg.active_agent(), Some(TerminalId(2)));
        assert_eq!(connected_count(&reg), 1);
    }

    #[test]
    fn disposal_promotes_most_recently_disconnected() {
        let (mut engine, mut reg, _bus) = setup(3);
        let (t1, t2, t3) = (TerminalId(1), TerminalId(2), TerminalId(3));
        // Each connect demotes the previous holder: t2 first, then t3.
        engine.on_input(&mut reg, t2, "gemini\n");
        engine.on_input(&mut reg, t3, "codex\n");
        engine.on_input(&mut reg, t1, "start-agent-x\n");
        assert_eq!(status(&reg, 2), AgentStatus::Disconnected);
        assert_eq!(status(&reg, 3), AgentStatus::Disconnected);

        let out = engine.forget(&mut reg, t1);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].cause, TransitionCause::Disposed);
        assert_eq!(out[1].terminal_id, t3);
        assert_eq!(out[1].cause, TransitionCause::Promoted);
        assert_eq!(out[1].agent_type.as_deref(), Some("codex"));
        assert_eq!(reg.active_agent(), Some(t3));
        assert_eq!(connected_count(&reg), 1);
    }

    #[test]
    fn disconnect_promotes_another_waiting_terminal() {
        let (mut engine, mut reg, _bus) = setup(2);
        engine.on_input(&mut reg, TerminalId(2), "gemini\n");
        engine.on_output(&mut reg, TerminalId(2), "$ ");
        engine.on_input(&mut reg, TerminalId(1), "claude\n");

        let out = engine.on_output(&mut reg, TerminalId(1), "$ ");
        assert_eq!(out.len(), 2);
        assert_eq!(status(&reg, 1), AgentStatus::Disconnected);
        assert_eq!(status(&reg, 2), AgentStatus::Connected);
    }

    #[test]
    fn exited_terminals_are_not_promoted() {
        let (mut engine, mut reg, _bus) = setup(2);
        engine.on_input(&mut reg, TerminalId(2), "gemini\n");
        engine.on_output(&mut reg, TerminalId(2), "$ ");
        reg.lookup_mut(TerminalId(2)).unwrap().process_state = ProcessState::Exited;
        engine.on_input(&mut reg, TerminalId(1), "claude\n");

        engine.forget(&mut reg, TerminalId(1));
        assert_eq!(reg.active_agent(), None);
        assert_eq!(connected_count(&reg), 0);
    }

    #[test]
    fn process_exit_of_active_terminal_disconnects() {
        let (mut engine, mut reg, _bus) = setup(1);
        let t1 = TerminalId(1);
        engine.on_input(&mut reg, t1, "claude\n");
        let out = engine.on_process_exit(&mut reg, t1);
        assert_eq!(out[0].cause, TransitionCause::ProcessExit);
        assert_eq!(status(&reg, 1), AgentStatus::Disconnected);
        assert_eq!(reg.active_agent(), None);
    }

    #[test]
    fn clear_detection_resets_and_promotes() {
        let (mut engine, mut reg, _bus) = setup(2);
        engine.on_input(&mut reg, TerminalId(2), "gemini\n");
        engine.on_output(&mut reg, TerminalId(2), "$ ");
        engine.on_input(&mut reg, TerminalId(1), "claude\n");

        let out = engine.clear_detection(&mut reg, TerminalId(1)).unwrap();
        assert_eq!(out[0].to, AgentStatus::None);
        assert_eq!(out[1].cause, TransitionCause::Promoted);
        assert_eq!(status(&reg, 1), AgentStatus::None);
        assert_eq!(reg.lookup(TerminalId(1)).unwrap().agent.agent_type, None);
        assert_eq!(reg.active_agent(), Some(TerminalId(2)));

        assert!(matches!(
            engine.clear_detection(&mut reg, TerminalId(5)),
            Err(crate::error::SessionError::NotFound(_))
        ));
    }

    #[test]
    fn at_most_one_connected_across_random_walk() {
        let (mut engine, mut reg, _bus) = setup(4);
        let inputs = ["claude\n", "codex\n", "gemini\n", "start-agent-x\n"];
        let mut seed = 0x2545_f491_u32;
        for step in 0..200 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let id = TerminalId((seed % 4) as u16 + 1);
            match (seed >> 8) % 4 {
                0 => drop(engine.on_input(&mut reg, id, inputs[step % 4])),
                1 => drop(engine.on_output(&mut reg, id, "$ ")),
                2 => drop(engine.on_output(&mut reg, id, "agentx agentx")),
                _ => drop(engine.clear_detection(&mut reg, id)),
            }
            assert!(connected_count(&reg) <= 1, "step {step}");
            if let Some(active) = reg.active_agent() {
                assert_eq!(status(&reg, active.0), AgentStatus::Connected);
            }
        }
    }
}
