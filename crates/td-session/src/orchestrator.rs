use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use td_core::config::Config;
use td_core::types::{AgentStatus, ProcessState, SessionEvent, TerminalId, TerminateReason};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::{BatchConsumer, FlushMode, OutputBatch, OutputBufferPipeline};
use crate::detection::{AgentTransition, CliAgentDetectionEngine};
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::lifecycle::ProcessLifecycleController;
use crate::registry::TerminalRegistry;
use crate::snapshot::TerminalSnapshot;
use crate::spawner::{PortablePtySpawner, ProcessExit, ProcessSpawner, PtyHandle, SpawnOptions};

const COMPONENT: &str = "orchestrator";

/// How long the pump keeps reading output after the exit status arrived,
/// waiting for the PTY to reach EOF.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(50);

/// Sleep used in place of a timer when nothing is queued.
const IDLE_PARK: Duration = Duration::from_secs(3600);

/// Result of [`SessionOrchestrator::get_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalState {
    pub process_state: ProcessState,
    pub agent_status: AgentStatus,
    pub agent_type: Option<String>,
    pub exit_code: Option<u32>,
}

struct PumpHandle {
    generation: u64,
    task: JoinHandle<()>,
}

/// Where a `dispose` call stands once it has looked at the terminal.
enum DisposeStep {
    /// Nothing left to do.
    Released,
    /// Another call owns the teardown; flips to `true` once the id is released.
    InProgress(watch::Receiver<bool>),
    /// This call owns the teardown.
    Owner {
        generation: u64,
        pump: Option<PumpHandle>,
        done: watch::Sender<bool>,
    },
}

/// Everything behind the orchestrator lock. Each method is one atomic step.
struct SessionCore {
    registry: TerminalRegistry,
    lifecycle: ProcessLifecycleController,
    pipeline: OutputBufferPipeline,
    detection: CliAgentDetectionEngine,
    pumps: HashMap<TerminalId, PumpHandle>,
    /// Teardowns in flight, keyed by terminal.
    disposals: HashMap<TerminalId, watch::Receiver<bool>>,
}

impl SessionCore {
    /// Flush deadline of a live pump. `None` when the pump is stale.
    fn flush_deadline(&self, id: TerminalId, generation: u64) -> Option<Option<Instant>> {
        if !self.registry.is_current(id, generation) {
            return None;
        }
        Some(self.pipeline.next_deadline(id))
    }

    /// One output chunk from the PTY. Returns `false` when the pump is stale.
    fn ingest(&mut self, id: TerminalId, generation: u64, bytes: &[u8]) -> bool {
        let Ok(instance) = self.registry.lookup(id) else {
            return false;
        };
        if instance.generation != generation {
            return false;
        }
        if instance.kill_reason.is_some() {
            // Output after a kill request is dropped.
            return true;
        }
        if let Err(e) = self.lifecycle.on_output(&mut self.registry, id) {
            warn!(component = COMPONENT, terminal_id = %id, "first-output transition failed: {e}");
        }
        if let Some(batch) = self.pipeline.push_bytes(id, bytes, Instant::now()) {
            self.after_flush(batch);
        }
        true
    }

    fn flush_due(&mut self, id: TerminalId, generation: u64) -> bool {
        if !self.registry.is_current(id, generation) {
            return false;
        }
        if let Some(batch) = self.pipeline.flush_due(id, Instant::now()) {
            self.after_flush(batch);
        }
        true
    }

    /// Process exit observed by the pump.
    fn finish(&mut self, id: TerminalId, generation: u64, code: Option<u32>) {
        if !self.registry.is_current(id, generation) {
            return;
        }
        if let Some(batch) = self.pipeline.cancel(id, Instant::now()) {
            self.after_flush(batch);
        }
        if let Err(e) = self.lifecycle.on_exit(&mut self.registry, id, code) {
            warn!(component = COMPONENT, terminal_id = %id, "exit handling failed: {e}");
        }
        let transitions = self.detection.on_process_exit(&mut self.registry, id);
        self.apply_modes(&transitions);
    }

    /// A batch has been delivered: keep the scrollback and run detection.
    fn after_flush(&mut self, batch: OutputBatch) {
        let id = batch.terminal_id;
        if let Ok(instance) = self.registry.lookup_mut(id) {
            instance.scrollback.push(&batch.data);
        }
        let transitions = self.detection.on_output(&mut self.registry, id, &batch.data);
        self.apply_modes(&transitions);
    }

    fn apply_modes(&mut self, transitions: &[AgentTransition]) {
        for t in transitions {
            if t.to == AgentStatus::Connected {
                self.pipeline.set_mode(t.terminal_id, FlushMode::Fast);
            } else if t.from == AgentStatus::Connected {
                self.pipeline.set_mode(t.terminal_id, FlushMode::Normal);
            }
        }
    }

    /// Spawn into an already registered terminal and start its pump.
    fn launch(&mut self, core: &Arc<Mutex<SessionCore>>, id: TerminalId) -> Result<()> {
        let options = self.registry.lookup(id)?.options.clone();
        let (handle, used) = self.lifecycle.spawn(&options)?;
        self.registry.lookup_mut(id)?.options = used;
        self.pipeline.register(id);
        let handle = self.lifecycle.attach(&mut self.registry, id, handle)?;
        let generation = self.registry.lookup(id)?.generation;

        let task = tokio::spawn(run_pump(core.clone(), id, generation, handle));
        if let Some(old) = self.pumps.insert(id, PumpHandle { generation, task }) {
            old.task.abort();
        }
        Ok(())
    }

    #[cfg(test)]
    fn pump_count(&self) -> usize {
        self.pumps.len()
    }
}

fn lock_core(core: &Mutex<SessionCore>) -> MutexGuard<'_, SessionCore> {
    core.lock().unwrap_or_else(|e| {
        warn!("session core lock was poisoned, recovering");
        e.into_inner()
    })
}

/// Per-terminal task: multiplexes PTY output, the flush timer, and the exit
/// status. Output is handled strictly in arrival order.
async fn run_pump(
    core: Arc<Mutex<SessionCore>>,
    id: TerminalId,
    generation: u64,
    handle: Arc<PtyHandle>,
) {
    let output = handle.output();
    let exit = handle.exit();
    drop(handle);

    let mut output_open = true;
    let mut exited: Option<(Option<u32>, tokio::time::Instant)> = None;

    loop {
        if let Some((code, drain_until)) = exited {
            if !output_open || tokio::time::Instant::now() >= drain_until {
                lock_core(&core).finish(id, generation, code);
                debug!(component = COMPONENT, terminal_id = %id, generation, "pump finished");
                return;
            }
        }

        let Some(flush_at) = lock_core(&core).flush_deadline(id, generation) else {
            debug!(component = COMPONENT, terminal_id = %id, generation, "stale pump stopped");
            return;
        };
        let timer_at = flush_at
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + IDLE_PARK);
        let drain_at = exited
            .map(|(_, until)| until)
            .unwrap_or_else(|| tokio::time::Instant::now() + IDLE_PARK);

        tokio::select! {
            chunk = output.recv_async(), if output_open => match chunk {
                Ok(bytes) => {
                    if !lock_core(&core).ingest(id, generation, &bytes) {
                        return;
                    }
                }
                Err(_) => {
                    debug!(component = COMPONENT, terminal_id = %id, "PTY output reached EOF");
                    output_open = false;
                }
            },
            status = exit.recv_async(), if exited.is_none() => {
                let code = status.ok().and_then(|ProcessExit { code }| code);
                exited = Some((code, tokio::time::Instant::now() + EXIT_DRAIN_GRACE));
            },
            _ = tokio::time::sleep_until(timer_at), if flush_at.is_some() => {
                if !lock_core(&core).flush_due(id, generation) {
                    return;
                }
            },
            _ = tokio::time::sleep_until(drain_at), if exited.is_some() => {},
            else => return,
        }
    }
}

/// The façade collaborators talk to: creates and disposes terminals, routes
/// input, and reports everything on the event feed.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionOrchestrator {
    core: Arc<Mutex<SessionCore>>,
    bus: EventBus,
    default_options: SpawnOptions,
    dispose_timeout: Duration,
}

impl SessionOrchestrator {
    pub fn new(config: &Config, spawner: Arc<dyn ProcessSpawner>) -> Result<Self> {
        config.validate()?;
        let bus = EventBus::new();
        let session = &config.session;
        let fallback = Some(session.fallback_shell.clone()).filter(|s| !s.trim().is_empty());
        let core = SessionCore {
            registry: TerminalRegistry::new(session.max_terminals, session.scrollback_bytes),
            lifecycle: ProcessLifecycleController::new(spawner, fallback, bus.clone()),
            pipeline: OutputBufferPipeline::new(&config.buffer, bus.clone()),
            detection: CliAgentDetectionEngine::new(&config.detection, bus.clone())?,
            pumps: HashMap::new(),
            disposals: HashMap::new(),
        };
        info!(
            component = COMPONENT,
            max_terminals = session.max_terminals,
            shell = %session.default_shell,
            "session orchestrator ready"
        );
        Ok(Self {
            core: Arc::new(Mutex::new(core)),
            bus,
            default_options: SpawnOptions::new(session.default_shell.clone())
                .size(session.default_cols, session.default_rows),
            dispose_timeout: Duration::from_millis(session.dispose_timeout_ms),
        })
    }

    /// Orchestrator over real PTYs.
    pub fn with_portable_pty(config: &Config) -> Result<Self> {
        let spawner = Arc::new(PortablePtySpawner::new(config.session.term.clone()));
        Self::new(config, spawner)
    }

    /// Launch options built from the configured shell and size.
    pub fn default_options(&self) -> SpawnOptions {
        self.default_options.clone()
    }

    fn core(&self) -> MutexGuard<'_, SessionCore> {
        lock_core(&self.core)
    }

    /// Allocate the smallest free id and spawn a shell in it.
    ///
    /// Fails with `CapacityExceeded` when the pool is full, or `SpawnFailed`
    /// after the fallback shell failed too; the id is released again in
    /// that case.
    pub async fn create_terminal(&self, options: SpawnOptions) -> Result<TerminalId> {
        let mut core = self.core();
        let id = core.registry.create(options)?.id;
        if let Err(e) = core.launch(&self.core, id) {
            core.registry.discard(id);
            core.pipeline.remove(id);
            warn!(component = COMPONENT, terminal_id = %id, "terminal creation failed: {e}");
            return Err(e);
        }
        info!(component = COMPONENT, terminal_id = %id, "terminal created");
        Ok(id)
    }

    /// Route input to the process. Detection sees the input before the
    /// process does; input refused with `NotRunning` is not inspected.
    ///
    /// Output still queued when a line is submitted is flushed through
    /// detection first, so a prompt printed before the line cannot end an
    /// agent the line starts.
    pub fn send_input(&self, id: TerminalId, data: &str) -> Result<()> {
        let mut core = self.core();
        let core = &mut *core;
        let process = core.lifecycle.check_writable(&core.registry, id)?;
        if data.contains(['\r', '\n']) {
            if let Some(batch) = core.pipeline.flush_pending(id, Instant::now()) {
                core.after_flush(batch);
            }
        }
        let transitions = core.detection.on_input(&mut core.registry, id, data);
        core.apply_modes(&transitions);
        process.write(data.as_bytes())
    }

    pub fn resize(&self, id: TerminalId, cols: u16, rows: u16) -> Result<()> {
        let mut core = self.core();
        let core = &mut *core;
        core.lifecycle.resize(&mut core.registry, id, cols, rows)?;
        Ok(())
    }

    /// Kill the process, wait for exit confirmation (bounded by the dispose
    /// timeout), then release the id.
    ///
    /// Idempotent: disposing an id that was already released is `Ok`. An id
    /// that was never handed out is `NotFound`. Concurrent calls for the same
    /// terminal all return once the first one has released it.
    pub async fn dispose(&self, id: TerminalId) -> Result<()> {
        loop {
            match self.begin_dispose(id)? {
                DisposeStep::Released => return Ok(()),
                DisposeStep::InProgress(mut done) => {
                    let released = done.wait_for(|released| *released).await.is_ok();
                    if released {
                        return Ok(());
                    }
                    // The owning call was dropped mid-way; take over.
                    debug!(component = COMPONENT, terminal_id = %id, "dispose: taking over abandoned teardown");
                }
                DisposeStep::Owner {
                    generation,
                    pump,
                    done,
                } => return self.finish_dispose(id, generation, pump, done).await,
            }
        }
    }

    fn begin_dispose(&self, id: TerminalId) -> Result<DisposeStep> {
        let mut core = self.core();
        let core = &mut *core;
        if let Some(done) = core.disposals.get(&id) {
            if done.has_changed().is_ok() {
                return Ok(DisposeStep::InProgress(done.clone()));
            }
            core.disposals.remove(&id);
        }

        let generation = match core.registry.lookup(id) {
            Ok(instance) => instance.generation,
            Err(e) => {
                if core.registry.was_allocated(id) {
                    debug!(component = COMPONENT, terminal_id = %id, "dispose: already released");
                    return Ok(DisposeStep::Released);
                }
                return Err(e);
            }
        };
        core.lifecycle
            .terminate(&mut core.registry, id, TerminateReason::User)?;
        if let Some(batch) = core.pipeline.cancel(id, Instant::now()) {
            core.after_flush(batch);
        }
        let pump = core
            .pumps
            .remove(&id)
            .filter(|p| p.generation == generation);
        let (done, waiting) = watch::channel(false);
        core.disposals.insert(id, waiting);
        Ok(DisposeStep::Owner {
            generation,
            pump,
            done,
        })
    }

    async fn finish_dispose(
        &self,
        id: TerminalId,
        generation: u64,
        pump: Option<PumpHandle>,
        done: watch::Sender<bool>,
    ) -> Result<()> {
        if let Some(mut pump) = pump {
            if tokio::time::timeout(self.dispose_timeout, &mut pump.task)
                .await
                .is_err()
            {
                warn!(
                    component = COMPONENT,
                    terminal_id = %id,
                    timeout_ms = self.dispose_timeout.as_millis() as u64,
                    "process did not confirm exit in time, abandoning handle"
                );
                pump.task.abort();
            }
        }

        let mut core = self.core();
        let core = &mut *core;
        core.disposals.remove(&id);
        if core.registry.is_current(id, generation) {
            if let Err(e) = core.lifecycle.on_exit(&mut core.registry, id, None) {
                warn!(component = COMPONENT, terminal_id = %id, "exit confirmation failed: {e}");
            }
            let transitions = core.detection.forget(&mut core.registry, id);
            core.apply_modes(&transitions);
            core.pipeline.remove(id);
            core.registry.release(id)?;
            self.bus.publish(SessionEvent::Disposed { terminal_id: id });
            info!(component = COMPONENT, terminal_id = %id, "terminal disposed");
        }
        let _ = done.send(true);
        Ok(())
    }

    pub fn get_state(&self, id: TerminalId) -> Result<TerminalState> {
        let core = self.core();
        let instance = core.registry.lookup(id)?;
        Ok(TerminalState {
            process_state: instance.process_state,
            agent_status: instance.agent.status,
            agent_type: instance.agent.agent_type.clone(),
            exit_code: instance.exit_code,
        })
    }

    /// Return a terminal's agent state to `None`.
    pub fn clear_detection(&self, id: TerminalId) -> Result<()> {
        let mut core = self.core();
        let core = &mut *core;
        let transitions = core.detection.clear_detection(&mut core.registry, id)?;
        core.apply_modes(&transitions);
        Ok(())
    }

    /// Forced teardown by the host (e.g. resource pressure). The terminal
    /// stays listed as `KilledByHost` until disposed.
    pub fn host_terminate(&self, id: TerminalId) -> Result<()> {
        let mut core = self.core();
        let core = &mut *core;
        core.lifecycle
            .terminate(&mut core.registry, id, TerminateReason::Host)?;
        if let Some(batch) = core.pipeline.cancel(id, Instant::now()) {
            core.after_flush(batch);
        }
        Ok(())
    }

    /// Respawn an exited terminal in place, keeping its id.
    pub async fn restart(&self, id: TerminalId) -> Result<()> {
        let mut core = self.core();
        let core_ref = &mut *core;
        core_ref.lifecycle.reset(&mut core_ref.registry, id)?;
        core_ref.registry.bump_generation(id)?;
        if let Err(e) = core_ref.launch(&self.core, id) {
            // Leave the terminal disposable rather than stuck in Launching.
            if let Err(exit_err) = core_ref.lifecycle.on_exit(&mut core_ref.registry, id, None) {
                warn!(component = COMPONENT, terminal_id = %id, "exit after failed restart: {exit_err}");
            }
            return Err(e);
        }
        info!(component = COMPONENT, terminal_id = %id, "terminal restarted");
        Ok(())
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> flume::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    /// Register a downstream consumer of flushed batches.
    pub fn add_batch_consumer(&self, consumer: Arc<dyn BatchConsumer>) {
        self.core().pipeline.add_consumer(consumer);
    }

    pub fn active_agent(&self) -> Option<TerminalId> {
        self.core().registry.active_agent()
    }

    /// Live terminal ids, ascending.
    pub fn list_terminals(&self) -> Vec<TerminalId> {
        self.core().registry.ids()
    }

    pub fn snapshot(&self, id: TerminalId) -> Result<TerminalSnapshot> {
        Ok(self.core().registry.lookup(id)?.snapshot())
    }

    /// Snapshots of every live terminal, for the persistence collaborator.
    pub fn snapshots(&self) -> Vec<TerminalSnapshot> {
        self.core()
            .registry
            .list()
            .into_iter()
            .map(|t| t.snapshot())
            .collect()
    }

    /// Recreate a terminal from a saved description. The saved output is
    /// handed to the renderer as `ScrollbackRestored`; the id may differ from
    /// the saved one.
    pub async fn restore(&self, snapshot: &TerminalSnapshot) -> Result<TerminalId> {
        let id = self.create_terminal(snapshot.options.clone()).await?;
        if !snapshot.recent_output.is_empty() {
            if let Ok(instance) = self.core().registry.lookup_mut(id) {
                instance.scrollback.push(&snapshot.recent_output);
            }
            self.bus.publish(SessionEvent::ScrollbackRestored {
                terminal_id: id,
                data: snapshot.recent_output.clone(),
            });
        }
        info!(component = COMPONENT, terminal_id = %id, saved_id = %snapshot.id, "terminal restored");
        Ok(id)
    }

    /// Dispose every live terminal concurrently.
    pub async fn shutdown(&self) {
        let ids = self.list_terminals();
        info!(component = COMPONENT, count = ids.len(), "shutting down session");
        let mut set = tokio::task::JoinSet::new();
        for id in ids {
            let this = self.clone();
            set.spawn(async move { (id, this.dispose(id).await) });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => {
                    warn!(component = COMPONENT, terminal_id = %id, "dispose during shutdown failed: {e}");
                }
                Err(e) => warn!(component = COMPONENT, "dispose task failed: {e}"),
            }
        }
    }
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("bus", &self.bus)
            .field("dispose_timeout", &self.dispose_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::PtyControl;

    struct NullControl;

    impl PtyControl for NullControl {
        fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
            Ok(())
        }
        fn kill(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Spawner whose processes never produce anything.
    struct SilentSpawner {
        keep: Mutex<Vec<(flume::Sender<Vec<u8>>, flume::Sender<ProcessExit>)>>,
    }

    impl ProcessSpawner for SilentSpawner {
        fn spawn(&self, _options: &SpawnOptions) -> Result<PtyHandle> {
            let (out_tx, out_rx) = flume::unbounded();
            let (exit_tx, exit_rx) = flume::bounded(1);
            let (write_tx, _write_rx) = flume::unbounded();
            self.keep.lock().unwrap().push((out_tx, exit_tx));
            Ok(PtyHandle::from_parts(None, out_rx, exit_rx, write_tx, Box::new(NullControl)))
        }
    }

    #[tokio::test]
    async fn pumps_are_tracked_per_terminal() {
        let spawner = Arc::new(SilentSpawner {
            keep: Mutex::new(Vec::new()),
        });
        let mut config = Config::default();
        config.session.dispose_timeout_ms = 50;
        let orch = SessionOrchestrator::new(&config, spawner).unwrap();

        let a = orch.create_terminal(orch.default_options()).await.unwrap();
        let b = orch.create_terminal(orch.default_options()).await.unwrap();
        assert_eq!(orch.core().pump_count(), 2);

        // The silent process never confirms exit: dispose times out and
        // force-releases.
        orch.dispose(a).await.unwrap();
        assert_eq!(orch.core().pump_count(), 1);
        assert_eq!(orch.list_terminals(), vec![b]);
    }
}
