use std::sync::Arc;

use td_core::types::{ProcessState, SessionEvent, TerminalId, TerminateReason};
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::event_bus::EventBus;
use crate::registry::TerminalRegistry;
use crate::spawner::{ProcessSpawner, PtyHandle, SpawnOptions};

const COMPONENT: &str = "lifecycle";

/// Drives each terminal's process state machine:
///
/// ```text
/// Launching -> Running -> { Exited, KilledByUser, KilledByHost }
/// ```
///
/// `Launching -> Running` fires on the first output chunk, not on spawn
/// confirmation. Exit states are terminal; only [`reset`](Self::reset) leaves
/// them.
pub struct ProcessLifecycleController {
    spawner: Arc<dyn ProcessSpawner>,
    fallback_shell: Option<String>,
    bus: EventBus,
}

impl ProcessLifecycleController {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, fallback_shell: Option<String>, bus: EventBus) -> Self {
        Self {
            spawner,
            fallback_shell,
            bus,
        }
    }

    /// Spawn a PTY process, retrying once with the fallback shell.
    ///
    /// Returns the handle together with the options that actually worked. On
    /// double failure the first error is surfaced.
    pub fn spawn(&self, options: &SpawnOptions) -> Result<(PtyHandle, SpawnOptions)> {
        let first_err = match self.spawner.spawn(options) {
            Ok(handle) => return Ok((handle, options.clone())),
            Err(e) => e,
        };

        let Some(fallback) = self
            .fallback_shell
            .as_deref()
            .filter(|shell| *shell != options.shell)
        else {
            warn!(component = COMPONENT, shell = %options.shell, "spawn failed: {first_err}");
            return Err(into_spawn_failed(first_err, &options.shell));
        };

        warn!(
            component = COMPONENT,
            shell = %options.shell,
            fallback,
            "spawn failed, retrying with fallback shell: {first_err}"
        );
        let retry = options.with_shell(fallback);
        match self.spawner.spawn(&retry) {
            Ok(handle) => Ok((handle, retry)),
            Err(e) => {
                warn!(component = COMPONENT, shell = fallback, "fallback spawn failed: {e}");
                Err(into_spawn_failed(first_err, &options.shell))
            }
        }
    }

    /// Attach a spawned process to its terminal.
    pub fn attach(
        &self,
        registry: &mut TerminalRegistry,
        id: TerminalId,
        handle: PtyHandle,
    ) -> Result<Arc<PtyHandle>> {
        let instance = registry.lookup_mut(id)?;
        let handle = Arc::new(handle);
        instance.process = Some(handle.clone());
        debug!(component = COMPONENT, terminal_id = %id, pid = ?handle.pid(), "process attached");
        Ok(handle)
    }

    /// First output moves a launching terminal to `Running`. Returns whether
    /// a transition happened.
    pub fn on_output(&self, registry: &mut TerminalRegistry, id: TerminalId) -> Result<bool> {
        if registry.lookup(id)?.process_state != ProcessState::Launching {
            return Ok(false);
        }
        self.transition(registry, id, ProcessState::Running)?;
        Ok(true)
    }

    /// The attached process, if the terminal currently accepts input.
    /// Fails with `NotRunning` once the process has left
    /// `Launching`/`Running`.
    pub fn check_writable(&self, registry: &TerminalRegistry, id: TerminalId) -> Result<Arc<PtyHandle>> {
        let instance = registry.lookup(id)?;
        match (&instance.process, instance.process_state.accepts_input()) {
            (Some(process), true) => Ok(process.clone()),
            _ => {
                warn!(
                    component = COMPONENT,
                    terminal_id = %id,
                    state = %instance.process_state,
                    "write to terminal that is not running"
                );
                Err(SessionError::NotRunning {
                    id,
                    state: instance.process_state,
                })
            }
        }
    }

    pub fn write(&self, registry: &TerminalRegistry, id: TerminalId, data: &[u8]) -> Result<()> {
        self.check_writable(registry, id)?.write(data)
    }

    /// Resize the PTY. Unchanged dimensions are a no-op; returns whether a
    /// resize was applied. PTY-level failures are logged, not surfaced.
    pub fn resize(
        &self,
        registry: &mut TerminalRegistry,
        id: TerminalId,
        cols: u16,
        rows: u16,
    ) -> Result<bool> {
        let instance = registry.lookup_mut(id)?;
        if instance.options.cols == cols && instance.options.rows == rows {
            return Ok(false);
        }
        if let Some(process) = &instance.process {
            if !instance.process_state.is_terminal() {
                if let Err(e) = process.resize(cols, rows) {
                    warn!(component = COMPONENT, terminal_id = %id, "PTY resize failed: {e}");
                }
            }
        }
        instance.options.cols = cols;
        instance.options.rows = rows;
        Ok(true)
    }

    /// Kill the process on behalf of the user or the host. Idempotent: a
    /// terminal that already exited is left alone.
    pub fn terminate(
        &self,
        registry: &mut TerminalRegistry,
        id: TerminalId,
        reason: TerminateReason,
    ) -> Result<()> {
        let instance = registry.lookup_mut(id)?;
        if instance.process_state.is_terminal() {
            debug!(component = COMPONENT, terminal_id = %id, state = %instance.process_state, "terminate: already exited");
            return Ok(());
        }
        instance.kill_reason = Some(reason);
        if let Some(process) = &instance.process {
            if let Err(e) = process.kill() {
                debug!(component = COMPONENT, terminal_id = %id, "kill failed (process may be gone): {e}");
            }
        }
        self.transition(registry, id, reason.target_state())?;
        info!(component = COMPONENT, terminal_id = %id, ?reason, "terminal terminated");
        Ok(())
    }

    /// The process has exited (or its exit is assumed after a timeout).
    /// Publishes `Exited` exactly once per process.
    pub fn on_exit(
        &self,
        registry: &mut TerminalRegistry,
        id: TerminalId,
        code: Option<u32>,
    ) -> Result<()> {
        if !registry.lookup(id)?.process_state.is_terminal() {
            self.transition(registry, id, ProcessState::Exited)?;
        }
        let instance = registry.lookup_mut(id)?;
        if instance.exit_confirmed {
            return Ok(());
        }
        instance.exit_confirmed = true;
        instance.exit_code = code;
        let state = instance.process_state;
        info!(component = COMPONENT, terminal_id = %id, ?code, %state, "process exited");
        self.bus.publish(SessionEvent::Exited {
            terminal_id: id,
            state,
            exit_code: code,
        });
        Ok(())
    }

    /// Return an exited terminal to `Launching` so it can be respawned in
    /// place. The only backwards edge of the state machine.
    pub fn reset(&self, registry: &mut TerminalRegistry, id: TerminalId) -> Result<()> {
        let instance = registry.lookup_mut(id)?;
        let from = instance.process_state;
        if !from.is_terminal() {
            return Err(SessionError::InvalidTransition {
                id,
                from,
                to: ProcessState::Launching,
            });
        }
        instance.process_state = ProcessState::Launching;
        instance.exit_code = None;
        instance.exit_confirmed = false;
        instance.kill_reason = None;
        instance.process = None;
        self.bus.publish(SessionEvent::StateChanged {
            terminal_id: id,
            from,
            to: ProcessState::Launching,
        });
        debug!(component = COMPONENT, terminal_id = %id, %from, "process state reset");
        Ok(())
    }

    fn transition(
        &self,
        registry: &mut TerminalRegistry,
        id: TerminalId,
        to: ProcessState,
    ) -> Result<ProcessState> {
        let instance = registry.lookup_mut(id)?;
        let from = instance.process_state;
        if !from.can_transition_to(&to) {
            warn!(component = COMPONENT, terminal_id = %id, %from, %to, "invalid process transition");
            return Err(SessionError::InvalidTransition { id, from, to });
        }
        instance.process_state = to;
        debug!(component = COMPONENT, terminal_id = %id, %from, %to, "process state transition");
        self.bus.publish(SessionEvent::StateChanged {
            terminal_id: id,
            from,
            to,
        });
        Ok(to)
    }
}

fn into_spawn_failed(err: SessionError, shell: &str) -> SessionError {
    match err {
        SessionError::SpawnFailed { .. } => err,
        other => SessionError::SpawnFailed {
            shell: shell.to_string(),
            reason: other.to_string(),
        },
    }
}

impl std::fmt::Debug for ProcessLifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLifecycleController")
            .field("fallback_shell", &self.fallback_shell)
            .finish()
    }
}
