use std::io::{Read as IoRead, Write as IoWrite};
use std::sync::Mutex;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};

// ---------------------------------------------------------------------------
// SpawnOptions
// ---------------------------------------------------------------------------

/// Everything needed to launch a shell inside a PTY.
///
/// Also serves as the saved description a persistence collaborator hands back
/// when a terminal is recreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnOptions {
    pub shell: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnOptions {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            cols: 80,
            rows: 24,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    /// Same options with a different shell, used for the fallback retry.
    pub fn with_shell(&self, shell: &str) -> Self {
        Self {
            shell: shell.to_string(),
            ..self.clone()
        }
    }
}

/// Exit status reported once the child process has been reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the status could not be collected.
    pub code: Option<u32>,
}

// ---------------------------------------------------------------------------
// PtyHandle
// ---------------------------------------------------------------------------

/// Resize/kill access to the PTY behind a handle.
pub trait PtyControl: Send + Sync {
    fn resize(&self, cols: u16, rows: u16) -> Result<()>;
    fn kill(&self) -> Result<()>;
}

/// An opaque handle to one PTY process: output and exit streams plus
/// write/resize/kill.
pub struct PtyHandle {
    pid: Option<u32>,
    output: flume::Receiver<Vec<u8>>,
    exit: flume::Receiver<ProcessExit>,
    writer: flume::Sender<Vec<u8>>,
    control: Box<dyn PtyControl>,
}

impl PtyHandle {
    /// Assemble a handle from its channels. Used by spawners, including the
    /// in-memory ones tests drive.
    pub fn from_parts(
        pid: Option<u32>,
        output: flume::Receiver<Vec<u8>>,
        exit: flume::Receiver<ProcessExit>,
        writer: flume::Sender<Vec<u8>>,
        control: Box<dyn PtyControl>,
    ) -> Self {
        Self {
            pid,
            output,
            exit,
            writer,
            control,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Output stream; disconnects once the PTY reaches EOF.
    pub fn output(&self) -> flume::Receiver<Vec<u8>> {
        self.output.clone()
    }

    /// Receives exactly one [`ProcessExit`] when the child is reaped.
    pub fn exit(&self) -> flume::Receiver<ProcessExit> {
        self.exit.clone()
    }

    /// Queue bytes for the PTY stdin. Never blocks.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.writer
            .send(data.to_vec())
            .map_err(|e| SessionError::Pty(format!("writer channel closed: {e}")))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.control.resize(cols, rows)
    }

    pub fn kill(&self) -> Result<()> {
        self.control.kill()
    }
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle")
            .field("pid", &self.pid)
            .field("output_closed", &self.output.is_disconnected())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ProcessSpawner
// ---------------------------------------------------------------------------

/// Creates PTY processes. The seam that lets the orchestrator run against
/// real PTYs or in-memory fakes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, options: &SpawnOptions) -> Result<PtyHandle>;
}

/// Production spawner backed by `portable-pty`.
#[derive(Debug, Clone)]
pub struct PortablePtySpawner {
    term: String,
}

impl PortablePtySpawner {
    /// `term` is exported as `TERM` unless the caller's env sets it.
    pub fn new(term: impl Into<String>) -> Self {
        Self { term: term.into() }
    }
}

impl Default for PortablePtySpawner {
    fn default() -> Self {
        Self::new("xterm-256color")
    }
}

struct PortablePtyControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyControl for PortablePtyControl {
    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self.master.lock().unwrap_or_else(|e| {
            warn!("master lock was poisoned, recovering");
            e.into_inner()
        });
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Pty(format!("resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        let mut killer = self.killer.lock().unwrap_or_else(|e| {
            warn!("killer lock was poisoned, recovering");
            e.into_inner()
        });
        killer.kill()?;
        Ok(())
    }
}

impl ProcessSpawner for PortablePtySpawner {
    fn spawn(&self, options: &SpawnOptions) -> Result<PtyHandle> {
        let spawn_failed = |e: &dyn std::fmt::Display| SessionError::SpawnFailed {
            shell: options.shell.clone(),
            reason: e.to_string(),
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_failed(&e))?;

        let mut command = CommandBuilder::new(&options.shell);
        for arg in &options.args {
            command.arg(arg);
        }
        if let Some(cwd) = &options.cwd {
            command.cwd(cwd);
        }
        if !options.env.iter().any(|(k, _)| k == "TERM") {
            command.env("TERM", &self.term);
        }
        for (k, v) in &options.env {
            command.env(k, v);
        }

        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| spawn_failed(&e))?;
        // The child holds its own slave fd; ours must go so EOF reaches the reader.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        debug!(shell = %options.shell, args = ?options.args, ?pid, "spawned PTY process");

        // -- stdout reader thread --
        let (read_tx, read_rx) = flume::bounded::<Vec<u8>>(256);
        let mut reader = pair.master.try_clone_reader().map_err(|e| spawn_failed(&e))?;
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if read_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is expected on Linux/macOS once the child exits.
                        debug!("pty reader stopped: {e}");
                        break;
                    }
                }
            }
        });

        // -- stdin writer thread --
        let (write_tx, write_rx) = flume::unbounded::<Vec<u8>>();
        let mut writer = pair.master.take_writer().map_err(|e| spawn_failed(&e))?;
        std::thread::spawn(move || {
            while let Ok(data) = write_rx.recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        // -- exit waiter thread --
        let (exit_tx, exit_rx) = flume::bounded::<ProcessExit>(1);
        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code()),
                Err(e) => {
                    warn!("failed to reap pty child: {e}");
                    None
                }
            };
            let _ = exit_tx.send(ProcessExit { code });
        });

        let control = PortablePtyControl {
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
        };

        Ok(PtyHandle::from_parts(
            pid,
            read_rx,
            exit_rx,
            write_tx,
            Box::new(control),
        ))
    }
}
