use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use td_core::config::BufferConfig;
use td_core::types::{SessionEvent, TerminalId};
use tracing::{debug, error, warn};

use crate::event_bus::EventBus;

const COMPONENT: &str = "buffer";

// ---------------------------------------------------------------------------
// Batches and consumers
// ---------------------------------------------------------------------------

/// Why a batch left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Timer,
    LargeChunk,
    Overflow,
    /// Drained ahead of a typed line, so detection sees output in order.
    Input,
    /// Final drain when the terminal is torn down.
    Cancel,
}

/// One coalesced flush: the queued chunks concatenated in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBatch {
    pub terminal_id: TerminalId,
    pub data: String,
    pub chunks: usize,
    pub reason: FlushReason,
}

/// Downstream receiver of flushed batches (typically the rendering surface).
///
/// Called while the session core is locked: implementations must not call
/// back into the orchestrator.
pub trait BatchConsumer: Send + Sync {
    fn on_batch(&self, batch: &OutputBatch) -> anyhow::Result<()>;
}

impl<F> BatchConsumer for F
where
    F: Fn(&OutputBatch) -> anyhow::Result<()> + Send + Sync,
{
    fn on_batch(&self, batch: &OutputBatch) -> anyhow::Result<()> {
        self(batch)
    }
}

// ---------------------------------------------------------------------------
// Flush mode
// ---------------------------------------------------------------------------

/// Per-terminal pacing regime. `Fast` applies while the terminal holds the
/// connected agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    #[default]
    Normal,
    Fast,
}

#[derive(Debug, Clone, Copy)]
struct Intervals {
    normal: Duration,
    fast: Duration,
    min: Duration,
    max: Duration,
}

impl Intervals {
    fn base(&self, mode: FlushMode) -> Duration {
        let base = match mode {
            FlushMode::Normal => self.normal,
            FlushMode::Fast => self.fast,
        };
        self.clamp(base)
    }

    /// `max` wins if the bounds are inverted.
    fn clamp(&self, d: Duration) -> Duration {
        d.max(self.min).min(self.max)
    }
}

// ---------------------------------------------------------------------------
// UTF-8 carry
// ---------------------------------------------------------------------------

/// Incremental decoder that holds back an incomplete trailing UTF-8
/// sequence until the next read completes it.
#[derive(Debug, Default, Clone)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is held back, replacing it if it never completed.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Per-terminal state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueuedChunk {
    text: String,
    at: Instant,
}

#[derive(Debug)]
struct BufferState {
    queue: VecDeque<QueuedChunk>,
    last_flush_at: Option<Instant>,
    current_interval: Duration,
    overflow_count: u64,
    /// Set by an overflow flush, cleared by the next timer flush.
    pressured: bool,
    mode: FlushMode,
    carry: Utf8Carry,
}

impl BufferState {
    fn new(interval: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            last_flush_at: None,
            current_interval: interval,
            overflow_count: 0,
            pressured: false,
            mode: FlushMode::Normal,
            carry: Utf8Carry::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// OutputBufferPipeline
// ---------------------------------------------------------------------------

/// Per-terminal output queues with an adaptive flush interval.
///
/// The pipeline never reads the clock itself: callers pass `now`, and drive
/// the timer from [`next_deadline`](Self::next_deadline). Each flush
/// publishes `OutputBatch` on the event bus and hands the batch to every
/// registered [`BatchConsumer`].
pub struct OutputBufferPipeline {
    intervals: Intervals,
    large_chunk_threshold: usize,
    max_queue_entries: usize,
    states: HashMap<TerminalId, BufferState>,
    consumers: Vec<Arc<dyn BatchConsumer>>,
    bus: EventBus,
}

impl OutputBufferPipeline {
    pub fn new(config: &BufferConfig, bus: EventBus) -> Self {
        Self {
            intervals: Intervals {
                normal: Duration::from_millis(config.normal_interval_ms),
                fast: Duration::from_millis(config.fast_interval_ms),
                min: Duration::from_millis(config.min_interval_ms),
                max: Duration::from_millis(config.max_interval_ms),
            },
            large_chunk_threshold: config.large_chunk_threshold,
            max_queue_entries: config.max_queue_entries,
            states: HashMap::new(),
            consumers: Vec::new(),
            bus,
        }
    }

    pub fn add_consumer(&mut self, consumer: Arc<dyn BatchConsumer>) {
        self.consumers.push(consumer);
    }

    /// Start tracking a terminal in `Normal` mode. Resets any prior state.
    pub fn register(&mut self, id: TerminalId) {
        let interval = self.intervals.base(FlushMode::Normal);
        self.states.insert(id, BufferState::new(interval));
    }

    /// Decode raw PTY bytes and queue the resulting text.
    pub fn push_bytes(&mut self, id: TerminalId, bytes: &[u8], now: Instant) -> Option<OutputBatch> {
        let text = self.state_mut(id).carry.decode(bytes);
        if text.is_empty() {
            return None;
        }
        self.push(id, text, now)
    }

    /// Queue a chunk. Returns the batch if the chunk triggered an immediate
    /// flush (large chunk or queue overflow).
    pub fn push(&mut self, id: TerminalId, text: String, now: Instant) -> Option<OutputBatch> {
        let large = text.chars().count() > self.large_chunk_threshold;
        let max_queue_entries = self.max_queue_entries;
        let intervals = self.intervals;
        let state = self.state_mut(id);
        state.queue.push_back(QueuedChunk { text, at: now });

        if large {
            return self.flush(id, FlushReason::LargeChunk, now);
        }

        if state.queue.len() > max_queue_entries {
            let queued = state.queue.len();
            state.overflow_count += 1;
            state.pressured = true;
            state.current_interval = intervals.clamp(state.current_interval / 2);
            let overflow_count = state.overflow_count;
            warn!(
                component = COMPONENT,
                terminal_id = %id,
                queued,
                overflow_count,
                interval_ms = state.current_interval.as_millis() as u64,
                "output queue overflow, forcing flush"
            );
            self.bus.publish(SessionEvent::Overflow {
                terminal_id: id,
                queued,
                overflow_count,
            });
            return self.flush(id, FlushReason::Overflow, now);
        }
        None
    }

    /// When the oldest queued chunk should be flushed, if anything is queued.
    pub fn next_deadline(&self, id: TerminalId) -> Option<Instant> {
        let state = self.states.get(&id)?;
        state
            .queue
            .front()
            .map(|first| first.at + state.current_interval)
    }

    /// Timer tick: flush if the deadline has passed.
    pub fn flush_due(&mut self, id: TerminalId, now: Instant) -> Option<OutputBatch> {
        let deadline = self.next_deadline(id)?;
        if now < deadline {
            return None;
        }
        let intervals = self.intervals;
        let state = self.state_mut(id);
        if state.pressured {
            state.pressured = false;
        } else {
            state.current_interval = intervals.base(state.mode);
        }
        self.flush(id, FlushReason::Timer, now)
    }

    /// Flush whatever is queued now, without touching the interval. A
    /// held-back partial character stays held back.
    pub fn flush_pending(&mut self, id: TerminalId, now: Instant) -> Option<OutputBatch> {
        self.flush(id, FlushReason::Input, now)
    }

    /// Disarm the timer, draining whatever is queued (including a held-back
    /// partial character) as a final batch.
    pub fn cancel(&mut self, id: TerminalId, now: Instant) -> Option<OutputBatch> {
        let state = self.states.get_mut(&id)?;
        if state.carry.has_pending() {
            let rest = state.carry.finish();
            state.queue.push_back(QueuedChunk { text: rest, at: now });
        }
        self.flush(id, FlushReason::Cancel, now)
    }

    /// Stop tracking a terminal. Anything still queued is dropped.
    pub fn remove(&mut self, id: TerminalId) {
        if let Some(state) = self.states.remove(&id) {
            if !state.queue.is_empty() {
                debug!(component = COMPONENT, terminal_id = %id, dropped = state.queue.len(), "buffer removed with queued output");
            }
        }
    }

    /// Switch pacing regime; the interval resets to the new mode's base.
    /// Unregistered terminals are ignored.
    pub fn set_mode(&mut self, id: TerminalId, mode: FlushMode) {
        let base = self.intervals.base(mode);
        let Some(state) = self.states.get_mut(&id) else {
            return;
        };
        if state.mode == mode {
            return;
        }
        state.mode = mode;
        state.current_interval = base;
        state.pressured = false;
        debug!(component = COMPONENT, terminal_id = %id, ?mode, interval_ms = base.as_millis() as u64, "flush mode changed");
    }

    pub fn mode(&self, id: TerminalId) -> Option<FlushMode> {
        self.states.get(&id).map(|s| s.mode)
    }

    pub fn current_interval(&self, id: TerminalId) -> Option<Duration> {
        self.states.get(&id).map(|s| s.current_interval)
    }

    pub fn overflow_count(&self, id: TerminalId) -> u64 {
        self.states.get(&id).map_or(0, |s| s.overflow_count)
    }

    pub fn queued(&self, id: TerminalId) -> usize {
        self.states.get(&id).map_or(0, |s| s.queue.len())
    }

    pub fn last_flush_at(&self, id: TerminalId) -> Option<Instant> {
        self.states.get(&id).and_then(|s| s.last_flush_at)
    }

    pub fn is_drained(&self, id: TerminalId) -> bool {
        self.states
            .get(&id)
            .map_or(true, |s| s.queue.is_empty() && !s.carry.has_pending())
    }

    fn state_mut(&mut self, id: TerminalId) -> &mut BufferState {
        let interval = self.intervals.base(FlushMode::Normal);
        self.states
            .entry(id)
            .or_insert_with(|| BufferState::new(interval))
    }

    fn flush(&mut self, id: TerminalId, reason: FlushReason, now: Instant) -> Option<OutputBatch> {
        let state = self.states.get_mut(&id)?;
        if state.queue.is_empty() {
            return None;
        }
        let chunks = state.queue.len();
        let mut data = String::with_capacity(state.queue.iter().map(|c| c.text.len()).sum());
        for chunk in state.queue.drain(..) {
            data.push_str(&chunk.text);
        }
        state.last_flush_at = Some(now);

        let batch = OutputBatch {
            terminal_id: id,
            data,
            chunks,
            reason,
        };
        self.deliver(&batch);
        Some(batch)
    }

    fn deliver(&self, batch: &OutputBatch) {
        self.bus.publish(SessionEvent::OutputBatch {
            terminal_id: batch.terminal_id,
            data: batch.data.clone(),
        });
        for consumer in &self.consumers {
            match catch_unwind(AssertUnwindSafe(|| consumer.on_batch(batch))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(component = COMPONENT, terminal_id = %batch.terminal_id, "batch consumer failed: {e:#}");
                }
                Err(_) => {
                    error!(component = COMPONENT, terminal_id = %batch.terminal_id, "batch consumer panicked");
                }
            }
        }
    }
}

impl std::fmt::Debug for OutputBufferPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBufferPipeline")
            .field("terminals", &self.states.len())
            .field("consumers", &self.consumers.len())
            .finish()
    }
}
