use std::sync::{Arc, Mutex};

use td_core::types::SessionEvent;
use tracing::warn;

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](EventBus::subscribe) creates a new receiver that
/// gets every event published after the subscription was created. Clones
/// share the same subscriber list.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<SessionEvent>>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<SessionEvent> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    /// Publish an event to all current subscribers.
    ///
    /// Subscribers whose receivers have been dropped are pruned.
    pub fn publish(&self, event: SessionEvent) {
        self.senders().retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Return the number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }

    fn senders(&self) -> std::sync::MutexGuard<'_, Vec<flume::Sender<SessionEvent>>> {
        self.inner.lock().unwrap_or_else(|e| {
            warn!("EventBus lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
