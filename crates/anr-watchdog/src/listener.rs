//! Blocked thread listeners and event broadcast.
//!
//! Every listener registered with a [`ListenerRegistry`] receives the same
//! events in the same order. Delivery is isolated per listener: a listener
//! that panics is reported and skipped, and the next one still gets the event.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::ThreadId;

use crate::error::{ErrorReporter, InternalErrorKind};

/// Consumer of blockage notifications.
///
/// Calls arrive on the monitor thread in a single total order:
/// `blocked`, zero or more `blocked_interval`, `unblocked`, repeat.
/// Implementations must not block and must not assume they can call back
/// into the monitored thread.
pub trait BlockedThreadListener: Send + Sync {
    /// The monitored thread stopped responding; `timestamp` is its last response.
    fn on_thread_blocked(&self, thread: ThreadId, timestamp: i64);

    /// The monitored thread is still blocked at `timestamp`.
    fn on_thread_blocked_interval(&self, thread: ThreadId, timestamp: i64);

    /// The monitored thread responded again at `timestamp`.
    fn on_thread_unblocked(&self, thread: ThreadId, timestamp: i64);
}

/// Kind of a blockage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockageEventKind {
    /// First detection of a blockage.
    Blocked,
    /// Periodic confirmation while still blocked.
    BlockedInterval,
    /// Responsiveness resumed.
    Unblocked,
}

/// A blockage notification for one monitored thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockageEvent {
    /// What happened.
    pub kind: BlockageEventKind,
    /// The monitored thread.
    pub thread: ThreadId,
    /// Wall-clock reading in milliseconds.
    pub timestamp: i64,
}

impl BlockageEvent {
    /// Create a `Blocked` event.
    #[must_use]
    pub fn blocked(thread: ThreadId, timestamp: i64) -> Self {
        Self {
            kind: BlockageEventKind::Blocked,
            thread,
            timestamp,
        }
    }

    /// Create a `BlockedInterval` event.
    #[must_use]
    pub fn blocked_interval(thread: ThreadId, timestamp: i64) -> Self {
        Self {
            kind: BlockageEventKind::BlockedInterval,
            thread,
            timestamp,
        }
    }

    /// Create an `Unblocked` event.
    #[must_use]
    pub fn unblocked(thread: ThreadId, timestamp: i64) -> Self {
        Self {
            kind: BlockageEventKind::Unblocked,
            thread,
            timestamp,
        }
    }

    /// Invoke the matching callback on `listener`.
    pub fn deliver_to(&self, listener: &dyn BlockedThreadListener) {
        match self.kind {
            BlockageEventKind::Blocked => listener.on_thread_blocked(self.thread, self.timestamp),
            BlockageEventKind::BlockedInterval => {
                listener.on_thread_blocked_interval(self.thread, self.timestamp);
            }
            BlockageEventKind::Unblocked => {
                listener.on_thread_unblocked(self.thread, self.timestamp);
            }
        }
    }
}

/// Ordered set of listeners receiving broadcast events.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn BlockedThreadListener>>>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener; it receives every event broadcast from now on.
    pub fn add(&self, listener: Arc<dyn BlockedThreadListener>) {
        self.listeners.write().push(listener);
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver `event` to every listener in registration order.
    ///
    /// Returns how many listeners completed without panicking.
    pub fn broadcast(&self, event: BlockageEvent, reporter: &dyn ErrorReporter) -> usize {
        // A listener may register another listener while handling the event.
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();

        let mut delivered = 0usize;
        for (index, listener) in listeners.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| event.deliver_to(listener.as_ref())));
            match outcome {
                Ok(()) => delivered = delivered.saturating_add(1),
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    let message =
                        format!("Listener #{index} panicked handling {:?}: {reason}", event.kind);
                    reporter.report(InternalErrorKind::ListenerPanicked, &message, None);
                }
            }
        }
        delivered
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listener_count", &self.len())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
