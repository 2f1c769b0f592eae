//! Self-auditing blockage state tracker.
//!
//! [`BlockageStateTracker`] is a [`BlockedThreadListener`] that checks the
//! call-ordering contract every listener relies on: `blocked` and `unblocked`
//! alternate, `blocked_interval` only arrives while blocked, and timestamps
//! never go backwards. Violations are reported, never raised, and the state
//! machine keeps going so later events are still judged correctly.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::error::{ErrorReporter, InternalErrorKind};
use crate::listener::BlockedThreadListener;

/// State observed by a tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerState {
    /// Whether a blockage is in progress.
    pub blocked: bool,
    /// Highest-water timestamp, or the latest one after a regression.
    pub last_timestamp: i64,
}

/// Listener that validates the blocked/unblocked protocol.
///
/// Events are expected from the monitor thread only. The internal mutex keeps
/// each handler's read-modify-write atomic, but it cannot restore a total
/// order between concurrent callers; that is still the caller's job.
pub struct BlockageStateTracker {
    state: Mutex<TrackerState>,
    reporter: Arc<dyn ErrorReporter>,
}

impl BlockageStateTracker {
    /// Create a tracker reporting violations to `reporter`.
    #[must_use]
    pub fn new(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            reporter,
        }
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> TrackerState {
        *self.state.lock()
    }

    /// Whether a blockage is in progress.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    /// Last timestamp seen.
    #[must_use]
    pub fn last_timestamp(&self) -> i64 {
        self.state.lock().last_timestamp
    }

    fn expect_blocked(&self, state: &TrackerState, expected: bool, callback: &str) {
        if state.blocked != expected {
            let message = format!(
                "{callback} called with blocked={}, expected blocked={expected}",
                state.blocked
            );
            self.reporter
                .report(InternalErrorKind::UnbalancedCall, &message, None);
        }
    }

    fn advance_timestamp(&self, state: &mut TrackerState, timestamp: i64) {
        if timestamp < state.last_timestamp {
            let message = format!(
                "Timestamp went backwards: {timestamp} < {}",
                state.last_timestamp
            );
            self.reporter
                .report(InternalErrorKind::TimeTravel, &message, None);
        }
        // Track the latest value even after a regression so one bad reading
        // does not poison every later comparison.
        state.last_timestamp = timestamp;
    }
}

impl BlockedThreadListener for BlockageStateTracker {
    fn on_thread_blocked(&self, _thread: ThreadId, timestamp: i64) {
        let mut state = self.state.lock();
        self.expect_blocked(&state, false, "on_thread_blocked");
        state.blocked = true;
        self.advance_timestamp(&mut state, timestamp);
    }

    fn on_thread_blocked_interval(&self, _thread: ThreadId, timestamp: i64) {
        let mut state = self.state.lock();
        self.expect_blocked(&state, true, "on_thread_blocked_interval");
        self.advance_timestamp(&mut state, timestamp);
    }

    fn on_thread_unblocked(&self, _thread: ThreadId, timestamp: i64) {
        let mut state = self.state.lock();
        self.expect_blocked(&state, true, "on_thread_unblocked");
        state.blocked = false;
        self.advance_timestamp(&mut state, timestamp);
    }
}

impl std::fmt::Debug for BlockageStateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockageStateTracker")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
