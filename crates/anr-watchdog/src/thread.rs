//! Monitor thread identity.
//!
//! Blockage callbacks must only ever run on the monitor thread; running one on
//! the monitored thread would reintroduce the blocking the watchdog exists to
//! detect. [`MonitorThreadHandle`] records which thread that is, and
//! [`enforce_thread`] checks it before every dispatch.

use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::error::{ErrorReporter, InternalErrorKind};

/// Shared, reassignable identity of the monitor thread.
///
/// Cloning yields another handle to the same slot, so a recreated monitor
/// thread can re-register itself and every holder observes the change.
#[derive(Debug, Clone, Default)]
pub struct MonitorThreadHandle {
    inner: Arc<RwLock<Option<ThreadId>>>,
}

impl MonitorThreadHandle {
    /// Create an unassigned handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the calling thread as the monitor thread.
    pub fn set_current(&self) {
        self.set(thread::current().id());
    }

    /// Record `id` as the monitor thread.
    pub fn set(&self, id: ThreadId) {
        *self.inner.write() = Some(id);
    }

    /// Forget the monitor thread.
    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    /// The recorded monitor thread, if any.
    #[must_use]
    pub fn get(&self) -> Option<ThreadId> {
        *self.inner.read()
    }

    /// Whether the calling thread is the recorded monitor thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.get() == Some(thread::current().id())
    }
}

/// Check that the caller runs on the monitor thread.
///
/// Returns `false` and reports [`InternalErrorKind::WrongThread`] otherwise.
/// The check never panics; callers decide whether to carry on.
pub fn enforce_thread(handle: &MonitorThreadHandle, reporter: &dyn ErrorReporter) -> bool {
    let current = thread::current();
    match handle.get() {
        Some(expected) if expected == current.id() => true,
        expected => {
            let message = format!(
                "Expected monitor thread {expected:?} but running on {:?} ({})",
                current.id(),
                current.name().unwrap_or("<unnamed>"),
            );
            reporter.report(InternalErrorKind::WrongThread, &message, None);
            false
        }
    }
}
