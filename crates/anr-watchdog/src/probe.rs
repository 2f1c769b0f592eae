//! Probe scheduling on the monitored thread.
//!
//! The scheduler posts a tagged probe task onto the monitored thread's queue
//! and learns the thread is responsive in one of two ways: the probe runs, or
//! the queue reports that it has gone idle. Idle notifications are not
//! available on every queue, so both paths exist; within one probe cycle the
//! first signal wins and the other is dropped.
//!
//! Nothing here ever waits on the monitored thread. Responses are timestamped
//! where they happen and handed to the monitor thread through a
//! [`MonitorDispatch`], where the response action runs after a thread check.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::clock::Clock;
use crate::error::ErrorReporter;
use crate::looper::TaskQueue;
use crate::thread::{MonitorThreadHandle, enforce_thread};
use crate::worker::MonitorDispatch;

/// Base tag of probe tokens (arbitrary).
pub const HEARTBEAT_REQUEST: u64 = 34593;

const NO_PROBE: u64 = 0;

/// Tag identifying one probe task among other work on the monitored queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeToken(u64);

impl ProbeToken {
    /// Raw token value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Invoked on the monitor thread with the time the monitored thread responded.
pub type ResponseAction = Arc<dyn Fn(i64) + Send + Sync + 'static>;

/// Sends probes to the monitored thread and relays its responses.
pub struct ProbeScheduler {
    queue: Arc<dyn TaskQueue>,
    dispatcher: Arc<dyn MonitorDispatch>,
    monitor_thread: MonitorThreadHandle,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ErrorReporter>,
    action: ResponseAction,
    idle_handler_enabled: bool,
    started: AtomicBool,
    idle_installed: AtomicBool,
    outstanding: AtomicU64,
    next_token: AtomicU64,
    responded: AtomicBool,
}

impl ProbeScheduler {
    /// Create a scheduler for `queue`.
    ///
    /// `action` runs on the monitor thread for every accepted response.
    #[must_use]
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        dispatcher: Arc<dyn MonitorDispatch>,
        monitor_thread: MonitorThreadHandle,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn ErrorReporter>,
        idle_handler_enabled: bool,
        action: ResponseAction,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            dispatcher,
            monitor_thread,
            clock,
            reporter,
            action,
            idle_handler_enabled,
            started: AtomicBool::new(false),
            idle_installed: AtomicBool::new(false),
            outstanding: AtomicU64::new(NO_PROBE),
            next_token: AtomicU64::new(HEARTBEAT_REQUEST),
            responded: AtomicBool::new(false),
        })
    }

    /// Attach the idle callback if enabled. Idempotent and non-blocking.
    ///
    /// There is no matching detach: the callback drops itself once the
    /// scheduler is gone.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) || !self.idle_handler_enabled {
            return;
        }

        let scheduler = Arc::downgrade(self);
        let installed = self.queue.add_idle_handler(Box::new(move || {
            Weak::upgrade(&scheduler).is_some_and(|s| s.on_queue_idle())
        }));
        self.idle_installed.store(installed, Ordering::Release);

        if installed {
            tracing::debug!(thread = ?self.queue.thread_id(), "Idle handler installed");
        } else {
            tracing::warn!(
                thread = ?self.queue.thread_id(),
                "Queue does not support idle handlers, relying on probe delivery"
            );
        }
    }

    /// Whether [`start`](Self::start) has run.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether the idle callback is attached to the queue.
    #[must_use]
    pub fn is_idle_handler_installed(&self) -> bool {
        self.idle_installed.load(Ordering::Acquire)
    }

    /// Whether a probe has been posted but not yet delivered.
    #[must_use]
    pub fn has_outstanding_probe(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) != NO_PROBE
    }

    /// Token of the outstanding probe, if any.
    #[must_use]
    pub fn outstanding_probe(&self) -> Option<ProbeToken> {
        match self.outstanding.load(Ordering::Acquire) {
            NO_PROBE => None,
            token => Some(ProbeToken(token)),
        }
    }

    /// Begin a probe cycle by posting a fresh probe, unless one is still pending.
    ///
    /// Returns `true` if a probe was posted.
    pub fn send_probe(self: &Arc<Self>) -> bool {
        if self.has_outstanding_probe() {
            return false;
        }

        let token = self.next_token.fetch_add(1, Ordering::AcqRel);
        self.outstanding.store(token, Ordering::Release);
        self.responded.store(false, Ordering::Release);

        let scheduler = Arc::downgrade(self);
        let posted = self.queue.post(Box::new(move || {
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.deliver_probe(ProbeToken(token));
            }
        }));

        if !posted {
            self.outstanding.store(NO_PROBE, Ordering::Release);
            tracing::warn!(thread = ?self.queue.thread_id(), "Monitored queue rejected probe");
        }
        posted
    }

    /// Idle notification from the monitored queue. Always asks to stay registered.
    pub fn on_queue_idle(&self) -> bool {
        self.respond();
        true
    }

    /// A probe ran on the monitored thread.
    ///
    /// Stale or foreign tokens are ignored. When the idle callback is
    /// installed it is the authoritative signal and the probe only closes
    /// the cycle.
    pub fn deliver_probe(&self, token: ProbeToken) {
        let matched = self
            .outstanding
            .compare_exchange(token.0, NO_PROBE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !matched {
            tracing::trace!(token = token.0, "Ignoring stale probe");
            return;
        }
        if !self.is_idle_handler_installed() {
            self.respond();
        }
    }

    fn respond(&self) {
        if self.responded.swap(true, Ordering::AcqRel) {
            return;
        }

        let timestamp = self.clock.now_ms();
        let action = Arc::clone(&self.action);
        let monitor_thread = self.monitor_thread.clone();
        let reporter = Arc::clone(&self.reporter);
        let dispatched = self.dispatcher.dispatch(Box::new(move || {
            // A violation is reported; the response itself is still applied.
            enforce_thread(&monitor_thread, reporter.as_ref());
            action(timestamp);
        }));
        if !dispatched {
            tracing::warn!(timestamp, "Monitor worker gone, dropping response");
        }
    }
}

impl std::fmt::Debug for ProbeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeScheduler")
            .field("thread", &self.queue.thread_id())
            .field("started", &self.is_started())
            .field("idle_installed", &self.is_idle_handler_installed())
            .field("outstanding", &self.outstanding_probe())
            .finish_non_exhaustive()
    }
}
