//! Test doubles for the watchdog's collaborator traits.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::thread::ThreadId;

use anr_watchdog::native::NativeSample;
use anr_watchdog::{
    Bitness, BlockageEvent, BlockageEventKind, BlockageSource, BlockedThreadListener, Clock,
    InternalErrorKind, NativeError, NativeSampler, Unwinder,
};

/// Clock under test control.
#[derive(Debug, Default)]
pub struct FakeClock {
    now: AtomicI64,
}

impl FakeClock {
    /// Clock reading `start`.
    #[must_use]
    pub fn at(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Set the current time.
    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    /// Move time forward by `ms` and return the new reading.
    pub fn advance(&self, ms: i64) -> i64 {
        self.now.fetch_add(ms, Ordering::SeqCst) + ms
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// One call to [`RecordingReporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Classification.
    pub kind: InternalErrorKind,
    /// Diagnostic message.
    pub message: String,
    /// Rendered cause, if one was given.
    pub cause: Option<String>,
}

/// Error reporter that keeps every report.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<Report>>,
}

impl RecordingReporter {
    /// All reports so far.
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    /// Kinds of all reports so far.
    pub fn kinds(&self) -> Vec<InternalErrorKind> {
        self.reports.lock().iter().map(|r| r.kind).collect()
    }

    /// Number of reports of `kind`.
    pub fn count(&self, kind: InternalErrorKind) -> usize {
        self.reports.lock().iter().filter(|r| r.kind == kind).count()
    }

    /// Messages of all reports so far.
    pub fn messages(&self) -> Vec<String> {
        self.reports.lock().iter().map(|r| r.message.clone()).collect()
    }
}

impl anr_watchdog::ErrorReporter for RecordingReporter {
    fn report(&self, kind: InternalErrorKind, message: &str, cause: Option<&dyn StdError>) {
        self.reports.lock().push(Report {
            kind,
            message: message.to_string(),
            cause: cause.map(ToString::to_string),
        });
    }
}

/// Listener that records every event it receives, and on which thread.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(BlockageEvent, ThreadId)>>,
}

impl RecordingListener {
    /// Events received so far.
    pub fn events(&self) -> Vec<BlockageEvent> {
        self.events.lock().iter().map(|(e, _)| *e).collect()
    }

    /// Kinds of the events received so far.
    pub fn kinds(&self) -> Vec<BlockageEventKind> {
        self.events.lock().iter().map(|(e, _)| e.kind).collect()
    }

    /// Number of events of `kind`.
    pub fn count(&self, kind: BlockageEventKind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(e, _)| e.kind == kind)
            .count()
    }

    /// Threads the callbacks ran on.
    pub fn delivery_threads(&self) -> Vec<ThreadId> {
        self.events.lock().iter().map(|(_, t)| *t).collect()
    }

    fn record(&self, event: BlockageEvent) {
        self.events
            .lock()
            .push((event, std::thread::current().id()));
    }
}

impl BlockedThreadListener for RecordingListener {
    fn on_thread_blocked(&self, thread: ThreadId, timestamp: i64) {
        self.record(BlockageEvent::blocked(thread, timestamp));
    }

    fn on_thread_blocked_interval(&self, thread: ThreadId, timestamp: i64) {
        self.record(BlockageEvent::blocked_interval(thread, timestamp));
    }

    fn on_thread_unblocked(&self, thread: ThreadId, timestamp: i64) {
        self.record(BlockageEvent::unblocked(thread, timestamp));
    }
}

/// Outcome of one scripted native install step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeOutcome {
    /// The call succeeds.
    Accept,
    /// The call returns `false`.
    Reject,
    /// The native library is missing.
    Unlinked,
}

impl NativeOutcome {
    fn apply(self, symbol: &str) -> Result<bool, NativeError> {
        match self {
            Self::Accept => Ok(true),
            Self::Reject => Ok(false),
            Self::Unlinked => Err(NativeError::link_error(symbol)),
        }
    }
}

/// Native sampler whose `setup` results follow a script.
///
/// Once the script is exhausted every call succeeds.
#[derive(Debug, Default)]
pub struct ScriptedNativeSampler {
    setup_script: Mutex<VecDeque<NativeOutcome>>,
    setups: AtomicUsize,
    monitors: AtomicUsize,
    starts: Mutex<Vec<(Unwinder, u64)>>,
    finishes: AtomicUsize,
    monitored: Mutex<Option<ThreadId>>,
}

impl ScriptedNativeSampler {
    /// Sampler that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sampler whose first `setup` calls return `outcomes` in order.
    #[must_use]
    pub fn with_setup_script(outcomes: impl IntoIterator<Item = NativeOutcome>) -> Self {
        Self {
            setup_script: Mutex::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Number of `setup` calls.
    pub fn setup_calls(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }

    /// Number of `monitor_current_thread` calls.
    pub fn monitor_calls(&self) -> usize {
        self.monitors.load(Ordering::SeqCst)
    }

    /// Arguments of every `start_sampling` call.
    pub fn starts(&self) -> Vec<(Unwinder, u64)> {
        self.starts.lock().clone()
    }

    /// Number of `finish_sampling` calls.
    pub fn finish_calls(&self) -> usize {
        self.finishes.load(Ordering::SeqCst)
    }

    /// Thread passed to the last successful `monitor_current_thread`.
    pub fn monitored_thread(&self) -> Option<ThreadId> {
        *self.monitored.lock()
    }
}

impl NativeSampler for ScriptedNativeSampler {
    fn setup(&self, _bitness: Bitness) -> Result<bool, NativeError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .setup_script
            .lock()
            .pop_front()
            .unwrap_or(NativeOutcome::Accept);
        outcome.apply("native_sampler_setup")
    }

    fn monitor_current_thread(&self) -> Result<bool, NativeError> {
        self.monitors.fetch_add(1, Ordering::SeqCst);
        *self.monitored.lock() = Some(std::thread::current().id());
        Ok(true)
    }

    fn start_sampling(&self, unwinder: Unwinder, interval_ms: u64) {
        self.starts.lock().push((unwinder, interval_ms));
    }

    fn finish_sampling(&self) -> Option<Vec<NativeSample>> {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        Some(vec![NativeSample {
            timestamp_ms: 0,
            frames: vec![0x1000, 0x2000, 0x3000],
            result: 0,
        }])
    }
}

/// Blockage source that only collects registrations.
#[derive(Default)]
pub struct CollectingSource {
    registered: AtomicUsize,
    listeners: Mutex<Vec<Arc<dyn BlockedThreadListener>>>,
}

impl CollectingSource {
    /// Number of listeners registered.
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::SeqCst)
    }

    /// Deliver `event` to every registered listener.
    pub fn emit(&self, event: BlockageEvent) {
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            event.deliver_to(listener.as_ref());
        }
    }
}

impl std::fmt::Debug for CollectingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectingSource")
            .field("registered", &self.registered())
            .finish_non_exhaustive()
    }
}

impl BlockageSource for CollectingSource {
    fn add_blocked_thread_listener(&self, listener: Arc<dyn BlockedThreadListener>) {
        self.registered.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push(listener);
    }
}
