//! ANR capture service.
//!
//! [`AnrService`] wires the pieces together: a [`MonitorWorker`] ticking at
//! the sampling interval, a [`ProbeScheduler`] probing the monitored queue, a
//! [`BlockedThreadDetector`] deciding when the thread is blocked, and a
//! [`ListenerRegistry`] broadcasting the resulting events. A
//! [`BlockageStateTracker`] is always registered first so that ordering
//! faults in the pipeline are reported even without other listeners.

use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::ConfigService;
use crate::detector::BlockedThreadDetector;
use crate::error::{ErrorReporter, InternalErrorKind, WatchdogError, WatchdogResult};
use crate::listener::{BlockageEvent, BlockedThreadListener, ListenerRegistry, panic_message};
use crate::looper::TaskQueue;
use crate::native::BlockageSource;
use crate::probe::ProbeScheduler;
use crate::thread::{MonitorThreadHandle, enforce_thread};
use crate::tracker::BlockageStateTracker;
use crate::worker::{MonitorDispatch, MonitorWorker};

/// Name of the monitor thread.
pub const MONITOR_THREAD_NAME: &str = "anr-monitor";

/// Whether the host was visible when the service was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AppState {
    /// The host is in the foreground.
    #[default]
    Foreground,
    /// The host is in the background; capture stops after
    /// `background_check_delay_ms` unless it comes to the foreground first.
    Background,
}

/// Fans detector output out to every registered listener.
struct Broadcaster {
    listeners: ListenerRegistry,
    config: Arc<ConfigService>,
    monitor_thread: MonitorThreadHandle,
    reporter: Arc<dyn ErrorReporter>,
}

impl Broadcaster {
    fn send(&self, event: BlockageEvent) {
        enforce_thread(&self.monitor_thread, self.reporter.as_ref());
        self.listeners.broadcast(event, self.reporter.as_ref());
    }
}

impl BlockedThreadListener for Broadcaster {
    fn on_thread_blocked(&self, thread: ThreadId, timestamp: i64) {
        self.send(BlockageEvent::blocked(thread, timestamp));
    }

    fn on_thread_blocked_interval(&self, thread: ThreadId, timestamp: i64) {
        if self.config.is_anr_capture_enabled() {
            self.send(BlockageEvent::blocked_interval(thread, timestamp));
        }
    }

    fn on_thread_unblocked(&self, thread: ThreadId, timestamp: i64) {
        self.send(BlockageEvent::unblocked(thread, timestamp));
    }
}

struct ServiceCore {
    config: Arc<ConfigService>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ErrorReporter>,
    worker: Arc<MonitorWorker>,
    scheduler: Arc<ProbeScheduler>,
    detector: Arc<Mutex<BlockedThreadDetector>>,
    broadcaster: Arc<Broadcaster>,
    tracker: Arc<BlockageStateTracker>,
    capturing: AtomicBool,
    in_background: AtomicBool,
    background_check_pending: AtomicBool,
}

impl ServiceCore {
    /// Runs on the monitor thread.
    fn begin_capture(self: &Arc<Self>) {
        let config = self.config.config();
        self.scheduler.start();
        {
            let mut detector = self.detector.lock();
            detector.apply_config(&config);
            // Time spent before capture must not count as a blockage.
            detector.reset();
        }

        let core = Arc::downgrade(self);
        let period = Duration::from_millis(config.sampling_interval_ms);
        let scheduled = self.worker.schedule_at_fixed_rate(period, move || {
            if let Some(core) = Weak::upgrade(&core) {
                core.check_heartbeat();
            }
        });
        match scheduled {
            Ok(()) => tracing::info!(
                interval_ms = config.sampling_interval_ms,
                threshold_ms = config.blocked_threshold_ms,
                "ANR capture started"
            ),
            Err(e) => self.reporter.report(
                InternalErrorKind::HeartbeatCheckFailed,
                "Failed to schedule heartbeat",
                Some(&e),
            ),
        }
    }

    /// Runs on the monitor thread.
    fn end_capture(&self) {
        if self.worker.cancel_tick() {
            tracing::info!("ANR capture stopped");
        } else {
            self.reporter.report(
                InternalErrorKind::HeartbeatStopFailed,
                "No heartbeat was scheduled while capture was running",
                None,
            );
        }
    }

    /// Runs on the monitor thread once the background check delay expires.
    fn stop_if_still_background(&self) {
        if !self.background_check_pending.swap(false, Ordering::AcqRel)
            || !self.in_background.load(Ordering::Acquire)
        {
            return;
        }
        if self.capturing.swap(false, Ordering::AcqRel) {
            tracing::info!("Still in the background, stopping ANR capture");
            self.end_capture();
        }
    }

    fn check_heartbeat(&self) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            if !self.scheduler.has_outstanding_probe() {
                self.scheduler.send_probe();
            }
            let now = self.clock.now_ms();
            self.detector.lock().on_monitor_tick(now);
        }));
        if let Err(payload) = result {
            let message = format!(
                "Heartbeat check panicked: {}",
                panic_message(payload.as_ref())
            );
            self.reporter
                .report(InternalErrorKind::HeartbeatCheckFailed, &message, None);
        }
    }
}

/// Watches one thread's task queue and reports when it stops responding.
///
/// All detection runs on a dedicated monitor thread. The monitored thread
/// only ever executes a tiny probe task.
///
/// # Example
///
/// ```no_run
/// use anr_watchdog::prelude::*;
/// use std::sync::Arc;
///
/// # fn main() -> WatchdogResult<()> {
/// let main_loop = Looper::spawn("main")?;
/// let service = AnrService::new(
///     Arc::new(main_loop.handle()),
///     Arc::new(ConfigService::default()),
///     Arc::new(SystemClock),
///     Arc::new(TracingErrorReporter),
/// )?;
/// service.start_capture()?;
/// # Ok(())
/// # }
/// ```
pub struct AnrService {
    core: Arc<ServiceCore>,
    target_thread: ThreadId,
}

impl AnrService {
    /// Spawn the monitor thread and wire up detection for `queue`.
    ///
    /// Capture does not begin until [`start_capture`](Self::start_capture).
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the queue cannot
    /// name its thread, or the monitor thread cannot be spawned.
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        config: Arc<ConfigService>,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> WatchdogResult<Self> {
        Self::with_app_state(queue, config, clock, reporter, AppState::Foreground)
    }

    /// Like [`new`](Self::new), for a host in `app_state`.
    ///
    /// Created in the background, the service schedules a check that stops
    /// capture after `background_check_delay_ms` unless
    /// [`on_foreground`](Self::on_foreground) runs first.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn with_app_state(
        queue: Arc<dyn TaskQueue>,
        config: Arc<ConfigService>,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn ErrorReporter>,
        app_state: AppState,
    ) -> WatchdogResult<Self> {
        let snapshot = config.config();
        snapshot.validate()?;
        let target_thread = queue
            .thread_id()
            .ok_or(WatchdogError::MonitoredThreadUnknown)?;

        let monitor_thread = MonitorThreadHandle::new();
        let worker = Arc::new(MonitorWorker::spawn(
            MONITOR_THREAD_NAME,
            monitor_thread.clone(),
            Arc::clone(&reporter),
        )?);

        let tracker = Arc::new(BlockageStateTracker::new(Arc::clone(&reporter)));
        let broadcaster = Arc::new(Broadcaster {
            listeners: ListenerRegistry::new(),
            config: Arc::clone(&config),
            monitor_thread: monitor_thread.clone(),
            reporter: Arc::clone(&reporter),
        });
        broadcaster.listeners.add(tracker.clone());

        let detector = Arc::new(Mutex::new(BlockedThreadDetector::new(
            target_thread,
            &snapshot,
            Arc::clone(&clock),
            broadcaster.clone(),
        )));

        let on_response = Arc::clone(&detector);
        let dispatcher: Arc<dyn MonitorDispatch> = worker.clone();
        let scheduler = ProbeScheduler::new(
            queue,
            dispatcher,
            monitor_thread,
            Arc::clone(&clock),
            Arc::clone(&reporter),
            snapshot.idle_handler_enabled,
            Arc::new(move |timestamp: i64| {
                on_response.lock().on_target_thread_response(timestamp);
            }),
        );

        let in_background = app_state == AppState::Background;
        let core = Arc::new(ServiceCore {
            config,
            clock,
            reporter,
            worker,
            scheduler,
            detector,
            broadcaster,
            tracker,
            capturing: AtomicBool::new(false),
            in_background: AtomicBool::new(in_background),
            background_check_pending: AtomicBool::new(in_background),
        });

        if in_background {
            let weak = Arc::downgrade(&core);
            let delay = Duration::from_millis(snapshot.background_check_delay_ms);
            core.worker.schedule_once(delay, move || {
                if let Some(core) = Weak::upgrade(&weak) {
                    core.stop_if_still_background();
                }
            })?;
            tracing::debug!(delay_ms = snapshot.background_check_delay_ms, "Background check scheduled");
        }

        Ok(Self {
            core,
            target_thread,
        })
    }

    /// Begin periodic heartbeat checks. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::WorkerStopped`] after [`shutdown`](Self::shutdown).
    pub fn start_capture(&self) -> WatchdogResult<()> {
        if self.core.capturing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let core = Arc::clone(&self.core);
        self.core
            .worker
            .submit(move || core.begin_capture())
            .inspect_err(|_| self.core.capturing.store(false, Ordering::Release))
    }

    /// Stop periodic heartbeat checks. A no-op when not capturing.
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::WorkerStopped`] after [`shutdown`](Self::shutdown).
    pub fn stop_capture(&self) -> WatchdogResult<()> {
        if !self.core.capturing.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let core = Arc::clone(&self.core);
        self.core.worker.submit(move || core.end_capture())
    }

    /// Run one heartbeat check on the monitor thread now.
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::WorkerStopped`] after [`shutdown`](Self::shutdown).
    pub fn check_heartbeat(&self) -> WatchdogResult<()> {
        let core = Arc::clone(&self.core);
        self.core.worker.submit(move || core.check_heartbeat())
    }

    /// The host came to the foreground: restart timing and capture.
    ///
    /// Time spent in the background never counts towards a blockage.
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::WorkerStopped`] after [`shutdown`](Self::shutdown).
    pub fn on_foreground(&self) -> WatchdogResult<()> {
        self.core.in_background.store(false, Ordering::Release);
        if self.core.background_check_pending.swap(false, Ordering::AcqRel) {
            tracing::debug!("Background check cancelled");
        }
        let detector = Arc::clone(&self.core.detector);
        self.core.worker.submit(move || detector.lock().reset())?;
        self.start_capture()
    }

    /// The host went to the background: stop capture.
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::WorkerStopped`] after [`shutdown`](Self::shutdown).
    pub fn on_background(&self) -> WatchdogResult<()> {
        self.core.in_background.store(true, Ordering::Release);
        self.stop_capture()
    }

    /// The process is crashing: stop capture so the crash itself is not
    /// reported as a blockage.
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::WorkerStopped`] after [`shutdown`](Self::shutdown).
    pub fn handle_crash(&self) -> WatchdogResult<()> {
        tracing::warn!("Crash reported, stopping ANR capture");
        self.stop_capture()
    }

    /// Whether capture is running.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.core.capturing.load(Ordering::Acquire)
    }

    /// Whether the heartbeat tick is scheduled on the monitor thread.
    #[must_use]
    pub fn is_heartbeat_scheduled(&self) -> bool {
        self.core.worker.has_tick()
    }

    /// Runs jobs on the monitor thread, e.g. for
    /// [`NativeThreadSampler::with_dispatcher`](crate::NativeThreadSampler::with_dispatcher).
    #[must_use]
    pub fn dispatcher(&self) -> Arc<dyn MonitorDispatch> {
        self.core.worker.clone()
    }

    /// Register `listener` for every future blockage event.
    pub fn add_blocked_thread_listener(&self, listener: Arc<dyn BlockedThreadListener>) {
        self.core.broadcaster.listeners.add(listener);
    }

    /// Number of registered listeners, including the built-in tracker.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.core.broadcaster.listeners.len()
    }

    /// The built-in state tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<BlockageStateTracker> {
        &self.core.tracker
    }

    /// The probe scheduler for the monitored queue.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<ProbeScheduler> {
        &self.core.scheduler
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &Arc<ConfigService> {
        &self.core.config
    }

    /// Identity of the monitor thread.
    #[must_use]
    pub fn monitor_thread(&self) -> &MonitorThreadHandle {
        self.core.worker.thread()
    }

    /// Thread being monitored.
    #[must_use]
    pub fn target_thread(&self) -> ThreadId {
        self.target_thread
    }

    /// Stop capture and the monitor thread. Further calls fail with
    /// [`WatchdogError::WorkerStopped`].
    pub fn shutdown(&self) {
        self.core.capturing.store(false, Ordering::Release);
        self.core.worker.cancel_tick();
        self.core.worker.shutdown();
    }
}

impl BlockageSource for AnrService {
    fn add_blocked_thread_listener(&self, listener: Arc<dyn BlockedThreadListener>) {
        Self::add_blocked_thread_listener(self, listener);
    }
}

impl Drop for AnrService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AnrService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnrService")
            .field("target_thread", &self.target_thread)
            .field("capturing", &self.is_capturing())
            .field("listeners", &self.listener_count())
            .field("worker", &self.core.worker)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::AnrConfig;
    use crate::error::TracingErrorReporter;
    use crate::looper::{IdleHandler, Task};
    use crossbeam::channel;
    use std::thread;

    /// A queue that accepts tasks but never runs them.
    struct StuckQueue {
        thread: ThreadId,
        posted: Mutex<Vec<Task>>,
    }

    impl TaskQueue for StuckQueue {
        fn post(&self, task: Task) -> bool {
            self.posted.lock().push(task);
            true
        }

        fn add_idle_handler(&self, _handler: IdleHandler) -> bool {
            false
        }

        fn thread_id(&self) -> Option<ThreadId> {
            Some(self.thread)
        }
    }

    struct NoThread;

    impl TaskQueue for NoThread {
        fn post(&self, _task: Task) -> bool {
            false
        }

        fn add_idle_handler(&self, _handler: IdleHandler) -> bool {
            false
        }

        fn thread_id(&self) -> Option<ThreadId> {
            None
        }
    }

    fn service(queue: Arc<dyn TaskQueue>) -> WatchdogResult<AnrService> {
        AnrService::new(
            queue,
            Arc::new(ConfigService::default()),
            Arc::new(SystemClock),
            Arc::new(TracingErrorReporter),
        )
    }

    fn stuck_queue() -> Arc<StuckQueue> {
        Arc::new(StuckQueue {
            thread: thread::current().id(),
            posted: Mutex::new(Vec::new()),
        })
    }

    /// Wait until every job submitted so far has run on the monitor thread.
    fn drain(service: &AnrService) -> WatchdogResult<()> {
        let (tx, rx) = channel::bounded(1);
        service.core.worker.submit(move || {
            let _ = tx.send(());
        })?;
        rx.recv_timeout(Duration::from_secs(5))
            .map_err(|e| WatchdogError::queue_closed(e.to_string()))
    }

    #[test]
    fn test_tracker_is_always_registered() -> WatchdogResult<()> {
        let service = service(stuck_queue())?;
        assert_eq!(service.listener_count(), 1);
        assert!(!service.tracker().is_blocked());
        Ok(())
    }

    #[test]
    fn test_queue_without_thread_is_rejected() {
        let result = service(Arc::new(NoThread));
        assert!(matches!(result, Err(WatchdogError::MonitoredThreadUnknown)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ConfigService::new(AnrConfig {
            sampling_interval_ms: 0,
            ..AnrConfig::default()
        });
        let result = AnrService::new(
            stuck_queue(),
            Arc::new(config),
            Arc::new(SystemClock),
            Arc::new(TracingErrorReporter),
        );
        assert!(matches!(result, Err(WatchdogError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_start_and_stop_capture() -> WatchdogResult<()> {
        let service = service(stuck_queue())?;

        service.start_capture()?;
        service.start_capture()?;
        drain(&service)?;
        assert!(service.is_capturing());
        assert!(service.core.worker.has_tick());

        service.stop_capture()?;
        drain(&service)?;
        assert!(!service.is_capturing());
        assert!(!service.core.worker.has_tick());
        Ok(())
    }

    #[test]
    fn test_heartbeat_sends_one_probe_while_outstanding() -> WatchdogResult<()> {
        let queue = stuck_queue();
        let service = service(queue.clone())?;

        for _ in 0..3 {
            service.check_heartbeat()?;
        }
        drain(&service)?;

        assert_eq!(queue.posted.lock().len(), 1);
        assert!(service.scheduler().has_outstanding_probe());
        Ok(())
    }

    #[test]
    fn test_foreground_closes_blockage_in_progress() -> WatchdogResult<()> {
        let service = service(stuck_queue())?;
        {
            let mut detector = service.core.detector.lock();
            detector.reset();
            let now = SystemClock.now_ms();
            detector.on_monitor_tick(now + 2_000);
            assert!(detector.state().blockage_in_progress);
        }
        assert!(service.tracker().is_blocked());

        service.on_foreground()?;
        drain(&service)?;

        assert!(!service.tracker().is_blocked());
        assert!(!service.core.detector.lock().state().blockage_in_progress);
        Ok(())
    }

    #[test]
    fn test_crash_stops_capture() -> WatchdogResult<()> {
        let service = service(stuck_queue())?;
        service.start_capture()?;
        drain(&service)?;
        assert!(service.is_heartbeat_scheduled());

        service.handle_crash()?;
        drain(&service)?;
        assert!(!service.is_capturing());
        assert!(!service.is_heartbeat_scheduled());
        Ok(())
    }

    #[test]
    fn test_calls_after_shutdown_fail() -> WatchdogResult<()> {
        let service = service(stuck_queue())?;
        service.shutdown();
        assert!(matches!(
            service.start_capture(),
            Err(WatchdogError::WorkerStopped)
        ));
        Ok(())
    }
}
