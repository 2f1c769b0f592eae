//! End-to-end tests driving a real looper thread and monitor thread.

use anr_test_helpers::prelude::*;
use anr_watchdog::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    main_loop: anr_watchdog::LooperThread,
    service: AnrService,
    listener: Arc<RecordingListener>,
    reporter: Arc<RecordingReporter>,
}

fn fast_config() -> AnrConfigBuilder {
    AnrConfig::builder()
        .sampling_interval_ms(20)
        .blocked_threshold_ms(300)
}

impl Harness {
    fn new(idle_handler_enabled: bool) -> Result<Self, Box<dyn std::error::Error>> {
        let config = fast_config()
            .idle_handler_enabled(idle_handler_enabled)
            .build()?;
        Self::with_state(config, AppState::Foreground)
    }

    fn with_state(config: AnrConfig, app_state: AppState) -> Result<Self, Box<dyn std::error::Error>> {
        let main_loop = Looper::spawn("main")?;
        let reporter = Arc::new(RecordingReporter::default());
        let service = AnrService::with_app_state(
            Arc::new(main_loop.handle()),
            Arc::new(ConfigService::new(config)),
            Arc::new(SystemClock),
            reporter.clone(),
            app_state,
        )?;
        let listener = Arc::new(RecordingListener::default());
        service.add_blocked_thread_listener(listener.clone());
        Ok(Self {
            main_loop,
            service,
            listener,
            reporter,
        })
    }

    fn block_main_thread(&self, duration: Duration) -> bool {
        self.main_loop
            .handle()
            .post(Box::new(move || thread::sleep(duration)))
    }
}

#[test]
fn test_responsive_thread_never_reports_blockage() -> TestResult {
    let harness = Harness::new(false)?;
    harness.service.start_capture()?;

    // Keep the main thread busy with short tasks, each well under the deadline.
    for _ in 0..25 {
        assert!(harness.block_main_thread(Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(20));
    }
    harness.service.stop_capture()?;

    assert!(harness.listener.events().is_empty());
    assert!(!harness.service.tracker().is_blocked());
    assert!(harness.service.scheduler().is_started());
    Ok(())
}

#[test]
fn test_blockage_reported_once_then_intervals_then_unblocked() -> TestResult {
    let harness = Harness::new(false)?;
    harness.service.start_capture()?;
    thread::sleep(Duration::from_millis(100));

    assert!(harness.block_main_thread(Duration::from_millis(900)));
    assert_eventually!(WAIT, || harness
        .listener
        .count(BlockageEventKind::Unblocked)
        == 1);
    harness.service.stop_capture()?;

    let events = harness.listener.events();
    assert_balanced!(&events);
    assert_eq!(harness.listener.count(BlockageEventKind::Blocked), 1);
    assert_eq!(harness.listener.count(BlockageEventKind::Unblocked), 1);
    assert!(harness.listener.count(BlockageEventKind::BlockedInterval) >= 3);

    let blocked = must_some(events.first().copied(), "expected a blocked event");
    let unblocked = must_some(events.last().copied(), "expected an unblocked event");
    assert_eq!(blocked.kind, BlockageEventKind::Blocked);
    assert_eq!(unblocked.kind, BlockageEventKind::Unblocked);
    assert!(unblocked.timestamp >= blocked.timestamp);
    assert_eq!(blocked.thread, harness.service.target_thread());

    // The first interval comes from the tick that crossed the deadline.
    let first_interval = must_some(events.get(1).copied(), "expected an interval");
    assert_eq!(first_interval.kind, BlockageEventKind::BlockedInterval);
    assert!(first_interval.timestamp - blocked.timestamp > 300);

    let intervals: Vec<i64> = events
        .iter()
        .filter(|e| e.kind == BlockageEventKind::BlockedInterval)
        .map(|e| e.timestamp)
        .collect();
    assert_non_decreasing!(&intervals);

    assert_eq!(harness.reporter.count(InternalErrorKind::UnbalancedCall), 0);
    assert_eq!(harness.reporter.count(InternalErrorKind::TimeTravel), 0);
    assert_eq!(harness.reporter.count(InternalErrorKind::WrongThread), 0);
    assert!(!harness.service.tracker().is_blocked());
    Ok(())
}

#[test]
fn test_events_are_delivered_on_monitor_thread() -> TestResult {
    let harness = Harness::new(false)?;
    harness.service.start_capture()?;
    thread::sleep(Duration::from_millis(50));

    assert!(harness.block_main_thread(Duration::from_millis(500)));
    assert_eventually!(WAIT, || harness
        .listener
        .count(BlockageEventKind::Unblocked)
        == 1);

    let monitor = must_some(harness.service.monitor_thread().get(), "monitor thread id");
    assert!(harness.listener.delivery_threads().iter().all(|t| *t == monitor));
    Ok(())
}

#[test]
fn test_idle_handler_path_reports_single_unblock() -> TestResult {
    let harness = Harness::new(true)?;
    harness.service.start_capture()?;
    assert_eventually!(WAIT, || harness.service.scheduler().is_idle_handler_installed());

    assert!(harness.block_main_thread(Duration::from_millis(600)));
    assert_eventually!(WAIT, || harness
        .listener
        .count(BlockageEventKind::Unblocked)
        >= 1);

    // Give a late duplicate a chance to show up before counting.
    thread::sleep(Duration::from_millis(100));
    harness.service.stop_capture()?;

    assert_balanced!(&harness.listener.events());
    assert_eq!(harness.listener.count(BlockageEventKind::Blocked), 1);
    assert_eq!(harness.listener.count(BlockageEventKind::Unblocked), 1);
    Ok(())
}

#[test]
fn test_repeated_blockages_stay_balanced() -> TestResult {
    let harness = Harness::new(false)?;
    harness.service.start_capture()?;

    for round in 1..=2 {
        thread::sleep(Duration::from_millis(60));
        assert!(harness.block_main_thread(Duration::from_millis(500)));
        assert_eventually!(WAIT, || harness
            .listener
            .count(BlockageEventKind::Unblocked)
            == round);
    }
    harness.service.stop_capture()?;

    assert_balanced!(&harness.listener.events());
    assert_eq!(harness.listener.count(BlockageEventKind::Blocked), 2);
    assert_eq!(harness.reporter.count(InternalErrorKind::UnbalancedCall), 0);
    assert_eq!(harness.reporter.count(InternalErrorKind::TimeTravel), 0);
    Ok(())
}

#[test]
fn test_panicking_listener_does_not_stop_delivery() -> TestResult {
    struct Exploding;

    impl BlockedThreadListener for Exploding {
        fn on_thread_blocked(&self, _thread: std::thread::ThreadId, _timestamp: i64) {
            panic!("listener failure");
        }

        fn on_thread_blocked_interval(&self, _thread: std::thread::ThreadId, _timestamp: i64) {}

        fn on_thread_unblocked(&self, _thread: std::thread::ThreadId, _timestamp: i64) {}
    }

    let harness = Harness::new(false)?;
    // Registered after the recorder, and a second recorder after it.
    harness.service.add_blocked_thread_listener(Arc::new(Exploding));
    let after = Arc::new(RecordingListener::default());
    harness.service.add_blocked_thread_listener(after.clone());
    harness.service.start_capture()?;
    thread::sleep(Duration::from_millis(50));

    assert!(harness.block_main_thread(Duration::from_millis(500)));
    assert_eventually!(WAIT, || after.count(BlockageEventKind::Unblocked) == 1);

    assert_eq!(after.count(BlockageEventKind::Blocked), 1);
    assert_eq!(harness.reporter.count(InternalErrorKind::ListenerPanicked), 1);
    assert_eq!(harness.listener.kinds(), after.kinds());
    Ok(())
}

#[test]
fn test_background_stops_and_foreground_restarts_capture() -> TestResult {
    let harness = Harness::new(false)?;
    harness.service.start_capture()?;
    assert!(harness.service.is_capturing());

    harness.service.on_background()?;
    assert!(!harness.service.is_capturing());

    // Blocked while backgrounded: nothing is reported.
    assert!(harness.block_main_thread(Duration::from_millis(500)));
    thread::sleep(Duration::from_millis(600));
    assert!(harness.listener.events().is_empty());

    harness.service.on_foreground()?;
    assert!(harness.service.is_capturing());
    thread::sleep(Duration::from_millis(100));
    assert!(harness.listener.events().is_empty());

    // A redundant stop is not an error.
    harness.service.on_background()?;
    harness.service.on_background()?;
    assert_eq!(harness.reporter.count(InternalErrorKind::HeartbeatStopFailed), 0);
    Ok(())
}

#[test]
fn test_background_and_foreground_during_blockage_stay_balanced() -> TestResult {
    let harness = Harness::new(false)?;
    harness.service.start_capture()?;
    thread::sleep(Duration::from_millis(50));

    assert!(harness.block_main_thread(Duration::from_millis(1_500)));
    assert_eventually!(WAIT, || harness
        .listener
        .count(BlockageEventKind::Blocked)
        == 1);

    harness.service.on_background()?;
    harness.service.on_foreground()?;

    // The foreground reset closes the first blockage; the thread is still
    // stuck, so a second one opens and closes when it finally responds.
    assert_eventually!(WAIT, || harness
        .listener
        .count(BlockageEventKind::Unblocked)
        == 2);
    harness.service.stop_capture()?;

    let events = harness.listener.events();
    assert_balanced!(&events);
    assert_eq!(harness.listener.count(BlockageEventKind::Blocked), 2);
    let stamps: Vec<i64> = events.iter().map(|e| e.timestamp).collect();
    assert_non_decreasing!(&stamps);
    assert_eq!(harness.reporter.count(InternalErrorKind::UnbalancedCall), 0);
    assert_eq!(harness.reporter.count(InternalErrorKind::TimeTravel), 0);
    assert!(!harness.service.tracker().is_blocked());
    Ok(())
}

#[test]
fn test_created_in_background_stops_after_delay() -> TestResult {
    let config = fast_config().background_check_delay_ms(150).build()?;
    let harness = Harness::with_state(config, AppState::Background)?;
    harness.service.start_capture()?;
    assert!(harness.service.is_capturing());

    assert_eventually!(WAIT, || !harness.service.is_capturing());
    assert_eventually!(WAIT, || !harness.service.is_heartbeat_scheduled());
    assert_eq!(harness.reporter.count(InternalErrorKind::HeartbeatStopFailed), 0);

    // Coming to the foreground later starts capture again.
    harness.service.on_foreground()?;
    assert!(harness.service.is_capturing());
    assert_eventually!(WAIT, || harness.service.is_heartbeat_scheduled());
    Ok(())
}

#[test]
fn test_foreground_cancels_background_check() -> TestResult {
    let config = fast_config().background_check_delay_ms(150).build()?;
    let harness = Harness::with_state(config, AppState::Background)?;
    harness.service.start_capture()?;
    harness.service.on_foreground()?;

    thread::sleep(Duration::from_millis(400));
    assert!(harness.service.is_capturing());
    assert!(harness.service.is_heartbeat_scheduled());

    // Going back to the background does not revive the cancelled check.
    harness.service.on_background()?;
    harness.service.start_capture()?;
    thread::sleep(Duration::from_millis(100));
    assert!(harness.service.is_capturing());
    Ok(())
}

#[test]
fn test_crash_stops_capture_without_reports() -> TestResult {
    let harness = Harness::new(false)?;
    harness.service.start_capture()?;
    thread::sleep(Duration::from_millis(50));

    harness.service.handle_crash()?;
    assert!(!harness.service.is_capturing());
    assert_eventually!(WAIT, || !harness.service.is_heartbeat_scheduled());

    assert!(harness.block_main_thread(Duration::from_millis(500)));
    thread::sleep(Duration::from_millis(600));
    assert!(harness.listener.events().is_empty());
    assert_eq!(harness.reporter.count(InternalErrorKind::HeartbeatStopFailed), 0);
    Ok(())
}

#[test]
fn test_interval_forwarding_follows_capture_flag() -> TestResult {
    let config = AnrConfig::builder()
        .sampling_interval_ms(20)
        .blocked_threshold_ms(300)
        .anr_capture_enabled(false)
        .build()?;
    let main_loop = Looper::spawn("main-no-intervals")?;
    let service = AnrService::new(
        Arc::new(main_loop.handle()),
        Arc::new(ConfigService::new(config)),
        Arc::new(SystemClock),
        Arc::new(TracingErrorReporter),
    )?;
    let listener = Arc::new(RecordingListener::default());
    service.add_blocked_thread_listener(listener.clone());
    service.start_capture()?;
    thread::sleep(Duration::from_millis(50));

    assert!(main_loop
        .handle()
        .post(Box::new(|| thread::sleep(Duration::from_millis(600)))));
    assert_eventually!(WAIT, || listener.count(BlockageEventKind::Unblocked) == 1);

    assert_eq!(listener.count(BlockageEventKind::Blocked), 1);
    assert_eq!(listener.count(BlockageEventKind::BlockedInterval), 0);
    Ok(())
}

#[test]
fn test_shutdown_is_idempotent() -> TestResult {
    let harness = Harness::new(false)?;
    harness.service.start_capture()?;
    harness.service.shutdown();
    harness.service.shutdown();

    assert!(!harness.service.is_capturing());
    assert!(matches!(
        harness.service.check_heartbeat(),
        Err(WatchdogError::WorkerStopped)
    ));
    Ok(())
}
