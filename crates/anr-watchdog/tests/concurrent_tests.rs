//! Concurrency tests for the watchdog building blocks.

use anr_test_helpers::prelude::*;
use anr_watchdog::prelude::*;
use anr_watchdog::{ListenerRegistry, MonitorThreadHandle, MonitorWorker, ProbeScheduler};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_concurrent_registration_during_broadcast() {
    let registry = Arc::new(ListenerRegistry::new());
    let reporter = Arc::new(RecordingReporter::default());
    let first = Arc::new(RecordingListener::default());
    registry.add(first.clone());

    let mut handles = vec![];
    for _ in 0..8 {
        let registry = registry.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..25 {
                registry.add(Arc::new(RecordingListener::default()));
            }
        }));
    }

    let target = thread::current().id();
    for round in 0..50 {
        registry.broadcast(BlockageEvent::blocked(target, round * 2), reporter.as_ref());
        registry.broadcast(BlockageEvent::unblocked(target, round * 2 + 1), reporter.as_ref());
    }

    for handle in handles {
        assert!(handle.join().is_ok(), "Thread should not panic");
    }

    assert_eq!(registry.len(), 1 + 8 * 25);
    assert_eq!(first.events().len(), 100);
    assert_balanced!(&first.events());
    assert!(reporter.reports().is_empty());
}

#[test]
fn test_concurrent_config_updates_notify_every_listener() -> TestResult {
    struct Counter(AtomicUsize);

    impl ConfigListener for Counter {
        fn on_config_change(&self, config: &AnrConfig) {
            assert!(config.validate().is_ok());
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let service = Arc::new(ConfigService::default());
    let counter = Arc::new(Counter(AtomicUsize::new(0)));
    service.add_listener(counter.clone());

    let mut handles = vec![];
    for i in 0..8u64 {
        let service = service.clone();
        handles.push(thread::spawn(move || -> WatchdogResult<()> {
            for j in 0..10u64 {
                let config = AnrConfig::builder()
                    .sampling_interval_ms(50 + i + j)
                    .build()?;
                service.update(config)?;
                assert!(service.config().validate().is_ok());
            }
            Ok(())
        }));
    }
    for handle in handles {
        assert!(matches!(handle.join(), Ok(Ok(()))));
    }

    assert_eq!(counter.0.load(Ordering::SeqCst), 80);
    Ok(())
}

#[test]
fn test_racing_idle_signals_respond_once_per_cycle() -> TestResult {
    let looper = Looper::spawn("probe-race")?;
    let monitor = MonitorThreadHandle::new();
    let reporter = Arc::new(RecordingReporter::default());
    let worker = Arc::new(MonitorWorker::spawn(
        "probe-race-monitor",
        monitor.clone(),
        reporter.clone(),
    )?);
    let responses = Arc::new(AtomicUsize::new(0));
    let counted = responses.clone();

    let scheduler = ProbeScheduler::new(
        Arc::new(looper.handle()),
        worker.clone(),
        monitor,
        Arc::new(SystemClock),
        reporter.clone(),
        false,
        Arc::new(move |_timestamp: i64| {
            counted.fetch_add(1, Ordering::SeqCst);
        }),
    );
    scheduler.start();

    for cycle in 1..=5 {
        // Hold the looper so the probe stays queued while idle signals race.
        let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(1);
        assert!(looper.handle().post(Box::new(move || {
            let _ = release_rx.recv_timeout(WAIT);
        })));
        assert!(scheduler.send_probe());

        let mut handles = vec![];
        for _ in 0..8 {
            let scheduler = scheduler.clone();
            handles.push(thread::spawn(move || scheduler.on_queue_idle()));
        }
        for handle in handles {
            assert!(matches!(handle.join(), Ok(true)));
        }
        release_tx.send(())?;

        assert_eventually!(WAIT, || !scheduler.has_outstanding_probe());
        assert_eventually!(WAIT, || responses.load(Ordering::SeqCst) == cycle);
    }

    thread::sleep(Duration::from_millis(20));
    assert_eq!(responses.load(Ordering::SeqCst), 5);
    assert_eq!(reporter.count(InternalErrorKind::WrongThread), 0);
    Ok(())
}

#[test]
fn test_monitor_handle_reassignment_is_visible_across_threads() -> TestResult {
    let handle = MonitorThreadHandle::new();
    let (tx, rx) = crossbeam::channel::bounded(1);

    let owner = handle.clone();
    let joined = thread::spawn(move || {
        owner.set_current();
        let _ = tx.send(thread::current().id());
        owner.is_current()
    })
    .join();
    assert!(matches!(joined, Ok(true)));

    let spawned = rx.recv_timeout(WAIT)?;
    assert_eq!(handle.get(), Some(spawned));
    assert!(!handle.is_current());

    handle.set_current();
    assert!(handle.is_current());
    handle.clear();
    assert_eq!(handle.get(), None);
    Ok(())
}

#[test]
fn test_listener_added_during_capture_sees_next_blockage() -> TestResult {
    let config = AnrConfig::builder()
        .sampling_interval_ms(20)
        .blocked_threshold_ms(250)
        .build()?;
    let main_loop = Looper::spawn("late-listener")?;
    let service = Arc::new(AnrService::new(
        Arc::new(main_loop.handle()),
        Arc::new(ConfigService::new(config)),
        Arc::new(SystemClock),
        Arc::new(TracingErrorReporter),
    )?);
    service.start_capture()?;
    thread::sleep(Duration::from_millis(50));

    let listener = Arc::new(RecordingListener::default());
    let registrar = service.clone();
    let late = listener.clone();
    let joined = thread::spawn(move || registrar.add_blocked_thread_listener(late)).join();
    assert!(joined.is_ok());

    assert!(main_loop
        .handle()
        .post(Box::new(|| thread::sleep(Duration::from_millis(500)))));
    assert_eventually!(WAIT, || listener.count(BlockageEventKind::Unblocked) == 1);
    assert_balanced!(&listener.events());
    service.shutdown();
    Ok(())
}
