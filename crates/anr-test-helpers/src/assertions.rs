//! Assertion macros for blockage event streams.

/// Assert that a sequence never decreases.
///
/// # Example
///
/// ```rust
/// use anr_test_helpers::assert_non_decreasing;
///
/// assert_non_decreasing!(&[1, 2, 2, 4]);
/// ```
#[macro_export]
macro_rules! assert_non_decreasing {
    ($collection:expr $(,)?) => {
        let collection = $collection;
        let mut iter = collection.iter();
        if let Some(mut prev) = iter.next() {
            for (i, curr) in iter.enumerate() {
                if prev > curr {
                    panic!(
                        "assertion failed: sequence decreases\n  violation at index {}: {:?} > {:?}",
                        i, prev, curr
                    );
                }
                prev = curr;
            }
        }
    };
    ($collection:expr, $($arg:tt)+) => {
        let collection = $collection;
        let mut iter = collection.iter();
        if let Some(mut prev) = iter.next() {
            for (i, curr) in iter.enumerate() {
                if prev > curr {
                    panic!(
                        "assertion failed: sequence decreases\n  violation at index {}: {:?} > {:?}: {}",
                        i, prev, curr, format_args!($($arg)+)
                    );
                }
                prev = curr;
            }
        }
    };
}

/// Assert that a slice of [`BlockageEvent`](anr_watchdog::BlockageEvent)s
/// obeys the listener contract: blocked and unblocked strictly alternate
/// starting with blocked, and intervals only occur while blocked.
///
/// # Example
///
/// ```rust
/// use anr_test_helpers::assert_balanced;
/// use anr_watchdog::BlockageEvent;
///
/// let thread = std::thread::current().id();
/// let events = [
///     BlockageEvent::blocked(thread, 1),
///     BlockageEvent::blocked_interval(thread, 2),
///     BlockageEvent::unblocked(thread, 3),
/// ];
/// assert_balanced!(&events);
/// ```
#[macro_export]
macro_rules! assert_balanced {
    ($events:expr $(,)?) => {
        let mut blocked = false;
        for (i, event) in $events.iter().enumerate() {
            match event.kind {
                $crate::__private::BlockageEventKind::Blocked => {
                    if blocked {
                        panic!("assertion failed: blocked twice in a row at index {}", i);
                    }
                    blocked = true;
                }
                $crate::__private::BlockageEventKind::BlockedInterval => {
                    if !blocked {
                        panic!("assertion failed: interval while unblocked at index {}", i);
                    }
                }
                $crate::__private::BlockageEventKind::Unblocked => {
                    if !blocked {
                        panic!("assertion failed: unblocked while not blocked at index {}", i);
                    }
                    blocked = false;
                }
            }
        }
    };
}

/// Assert that a closure becomes true within a timeout, polling every
/// millisecond.
///
/// # Example
///
/// ```rust
/// use anr_test_helpers::assert_eventually;
/// use std::time::Duration;
///
/// assert_eventually!(Duration::from_millis(10), || true);
/// ```
#[macro_export]
macro_rules! assert_eventually {
    ($timeout:expr, $condition:expr $(,)?) => {
        if !$crate::wait_until($timeout, $condition) {
            panic!(
                "assertion failed: condition not met within {:?}",
                $timeout
            );
        }
    };
    ($timeout:expr, $condition:expr, $($arg:tt)+) => {
        if !$crate::wait_until($timeout, $condition) {
            panic!(
                "assertion failed: condition not met within {:?}: {}",
                $timeout,
                format_args!($($arg)+)
            );
        }
    };
}
