//! Unwrap and wait helpers with `#[track_caller]` panic locations.
//!
//! Watchdog tests mostly assert on things that happen on another thread, so
//! next to the plain unwrap helpers there is [`wait_until`], a bounded poll
//! used instead of fixed sleeps.

use std::fmt::Debug;
use std::thread;
use std::time::{Duration, Instant};

/// Unwrap a `Result`, panicking with the error on `Err`.
///
/// # Example
///
/// ```rust
/// use anr_test_helpers::must;
///
/// let config = must(anr_watchdog::AnrConfig::builder().build());
/// assert_eq!(config.sampling_interval_ms, 100);
/// ```
///
/// # Panics
///
/// Panics if the result is `Err`.
#[track_caller]
pub fn must<T, E: Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("must: unexpected Err: {e:?}"),
    }
}

/// Unwrap an `Option`, panicking with `msg` on `None`.
///
/// # Panics
///
/// Panics if the option is `None`.
#[track_caller]
pub fn must_some<T>(option: Option<T>, msg: &str) -> T {
    match option {
        Some(v) => v,
        None => panic!("must_some: {msg}"),
    }
}

/// Unwrap a `Result` with a context message.
///
/// # Panics
///
/// Panics if the result is `Err`, with the context and error value.
#[track_caller]
pub fn must_with<T, E: Debug>(result: Result<T, E>, context: &str) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("must_with: {context}: {e:?}"),
    }
}

/// Poll `condition` every millisecond until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
///
/// # Example
///
/// ```rust
/// use anr_test_helpers::wait_until;
/// use std::time::Duration;
///
/// assert!(wait_until(Duration::from_millis(10), || true));
/// assert!(!wait_until(Duration::from_millis(5), || false));
/// ```
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}
