//! Wall-clock source.

use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond clock used to timestamp blockage events.
///
/// Readings are intended to be monotonic but are not trusted to be: the
/// state tracker reports regressions instead of assuming they cannot happen.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds.
    fn now_ms(&self) -> i64;
}

/// Clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        // A system clock set before the epoch reads as a negative offset.
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            Err(before) => i64::try_from(before.duration().as_millis())
                .map_or(i64::MIN, |ms| ms.saturating_neg()),
        }
    }
}
