//! Blockage decision logic.
//!
//! [`BlockedThreadDetector`] turns two inputs into blockage events: monitor
//! ticks (fixed cadence, monitor thread) and target responses (probe or idle
//! signal relayed from the monitored thread). It owns the policy the probe
//! scheduler leaves open: the deadline, the blocked-interval cadence, and the
//! frozen-process reset. All methods must be called from the monitor thread.

use std::sync::Arc;
use std::thread::ThreadId;

use crate::clock::Clock;
use crate::config::AnrConfig;
use crate::listener::BlockedThreadListener;

/// Returns `true` while detection should be paused (e.g. a debugger is attached).
pub type SuppressionCheck = Arc<dyn Fn() -> bool + Send + Sync + 'static>;

/// Timing state of one monitored thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadMonitoringState {
    /// A blockage has been reported and not yet cleared.
    pub blockage_in_progress: bool,
    /// Last time the monitored thread responded.
    pub last_target_response_ms: i64,
    /// Last time the monitor tick ran.
    pub last_monitor_tick_ms: i64,
    /// Last time a blocked interval was emitted.
    pub last_sample_attempt_ms: i64,
}

impl ThreadMonitoringState {
    /// Forget any blockage and restart timing from `now`.
    pub fn reset(&mut self, now: i64) {
        *self = Self {
            blockage_in_progress: false,
            last_target_response_ms: now,
            last_monitor_tick_ms: now,
            last_sample_attempt_ms: 0,
        };
    }
}

/// Decides when the monitored thread counts as blocked.
pub struct BlockedThreadDetector {
    target_thread: ThreadId,
    clock: Arc<dyn Clock>,
    listener: Arc<dyn BlockedThreadListener>,
    state: ThreadMonitoringState,
    blocked_threshold_ms: i64,
    sampling_interval_ms: i64,
    monitor_thread_timeout_ms: i64,
    suppression: Option<SuppressionCheck>,
    last_event_ms: i64,
}

impl BlockedThreadDetector {
    /// Create a detector for `target_thread` emitting to `listener`.
    #[must_use]
    pub fn new(
        target_thread: ThreadId,
        config: &AnrConfig,
        clock: Arc<dyn Clock>,
        listener: Arc<dyn BlockedThreadListener>,
    ) -> Self {
        let mut state = ThreadMonitoringState::default();
        state.reset(clock.now_ms());
        Self {
            target_thread,
            clock,
            listener,
            state,
            blocked_threshold_ms: to_i64(config.blocked_threshold_ms),
            sampling_interval_ms: to_i64(config.sampling_interval_ms),
            monitor_thread_timeout_ms: to_i64(config.monitor_thread_timeout_ms),
            suppression: None,
            last_event_ms: i64::MIN,
        }
    }

    /// Pause detection whenever `check` returns `true`.
    #[must_use]
    pub fn with_suppression(mut self, check: SuppressionCheck) -> Self {
        self.suppression = Some(check);
        self
    }

    /// Pick up thresholds from a new configuration. Timing state is kept.
    pub fn apply_config(&mut self, config: &AnrConfig) {
        self.blocked_threshold_ms = to_i64(config.blocked_threshold_ms);
        self.sampling_interval_ms = to_i64(config.sampling_interval_ms);
        self.monitor_thread_timeout_ms = to_i64(config.monitor_thread_timeout_ms);
    }

    /// Current timing state.
    #[must_use]
    pub fn state(&self) -> &ThreadMonitoringState {
        &self.state
    }

    /// Restart timing from now.
    ///
    /// A blockage in progress is closed with an `Unblocked` event first, so
    /// listeners never see two `Blocked` events in a row.
    pub fn reset(&mut self) {
        let now = self.clock.now_ms();
        if self.state.blockage_in_progress {
            let timestamp = now.max(self.last_event_ms);
            tracing::info!(thread = ?self.target_thread, timestamp, "Blockage closed by reset");
            self.emit_unblocked(timestamp);
        }
        self.state.reset(now);
    }

    fn emit_unblocked(&mut self, timestamp: i64) {
        self.state.blockage_in_progress = false;
        self.last_event_ms = timestamp;
        self.listener.on_thread_unblocked(self.target_thread, timestamp);
    }

    fn is_suppressed(&self) -> bool {
        self.suppression.as_ref().is_some_and(|check| check())
    }

    /// The monitored thread responded at `timestamp`.
    ///
    /// The response is read on the monitored thread, so a tick may already
    /// have emitted a later timestamp; the response is clamped to it.
    pub fn on_target_thread_response(&mut self, timestamp: i64) {
        let timestamp = timestamp.max(self.last_event_ms);
        self.state.last_target_response_ms = timestamp;

        if self.is_suppressed() {
            return;
        }

        if self.state.blockage_in_progress {
            tracing::info!(thread = ?self.target_thread, timestamp, "Monitored thread unblocked");
            self.emit_unblocked(timestamp);
        }
    }

    /// Periodic check from the monitor thread.
    pub fn on_monitor_tick(&mut self, timestamp: i64) {
        if self.is_suppressed() {
            return;
        }

        if !self.state.blockage_in_progress && self.is_threshold_exceeded(timestamp) {
            self.state.blockage_in_progress = true;
            let since = self.state.last_target_response_ms;
            tracing::warn!(
                thread = ?self.target_thread,
                since,
                lag_ms = timestamp.saturating_sub(since),
                "Monitored thread blocked"
            );
            self.last_event_ms = self.last_event_ms.max(since);
            self.listener.on_thread_blocked(self.target_thread, since);
        }
        if self.state.blockage_in_progress && self.should_sample(timestamp) {
            self.last_event_ms = self.last_event_ms.max(timestamp);
            self.listener
                .on_thread_blocked_interval(self.target_thread, timestamp);
            self.state.last_sample_attempt_ms = self.clock.now_ms();
        }
        self.state.last_monitor_tick_ms = self.clock.now_ms();
    }

    /// Whether the monitored thread has missed its deadline at `timestamp`.
    ///
    /// A monitor lag beyond the frozen-process timeout means the whole
    /// process was suspended; timing restarts instead of reporting a blockage.
    pub fn is_threshold_exceeded(&mut self, timestamp: i64) -> bool {
        let monitor_lag = timestamp.saturating_sub(self.state.last_monitor_tick_ms);
        let target_lag = timestamp.saturating_sub(self.state.last_target_response_ms);

        if monitor_lag > self.monitor_thread_timeout_ms {
            let now = self.clock.now_ms();
            tracing::debug!(monitor_lag, "Monitor thread stalled, restarting timing");
            self.state.last_target_response_ms = now;
            self.state.last_monitor_tick_ms = now;
            return false;
        }
        target_lag > self.blocked_threshold_ms
    }

    /// Skip intervals bunched up after the monitor thread was starved.
    fn should_sample(&self, timestamp: i64) -> bool {
        let delta = timestamp.saturating_sub(self.state.last_monitor_tick_ms);
        delta.saturating_mul(2) > self.sampling_interval_ms
    }
}

impl std::fmt::Debug for BlockedThreadDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockedThreadDetector")
            .field("target_thread", &self.target_thread)
            .field("state", &self.state)
            .field("blocked_threshold_ms", &self.blocked_threshold_ms)
            .field("sampling_interval_ms", &self.sampling_interval_ms)
            .finish_non_exhaustive()
    }
}

fn to_i64(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}
