//! Error types for the watchdog.
//!
//! Two families live here. [`WatchdogError`] covers the fallible setup paths
//! (configuration, spawning the monitor thread, posting to a closed queue) and
//! is returned to the caller. [`InternalErrorKind`] classifies problems the
//! watchdog detects in itself while running; those are never returned across
//! the monitor thread boundary, only handed to an [`ErrorReporter`].

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use thiserror::Error;

/// Errors that can occur while configuring or wiring up the watchdog.
#[derive(Debug, Clone, Error)]
pub enum WatchdogError {
    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The monitor thread could not be spawned.
    #[error("Failed to spawn monitor thread: {0}")]
    WorkerSpawnFailed(String),

    /// The monitor thread has already shut down.
    #[error("Monitor worker is stopped")]
    WorkerStopped,

    /// The task queue of the target thread no longer accepts tasks.
    #[error("Task queue closed: {0}")]
    QueueClosed(String),

    /// The monitored queue cannot say which thread drains it.
    #[error("Monitored queue has no thread")]
    MonitoredThreadUnknown,
}

impl WatchdogError {
    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration(reason.into())
    }

    /// Create a worker spawn failure error.
    #[must_use]
    pub fn worker_spawn_failed(reason: impl Into<String>) -> Self {
        Self::WorkerSpawnFailed(reason.into())
    }

    /// Create a queue closed error.
    #[must_use]
    pub fn queue_closed(queue: impl Into<String>) -> Self {
        Self::QueueClosed(queue.into())
    }
}

/// A specialized `Result` type for watchdog operations.
pub type WatchdogResult<T> = std::result::Result<T, WatchdogError>;

/// Failures surfaced by the native sampling layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NativeError {
    /// The native library backing the sampler is not loaded.
    #[error("Native library not linked: {0}")]
    LinkError(String),

    /// The sampler refused to set itself up.
    #[error("Native sampler setup rejected")]
    SetupRejected,

    /// The sampler refused to monitor the calling thread.
    #[error("Native sampler rejected thread monitoring")]
    MonitorRejected,
}

impl NativeError {
    /// Create a link error.
    #[must_use]
    pub fn link_error(symbol: impl Into<String>) -> Self {
        Self::LinkError(symbol.into())
    }
}

/// Classification of self-detected internal errors.
///
/// Every kind is recovered locally. `InstallationFailed` is retried on the
/// next configuration change. `DispatchHandleUnavailable` is retried once
/// native sampling is requested from a thread that runs a task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InternalErrorKind {
    /// A listener saw blocked/unblocked out of alternation.
    UnbalancedCall,
    /// A delivered timestamp was earlier than the previous one.
    TimeTravel,
    /// The native sampler failed to install.
    InstallationFailed,
    /// No task queue could be obtained for the calling thread.
    DispatchHandleUnavailable,
    /// The periodic heartbeat check failed.
    HeartbeatCheckFailed,
    /// The periodic heartbeat could not be stopped.
    HeartbeatStopFailed,
    /// A monitor-thread-only callback ran on another thread.
    WrongThread,
    /// A blocked thread listener panicked during broadcast.
    ListenerPanicked,
}

impl InternalErrorKind {
    /// Whether a later configuration change may clear this condition.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::InstallationFailed | Self::DispatchHandleUnavailable
        )
    }
}

impl std::fmt::Display for InternalErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::UnbalancedCall => "unbalanced_call",
            Self::TimeTravel => "time_travel",
            Self::InstallationFailed => "installation_failed",
            Self::DispatchHandleUnavailable => "dispatch_handle_unavailable",
            Self::HeartbeatCheckFailed => "heartbeat_check_failed",
            Self::HeartbeatStopFailed => "heartbeat_stop_failed",
            Self::WrongThread => "wrong_thread",
            Self::ListenerPanicked => "listener_panicked",
        };
        f.write_str(name)
    }
}

/// Sink for internal errors.
///
/// Implementations must not panic and must not block for long: they are
/// called from the monitor thread.
pub trait ErrorReporter: Send + Sync {
    /// Record an internal error together with an optional cause.
    fn report(&self, kind: InternalErrorKind, message: &str, cause: Option<&dyn StdError>);
}

/// Reporter that forwards every internal error to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, kind: InternalErrorKind, message: &str, cause: Option<&dyn StdError>) {
        match cause {
            Some(cause) => tracing::error!(%kind, cause = %cause, "{message}"),
            None => tracing::error!(%kind, "{message}"),
        }
    }
}
