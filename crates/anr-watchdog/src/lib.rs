//! # anr-watchdog
//!
//! Responsiveness watchdog for a thread driven by a cooperative task queue.
//!
//! A dedicated monitor thread periodically posts a tiny probe task onto the
//! monitored thread's queue. If the probe is not processed within a deadline,
//! the thread is reported as blocked (an "Application Not Responding"
//! condition); periodic "still blocked" intervals follow, and a single
//! unblocked event fires once the probe runs or the queue reports itself
//! idle.
//!
//! ## Guarantees
//!
//! - **Never blocks the monitored thread**: probes are fire-and-forget and
//!   all deadline logic runs on the monitor thread
//! - **Broadcast ordering**: every listener sees the same events in the same
//!   order, and one listener's panic does not stop delivery to the next
//! - **Self-auditing**: unbalanced calls and regressing timestamps are
//!   reported through an [`ErrorReporter`], never escalated to a crash
//! - **At most one response per probe cycle**, whichever of probe delivery
//!   or idle notification fires first
//!
//! ## Architecture
//!
//! - [`service`] - `AnrService`, wiring everything below together
//! - [`probe`] - Probe scheduling on the monitored queue
//! - [`detector`] - Deadline, interval cadence and frozen-process handling
//! - [`tracker`] - Self-checking listener enforcing call ordering
//! - [`listener`] - Listener trait and broadcast registry
//! - [`native`] - Native thread sampler and its install coordinator
//! - [`looper`] - Task queue trait and a channel-backed implementation
//! - [`worker`] - The monitor thread
//! - [`config`] - Configuration and change notification
//! - [`error`] - Error types and internal error reporting
//!
//! ## Example
//!
//! ```rust
//! use anr_watchdog::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> WatchdogResult<()> {
//! let config = AnrConfig::builder()
//!     .sampling_interval_ms(100)
//!     .blocked_threshold_ms(1000)
//!     .build()?;
//!
//! let main_loop = Looper::spawn("main")?;
//! let service = AnrService::new(
//!     Arc::new(main_loop.handle()),
//!     Arc::new(ConfigService::new(config)),
//!     Arc::new(SystemClock),
//!     Arc::new(TracingErrorReporter),
//! )?;
//!
//! service.start_capture()?;
//! assert!(service.is_capturing());
//! service.shutdown();
//! # Ok(())
//! # }
//! ```

#![deny(
    unsafe_op_in_unsafe_fn,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic_in_result_fn,
    clippy::panic,
    missing_docs,
    missing_debug_implementations
)]
#![warn(clippy::pedantic)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod clock;
pub mod config;
pub mod detector;
pub mod error;
pub mod listener;
pub mod looper;
pub mod native;
pub mod probe;
pub mod service;
pub mod thread;
pub mod tracker;
pub mod worker;

pub mod prelude;

pub use clock::{Clock, SystemClock};
pub use config::{AnrConfig, AnrConfigBuilder, ConfigListener, ConfigService, Unwinder};
pub use detector::{BlockedThreadDetector, ThreadMonitoringState};
pub use error::{
    ErrorReporter, InternalErrorKind, NativeError, TracingErrorReporter, WatchdogError,
    WatchdogResult,
};
pub use listener::{BlockageEvent, BlockageEventKind, BlockedThreadListener, ListenerRegistry};
pub use looper::{Looper, LooperHandle, LooperThread, TaskQueue};
pub use native::{
    Bitness, BlockageSource, InstallState, NativeSampler, NativeSamplerInstaller,
    NativeThreadSampler,
};
pub use probe::{HEARTBEAT_REQUEST, ProbeScheduler, ProbeToken};
pub use service::{AnrService, AppState};
pub use thread::{MonitorThreadHandle, enforce_thread};
pub use tracker::{BlockageStateTracker, TrackerState};
pub use worker::{MonitorDispatch, MonitorWorker};
