//! Prelude for anr-watchdog.
//!
//! Re-exports the types most hosts need to wire up a watchdog.
//!
//! # Example
//!
//! ```rust
//! use anr_watchdog::prelude::*;
//!
//! let config = AnrConfig::default();
//! assert!(config.validate().is_ok());
//! assert_eq!(config.native_sampling_interval_ms(), 500);
//! ```

pub use crate::clock::{Clock, SystemClock};
pub use crate::config::{AnrConfig, AnrConfigBuilder, ConfigListener, ConfigService, Unwinder};
pub use crate::error::{
    ErrorReporter, InternalErrorKind, NativeError, TracingErrorReporter, WatchdogError,
    WatchdogResult,
};
pub use crate::listener::{BlockageEvent, BlockageEventKind, BlockedThreadListener};
pub use crate::looper::{Looper, LooperHandle, TaskQueue};
pub use crate::native::{
    Bitness, BlockageSource, InstallState, NativeSample, NativeSampler, NativeSamplerInstaller,
    NativeThreadSampler,
};
pub use crate::service::{AnrService, AppState};
pub use crate::tracker::BlockageStateTracker;
