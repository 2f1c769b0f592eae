//! Convenience re-exports for common test utilities.
//!
//! ```rust,ignore
//! use anr_test_helpers::prelude::*;
//! ```

pub use crate::must::{must, must_some, must_with, wait_until};
pub use crate::{assert_balanced, assert_eventually, assert_non_decreasing};

#[cfg(feature = "mock")]
pub use crate::mock::{
    CollectingSource, FakeClock, NativeOutcome, RecordingListener, RecordingReporter, Report,
    ScriptedNativeSampler,
};

/// Result type for tests that use `?`.
pub type TestResult = Result<(), Box<dyn std::error::Error>>;
