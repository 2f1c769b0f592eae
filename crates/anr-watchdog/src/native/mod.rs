//! Native thread sampling.
//!
//! The probe scheduler can only see the managed task queue. Code stuck in a
//! native library on another thread needs a second mechanism: a native
//! sampler that unwinds that thread's stack while the managed thread is
//! blocked. This module holds the sampler contract ([`NativeSampler`]), the
//! listener that drives it in lockstep with blockage events
//! ([`NativeThreadSampler`]), and the coordinator that installs it on the
//! right thread ([`NativeSamplerInstaller`]).

mod installer;
mod sampler;

pub use installer::{BlockageSource, InstallState, NativeSamplerInstaller};
pub use sampler::{MAX_NATIVE_SAMPLES, NativeThreadSampler};

use serde::{Deserialize, Serialize};

use crate::config::Unwinder;
use crate::error::NativeError;

/// Pointer width of the running process, as the native layer expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bitness {
    /// 32-bit process.
    Bits32,
    /// 64-bit process.
    Bits64,
}

impl Bitness {
    /// Bitness of the current build.
    #[must_use]
    pub fn current() -> Self {
        if cfg!(target_pointer_width = "32") {
            Self::Bits32
        } else {
            Self::Bits64
        }
    }

    /// Whether this is a 32-bit process.
    #[must_use]
    pub fn is_32_bit(self) -> bool {
        self == Self::Bits32
    }
}

/// One stack sample captured by the native layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeSample {
    /// When the sample was taken (milliseconds).
    pub timestamp_ms: i64,
    /// Program counters, innermost first.
    pub frames: Vec<u64>,
    /// Unwinder status code; zero on success.
    pub result: i32,
}

/// Samples collected during one blockage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeInterval {
    /// Name of the sampled thread, if it had one.
    pub thread_name: Option<String>,
    /// Delay before the first sample (milliseconds).
    pub offset_ms: u64,
    /// Start of the blockage (milliseconds).
    pub start_ms: i64,
    /// Unwinder used.
    pub unwinder: Unwinder,
    /// Captured samples.
    pub samples: Vec<NativeSample>,
}

/// Bridge to the native sampling library.
///
/// Any call may fail with [`NativeError::LinkError`] when the library was not
/// loaded; callers treat that as a retryable installation failure.
pub trait NativeSampler: Send + Sync {
    /// Prepare the sampler for a process of the given bitness.
    ///
    /// # Errors
    ///
    /// Returns [`NativeError::LinkError`] if the native library is missing.
    fn setup(&self, bitness: Bitness) -> Result<bool, NativeError>;

    /// Target the calling thread for future samples.
    ///
    /// # Errors
    ///
    /// Returns [`NativeError::LinkError`] if the native library is missing.
    fn monitor_current_thread(&self) -> Result<bool, NativeError>;

    /// Begin sampling the monitored thread every `interval_ms`.
    fn start_sampling(&self, unwinder: Unwinder, interval_ms: u64);

    /// Return the samples captured so far for the current blockage.
    ///
    /// `None` means nothing new; the caller keeps what it already has.
    fn finish_sampling(&self) -> Option<Vec<NativeSample>>;
}
