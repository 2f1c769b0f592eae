//! Shared test utilities for the ANR watchdog.
//!
//! # Modules
//!
//! - [`mod@must`] - Unwrap and wait helpers with `#[track_caller]`
//! - [`assertions`] - Assertion macros for blockage event streams
//! - [`mock`] - Fakes for the clock, reporter, listener and native sampler
//! - [`prelude`] - Convenience re-exports
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! anr-test-helpers = { path = "../anr-test-helpers" }
//! ```
//!
//! ```rust,ignore
//! use anr_test_helpers::prelude::*;
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::unwrap_used, clippy::panic)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod assertions;
pub mod must;
pub mod prelude;

#[cfg(feature = "mock")]
#[cfg_attr(docsrs, doc(cfg(feature = "mock")))]
pub mod mock;

pub use must::*;

#[doc(hidden)]
pub mod __private {
    pub use anr_watchdog::BlockageEventKind;
}
