use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use super::{Bitness, NativeInterval, NativeSampler};
use crate::config::{AnrConfig, ConfigService};
use crate::error::NativeError;
use crate::listener::BlockedThreadListener;
use crate::worker::MonitorDispatch;

/// Samples the native layer buffers before they must be fetched.
///
/// Once sampling starts, a fetch is scheduled after this many native sampling
/// intervals so a long blockage does not overrun the native buffer.
pub const MAX_NATIVE_SAMPLES: u64 = 10;

#[derive(Debug, Default)]
struct SamplerState {
    ignored: bool,
    sampling: bool,
    count: u64,
    target: Option<ThreadId>,
    target_name: Option<String>,
    intervals: Vec<NativeInterval>,
    generation: u64,
}

/// Drives a [`NativeSampler`] in lockstep with blockage events.
///
/// Sampling starts on every `factor`-th interval of a blockage, offset by the
/// blockage start so that concurrent processes do not all sample at once.
/// Samples are fetched when the blockage ends, after
/// [`MAX_NATIVE_SAMPLES`] native intervals if a dispatcher was given, and
/// on demand by [`captured_intervals`](Self::captured_intervals).
pub struct NativeThreadSampler {
    delegate: Arc<dyn NativeSampler>,
    config: Arc<ConfigService>,
    state: Arc<Mutex<SamplerState>>,
    dispatcher: Option<Arc<dyn MonitorDispatch>>,
}

impl NativeThreadSampler {
    /// Create a sampler over `delegate`, reading limits from `config`.
    #[must_use]
    pub fn new(delegate: Arc<dyn NativeSampler>, config: Arc<ConfigService>) -> Self {
        Self {
            delegate,
            config,
            state: Arc::new(Mutex::new(SamplerState {
                ignored: true,
                ..SamplerState::default()
            })),
            dispatcher: None,
        }
    }

    /// Run delayed fetches through `dispatcher`, normally the monitor thread.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn MonitorDispatch>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Prepare the native layer.
    ///
    /// # Errors
    ///
    /// Propagates [`NativeError::LinkError`] from the delegate.
    pub fn setup(&self, bitness: Bitness) -> Result<bool, NativeError> {
        self.delegate.setup(bitness)
    }

    /// Make the calling thread the sampling target.
    ///
    /// # Errors
    ///
    /// Propagates [`NativeError::LinkError`] from the delegate.
    pub fn monitor_current_thread(&self) -> Result<bool, NativeError> {
        let accepted = self.delegate.monitor_current_thread()?;
        if accepted {
            let current = thread::current();
            let mut state = self.state.lock();
            state.target = Some(current.id());
            state.target_name = current.name().map(str::to_string);
        }
        Ok(accepted)
    }

    /// Thread currently targeted, if any.
    #[must_use]
    pub fn target_thread(&self) -> Option<ThreadId> {
        self.state.lock().target
    }

    /// Whether the native layer is sampling right now.
    #[must_use]
    pub fn is_sampling(&self) -> bool {
        self.state.lock().sampling
    }

    /// Intervals that captured at least one sample.
    ///
    /// While sampling is in flight the samples gathered so far are fetched
    /// first, unless the process `received_termination`, in which case the
    /// native layer is left alone. Empty when native sampling is disabled.
    #[must_use]
    pub fn captured_intervals(&self, received_termination: bool) -> Vec<NativeInterval> {
        if !self.config.is_native_sampling_enabled() {
            return Vec::new();
        }
        let mut state = self.state.lock();
        if state.sampling && !received_termination {
            tracing::debug!("Fetching in-flight native samples");
            Self::fetch_samples(self.delegate.as_ref(), &mut state);
        }
        state
            .intervals
            .iter()
            .filter(|interval| !interval.samples.is_empty())
            .cloned()
            .collect()
    }

    /// Drop every stored interval.
    pub fn clean_collections(&self) {
        self.state.lock().intervals.clear();
    }

    fn fetch_samples(delegate: &dyn NativeSampler, state: &mut SamplerState) {
        let Some(samples) = delegate.finish_sampling() else {
            tracing::debug!("Native sampler returned no samples");
            return;
        };
        if let Some(interval) = state.intervals.last_mut() {
            interval.samples = samples;
        }
    }

    /// Fetch after [`MAX_NATIVE_SAMPLES`] native intervals if the same
    /// blockage is still being sampled by then.
    fn schedule_fetch(&self, generation: u64, native_interval_ms: u64) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        let delay = Duration::from_millis(native_interval_ms.saturating_mul(MAX_NATIVE_SAMPLES));
        let delegate = Arc::clone(&self.delegate);
        let state = Arc::clone(&self.state);
        let fetch = Box::new(move || {
            let mut state = state.lock();
            if state.sampling && state.generation == generation {
                Self::fetch_samples(delegate.as_ref(), &mut state);
            }
        });
        if !dispatcher.dispatch_after(delay, fetch) {
            tracing::debug!("Delayed native fetch dropped: monitor worker stopped");
        }
    }

    fn begin_interval(state: &mut SamplerState, config: &AnrConfig, timestamp: i64) {
        let factor = u64::from(config.native_sampling_factor).max(1);
        let offset = timestamp.rem_euclid(i64::from(config.native_sampling_factor.max(1)));
        let offset = u64::try_from(offset).unwrap_or(0);
        state.ignored = false;
        state.generation = state.generation.wrapping_add(1);
        state.count = (factor - offset) % factor;
        state.intervals.push(NativeInterval {
            thread_name: state.target_name.clone(),
            offset_ms: offset.saturating_mul(config.sampling_interval_ms),
            start_ms: timestamp,
            unwinder: config.native_unwinder,
            samples: Vec::new(),
        });
    }
}

impl BlockedThreadListener for NativeThreadSampler {
    fn on_thread_blocked(&self, _thread: ThreadId, timestamp: i64) {
        let config = self.config.config();
        let mut state = self.state.lock();
        if !config.native_sampling_enabled || state.intervals.len() >= config.max_native_intervals {
            tracing::debug!(
                intervals = state.intervals.len(),
                "Native sampling skipped for this blockage"
            );
            state.ignored = true;
            return;
        }
        Self::begin_interval(&mut state, &config, timestamp);
    }

    fn on_thread_blocked_interval(&self, _thread: ThreadId, _timestamp: i64) {
        let config = self.config.config();
        let mut state = self.state.lock();
        if state.ignored || !config.native_sampling_enabled {
            return;
        }
        if state.count >= u64::from(config.max_stacktraces_per_interval) {
            tracing::debug!("Native stacktrace limit reached for this interval");
            return;
        }

        let factor = u64::from(config.native_sampling_factor).max(1);
        let mut started = None;
        if state.count % factor == 0 {
            state.count = 0;
            if !state.sampling {
                state.sampling = true;
                let native_interval_ms = config.native_sampling_interval_ms();
                self.delegate
                    .start_sampling(config.native_unwinder, native_interval_ms);
                started = Some((state.generation, native_interval_ms));
            }
        }
        state.count += 1;
        drop(state);

        if let Some((generation, native_interval_ms)) = started {
            self.schedule_fetch(generation, native_interval_ms);
        }
    }

    fn on_thread_unblocked(&self, _thread: ThreadId, _timestamp: i64) {
        let mut state = self.state.lock();
        if state.sampling {
            Self::fetch_samples(self.delegate.as_ref(), &mut state);
        }
        state.ignored = true;
        state.sampling = false;
    }
}

impl std::fmt::Debug for NativeThreadSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NativeThreadSampler")
            .field("sampling", &state.sampling)
            .field("target", &state.target)
            .field("intervals", &state.intervals.len())
            .finish_non_exhaustive()
    }
}
