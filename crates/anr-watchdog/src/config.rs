//! Watchdog configuration and the configuration-change source.
//!
//! [`AnrConfig`] is a plain serde value; loading it from disk or a remote
//! endpoint is the host's business. [`ConfigService`] holds the live copy and
//! notifies [`ConfigListener`]s whenever the host swaps it, which is how the
//! native sampler installer learns that its feature has been switched on.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{WatchdogError, WatchdogResult};

/// Stack unwinder used by the native sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unwinder {
    /// libunwind.
    #[default]
    Libunwind,
    /// libunwindstack.
    Libunwindstack,
    /// Frame-pointer walking.
    Fp,
    /// libunwind, 32-bit build.
    Libunwind32,
}

impl Unwinder {
    /// Numeric code passed across the native boundary.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Libunwind => 0,
            Self::Libunwindstack => 1,
            Self::Fp => 2,
            Self::Libunwind32 => 3,
        }
    }
}

/// ANR watchdog configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnrConfig {
    /// Whether blocked-interval ticks are forwarded to listeners.
    pub anr_capture_enabled: bool,
    /// Probe and monitor tick cadence (milliseconds).
    pub sampling_interval_ms: u64,
    /// How long the monitored thread may leave a probe unprocessed (milliseconds).
    pub blocked_threshold_ms: u64,
    /// Monitor lag beyond which the process is assumed to have been frozen (milliseconds).
    pub monitor_thread_timeout_ms: u64,
    /// Use idle notifications from the monitored queue as the unblock signal.
    pub idle_handler_enabled: bool,
    /// Whether native thread sampling is enabled.
    pub native_sampling_enabled: bool,
    /// Native samples are taken every `native_sampling_factor` ticks.
    pub native_sampling_factor: u32,
    /// Unwinder used for native samples.
    pub native_unwinder: Unwinder,
    /// Maximum ticks counted per blockage interval.
    pub max_stacktraces_per_interval: u32,
    /// Maximum native intervals retained until collections are cleaned.
    pub max_native_intervals: usize,
    /// How long a service created in the background keeps capturing before
    /// it stops if the host never comes to the foreground (milliseconds).
    pub background_check_delay_ms: u64,
}

impl Default for AnrConfig {
    fn default() -> Self {
        Self {
            anr_capture_enabled: true,
            sampling_interval_ms: 100,
            blocked_threshold_ms: 1000,
            monitor_thread_timeout_ms: 60_000,
            idle_handler_enabled: false,
            native_sampling_enabled: false,
            native_sampling_factor: 5,
            native_unwinder: Unwinder::Libunwind,
            max_stacktraces_per_interval: 80,
            max_native_intervals: 5,
            background_check_delay_ms: 10_000,
        }
    }
}

impl AnrConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> WatchdogResult<()> {
        if self.sampling_interval_ms == 0 {
            return Err(WatchdogError::invalid_configuration(
                "sampling_interval_ms must be greater than 0",
            ));
        }
        if self.blocked_threshold_ms == 0 {
            return Err(WatchdogError::invalid_configuration(
                "blocked_threshold_ms must be greater than 0",
            ));
        }
        if self.blocked_threshold_ms <= self.sampling_interval_ms {
            return Err(WatchdogError::invalid_configuration(
                "blocked_threshold_ms must exceed sampling_interval_ms",
            ));
        }
        if self.monitor_thread_timeout_ms <= self.blocked_threshold_ms {
            return Err(WatchdogError::invalid_configuration(
                "monitor_thread_timeout_ms must exceed blocked_threshold_ms",
            ));
        }
        if self.native_sampling_factor == 0 {
            return Err(WatchdogError::invalid_configuration(
                "native_sampling_factor must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Interval between native samples (milliseconds).
    #[must_use]
    pub fn native_sampling_interval_ms(&self) -> u64 {
        self.sampling_interval_ms
            .saturating_mul(u64::from(self.native_sampling_factor))
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> AnrConfigBuilder {
        AnrConfigBuilder::default()
    }
}

/// Builder for [`AnrConfig`].
#[derive(Debug, Default)]
pub struct AnrConfigBuilder {
    config: AnrConfig,
}

impl AnrConfigBuilder {
    /// Enable or disable blocked-interval forwarding.
    #[must_use]
    pub fn anr_capture_enabled(mut self, enabled: bool) -> Self {
        self.config.anr_capture_enabled = enabled;
        self
    }

    /// Set the probe cadence in milliseconds.
    #[must_use]
    pub fn sampling_interval_ms(mut self, ms: u64) -> Self {
        self.config.sampling_interval_ms = ms;
        self
    }

    /// Set the probe deadline in milliseconds.
    #[must_use]
    pub fn blocked_threshold_ms(mut self, ms: u64) -> Self {
        self.config.blocked_threshold_ms = ms;
        self
    }

    /// Set the frozen-process detection timeout in milliseconds.
    #[must_use]
    pub fn monitor_thread_timeout_ms(mut self, ms: u64) -> Self {
        self.config.monitor_thread_timeout_ms = ms;
        self
    }

    /// Enable or disable the idle notification path.
    #[must_use]
    pub fn idle_handler_enabled(mut self, enabled: bool) -> Self {
        self.config.idle_handler_enabled = enabled;
        self
    }

    /// Enable or disable native thread sampling.
    #[must_use]
    pub fn native_sampling_enabled(mut self, enabled: bool) -> Self {
        self.config.native_sampling_enabled = enabled;
        self
    }

    /// Set the native sampling factor.
    #[must_use]
    pub fn native_sampling_factor(mut self, factor: u32) -> Self {
        self.config.native_sampling_factor = factor;
        self
    }

    /// Set the native unwinder.
    #[must_use]
    pub fn native_unwinder(mut self, unwinder: Unwinder) -> Self {
        self.config.native_unwinder = unwinder;
        self
    }

    /// Set the maximum ticks counted per blockage interval.
    #[must_use]
    pub fn max_stacktraces_per_interval(mut self, limit: u32) -> Self {
        self.config.max_stacktraces_per_interval = limit;
        self
    }

    /// Set the maximum retained native intervals.
    #[must_use]
    pub fn max_native_intervals(mut self, limit: usize) -> Self {
        self.config.max_native_intervals = limit;
        self
    }

    /// Set the background check delay in milliseconds.
    #[must_use]
    pub fn background_check_delay_ms(mut self, ms: u64) -> Self {
        self.config.background_check_delay_ms = ms;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> WatchdogResult<AnrConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Receives configuration changes.
pub trait ConfigListener: Send + Sync {
    /// Called after the configuration has been replaced.
    fn on_config_change(&self, config: &AnrConfig);
}

/// Holder of the live configuration.
pub struct ConfigService {
    config: RwLock<AnrConfig>,
    listeners: RwLock<Vec<Arc<dyn ConfigListener>>>,
}

impl ConfigService {
    /// Create a service around an initial configuration.
    #[must_use]
    pub fn new(config: AnrConfig) -> Self {
        Self {
            config: RwLock::new(config),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> AnrConfig {
        self.config.read().clone()
    }

    /// Feature flag for native thread sampling.
    #[must_use]
    pub fn is_native_sampling_enabled(&self) -> bool {
        self.config.read().native_sampling_enabled
    }

    /// Whether blocked-interval ticks should be forwarded.
    #[must_use]
    pub fn is_anr_capture_enabled(&self) -> bool {
        self.config.read().anr_capture_enabled
    }

    /// Register a listener for configuration changes.
    pub fn add_listener(&self, listener: Arc<dyn ConfigListener>) {
        self.listeners.write().push(listener);
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Replace the configuration and notify listeners.
    ///
    /// # Errors
    ///
    /// Returns an error and keeps the old configuration if `config` is invalid.
    pub fn update(&self, config: AnrConfig) -> WatchdogResult<()> {
        config.validate()?;
        *self.config.write() = config.clone();

        // Listeners may register further listeners; iterate a snapshot.
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        tracing::debug!(listeners = listeners.len(), "Configuration updated");
        for listener in listeners {
            listener.on_config_change(&config);
        }
        Ok(())
    }
}

impl Default for ConfigService {
    fn default() -> Self {
        Self::new(AnrConfig::default())
    }
}

impl std::fmt::Debug for ConfigService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigService")
            .field("config", &*self.config.read())
            .field("listener_count", &self.listeners.read().len())
            .finish()
    }
}
