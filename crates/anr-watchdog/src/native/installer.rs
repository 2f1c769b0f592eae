use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use super::{Bitness, NativeThreadSampler};
use crate::config::{AnrConfig, ConfigListener, ConfigService};
use crate::error::{ErrorReporter, InternalErrorKind, NativeError};
use crate::listener::BlockedThreadListener;
use crate::looper::{Looper, LooperHandle, TaskQueue};

/// Installation progress of the native sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InstallState {
    /// Native sampling is turned off in configuration.
    #[default]
    Disabled,
    /// Enabled but not yet installed on the current thread.
    PendingInstall,
    /// Installed on the current thread.
    Installed,
}

/// Component that delivers blockage events to registered listeners.
pub trait BlockageSource: Send + Sync {
    /// Register `listener` for every future blockage event.
    fn add_blocked_thread_listener(&self, listener: Arc<dyn BlockedThreadListener>);
}

/// What a configuration retry installs, and where.
struct InstallTarget {
    sampler: Arc<NativeThreadSampler>,
    source: Arc<dyn BlockageSource>,
    handle: Option<LooperHandle>,
}

#[derive(Default)]
struct InstallerInner {
    state: InstallState,
    current_thread: Option<ThreadId>,
    target: Option<InstallTarget>,
    listener_registered: bool,
    retry_registered: bool,
}

/// Installs a [`NativeThreadSampler`] on the thread that asks for it.
///
/// Installation must run on the target thread. When the feature is disabled
/// or the native library is not ready, a configuration listener retries on
/// that thread's [`Looper`] after the next configuration change. The
/// listener is registered once per installer and always targets the thread
/// of the latest request.
pub struct NativeSamplerInstaller {
    inner: Mutex<InstallerInner>,
    bitness: Bitness,
    reporter: Arc<dyn ErrorReporter>,
    attempts: AtomicUsize,
}

impl NativeSamplerInstaller {
    /// Create an installer for a process of the current bitness.
    #[must_use]
    pub fn new(reporter: Arc<dyn ErrorReporter>) -> Arc<Self> {
        Self::with_bitness(Bitness::current(), reporter)
    }

    /// Create an installer for an explicit bitness.
    #[must_use]
    pub fn with_bitness(bitness: Bitness, reporter: Arc<dyn ErrorReporter>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(InstallerInner::default()),
            bitness,
            reporter,
            attempts: AtomicUsize::new(0),
        })
    }

    /// Current installation state.
    #[must_use]
    pub fn state(&self) -> InstallState {
        self.inner.lock().state
    }

    /// Whether the sampler is installed.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.state() == InstallState::Installed
    }

    /// Thread the sampler was last requested for.
    #[must_use]
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.inner.lock().current_thread
    }

    /// Number of times installation reached the native layer.
    #[must_use]
    pub fn install_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Target the calling thread for native sampling.
    ///
    /// A no-op when already installed on this thread. The calling thread
    /// must run a [`Looper`]; without one the request is reported, nothing
    /// is installed, and configuration changes cannot retry until native
    /// sampling is requested again from a thread that has one.
    pub fn monitor_current_thread(
        self: &Arc<Self>,
        sampler: &Arc<NativeThreadSampler>,
        config: &Arc<ConfigService>,
        source: &Arc<dyn BlockageSource>,
    ) {
        let current = thread::current().id();
        let handle = Looper::current();
        let has_handle = handle.is_some();
        let register_retry = {
            let mut inner = self.inner.lock();
            if inner.current_thread == Some(current) && inner.state == InstallState::Installed {
                return;
            }
            inner.current_thread = Some(current);
            inner.state = if config.is_native_sampling_enabled() {
                InstallState::PendingInstall
            } else {
                InstallState::Disabled
            };
            inner.target = Some(InstallTarget {
                sampler: Arc::clone(sampler),
                source: Arc::clone(source),
                handle,
            });
            !std::mem::replace(&mut inner.retry_registered, true)
        };

        if !has_handle {
            self.reporter.report(
                InternalErrorKind::DispatchHandleUnavailable,
                "No task queue on the thread requesting native sampling",
                None,
            );
        } else if config.is_native_sampling_enabled() {
            self.install(sampler, source);
        }

        if register_retry {
            config.add_listener(Arc::new(RetryOnConfigChange {
                installer: Arc::downgrade(self),
            }));
        }
    }

    fn install(&self, sampler: &Arc<NativeThreadSampler>, source: &Arc<dyn BlockageSource>) {
        let mut inner = self.inner.lock();
        if inner.state == InstallState::Installed {
            return;
        }
        if inner.current_thread != Some(thread::current().id()) {
            tracing::debug!("Native sampler install skipped on a stale thread");
            return;
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);
        match Self::install_native(self.bitness, sampler) {
            Ok(()) => {
                if !inner.listener_registered {
                    let listener: Arc<dyn BlockedThreadListener> = sampler.clone();
                    source.add_blocked_thread_listener(listener);
                    inner.listener_registered = true;
                }
                inner.state = InstallState::Installed;
                tracing::info!(thread = ?inner.current_thread, "Native sampler installed");
            }
            Err(e) => {
                inner.state = InstallState::PendingInstall;
                self.reporter.report(
                    InternalErrorKind::InstallationFailed,
                    "Native sampler installation failed",
                    Some(&e),
                );
            }
        }
    }

    fn install_native(bitness: Bitness, sampler: &NativeThreadSampler) -> Result<(), NativeError> {
        if !sampler.setup(bitness)? {
            return Err(NativeError::SetupRejected);
        }
        if !sampler.monitor_current_thread()? {
            return Err(NativeError::MonitorRejected);
        }
        Ok(())
    }

    /// Post an install attempt to the latest target's queue.
    fn post_retry(self: &Arc<Self>) {
        let (handle, sampler, source) = {
            let inner = self.inner.lock();
            if inner.state == InstallState::Installed {
                return;
            }
            let Some(target) = &inner.target else {
                return;
            };
            let Some(handle) = target.handle.clone() else {
                tracing::debug!(thread = ?inner.current_thread, "Install retry skipped: no task queue");
                return;
            };
            (handle, Arc::clone(&target.sampler), Arc::clone(&target.source))
        };

        let installer = Arc::clone(self);
        let posted = handle.post(Box::new(move || installer.install(&sampler, &source)));
        if !posted {
            tracing::debug!(thread = ?handle.thread_id(), "Install retry dropped: queue closed");
        }
    }
}

impl std::fmt::Debug for NativeSamplerInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NativeSamplerInstaller")
            .field("state", &inner.state)
            .field("current_thread", &inner.current_thread)
            .field("bitness", &self.bitness)
            .field("attempts", &self.attempts.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct RetryOnConfigChange {
    installer: Weak<NativeSamplerInstaller>,
}

impl ConfigListener for RetryOnConfigChange {
    fn on_config_change(&self, config: &AnrConfig) {
        if !config.native_sampling_enabled {
            return;
        }
        if let Some(installer) = self.installer.upgrade() {
            installer.post_retry();
        }
    }
}
