//! The monitor thread.
//!
//! [`MonitorWorker`] owns a dedicated thread that runs submitted jobs, delayed
//! one-shot jobs and an optional fixed-rate tick. All deadline logic and every blockage callback
//! runs here, never on the monitored thread. On start the worker records its
//! identity in the shared [`MonitorThreadHandle`].

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{ErrorReporter, InternalErrorKind, WatchdogError, WatchdogResult};
use crate::listener::panic_message;
use crate::thread::MonitorThreadHandle;

/// One-shot job run on the monitor thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

type TickFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// Something that can run jobs on the monitor thread.
pub trait MonitorDispatch: Send + Sync {
    /// Queue `job` without blocking. Returns `false` if it was dropped.
    fn dispatch(&self, job: Job) -> bool;

    /// Queue `job` to run once after `delay`. Returns `false` if it was dropped.
    fn dispatch_after(&self, delay: Duration, job: Job) -> bool;
}

enum Command {
    Run(Job),
    RunAt(Instant, Job),
    Wake,
    Shutdown,
}

struct Tick {
    period: Duration,
    next: Instant,
    action: TickFn,
}

/// Dedicated monitor thread with a job queue and a fixed-rate tick.
pub struct MonitorWorker {
    sender: Sender<Command>,
    tick: Arc<Mutex<Option<Tick>>>,
    thread: MonitorThreadHandle,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorWorker {
    /// Spawn the monitor thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(
        name: &str,
        thread: MonitorThreadHandle,
        reporter: Arc<dyn ErrorReporter>,
    ) -> WatchdogResult<Self> {
        let (sender, receiver) = channel::unbounded();
        let tick: Arc<Mutex<Option<Tick>>> = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = channel::bounded(1);

        let loop_tick = Arc::clone(&tick);
        let loop_thread = thread.clone();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop_thread.set_current();
                if ready_tx.send(()).is_ok() {
                    Self::worker_main(&receiver, &loop_tick, reporter.as_ref());
                }
            })
            .map_err(|e| WatchdogError::worker_spawn_failed(format!("{name}: {e}")))?;

        // The monitor thread must be registered before any job can assert it.
        ready_rx
            .recv()
            .map_err(|e| WatchdogError::worker_spawn_failed(format!("{name}: {e}")))?;

        tracing::info!(name, "Monitor worker started");
        Ok(Self {
            sender,
            tick,
            thread,
            join: Mutex::new(Some(join)),
        })
    }

    fn worker_main(
        receiver: &Receiver<Command>,
        tick: &Mutex<Option<Tick>>,
        reporter: &dyn ErrorReporter,
    ) {
        let mut delayed: Vec<(Instant, Job)> = Vec::new();
        loop {
            let next_tick = tick.lock().as_ref().map(|t| t.next);
            let next_delayed = delayed.iter().map(|(at, _)| *at).min();
            let deadline = match (next_tick, next_delayed) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let command = match deadline {
                Some(next) => {
                    let wait = next.saturating_duration_since(Instant::now());
                    match receiver.recv_timeout(wait) {
                        Ok(command) => Some(command),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match receiver.recv() {
                    Ok(command) => Some(command),
                    Err(channel::RecvError) => break,
                },
            };

            match command {
                Some(Command::Run(job)) => Self::run_guarded(job, reporter),
                Some(Command::RunAt(at, job)) => delayed.push((at, job)),
                Some(Command::Wake) | None => {}
                Some(Command::Shutdown) => break,
            }

            let now = Instant::now();
            if delayed.iter().any(|(at, _)| *at <= now) {
                let (due, pending): (Vec<_>, Vec<_>) =
                    delayed.drain(..).partition(|(at, _)| *at <= now);
                delayed = pending;
                for (_, job) in due {
                    Self::run_guarded(job, reporter);
                }
            }

            let due = {
                let mut guard = tick.lock();
                match guard.as_mut() {
                    Some(t) if Instant::now() >= t.next => {
                        let now = Instant::now();
                        t.next = t.next.checked_add(t.period).unwrap_or(now);
                        // Missed periods collapse into a single catch-up tick.
                        if t.next < now {
                            t.next = now;
                        }
                        Some(Arc::clone(&t.action))
                    }
                    _ => None,
                }
            };
            if let Some(action) = due {
                Self::run_guarded(Box::new(move || action()), reporter);
            }
        }
        tracing::info!(dropped = delayed.len(), "Monitor worker stopping");
    }

    fn run_guarded(job: Job, reporter: &dyn ErrorReporter) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            let message = format!(
                "Monitor job panicked: {}",
                panic_message(payload.as_ref())
            );
            reporter.report(InternalErrorKind::HeartbeatCheckFailed, &message, None);
        }
    }

    /// Queue `job` for the monitor thread. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::WorkerStopped`] after shutdown.
    pub fn submit<F>(&self, job: F) -> WatchdogResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Command::Run(Box::new(job)))
            .map_err(|_closed| WatchdogError::WorkerStopped)
    }

    /// Run `job` once on the monitor thread after `delay`. Never blocks.
    ///
    /// Jobs still pending at shutdown are dropped without running.
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::WorkerStopped`] after shutdown.
    pub fn schedule_once<F>(&self, delay: Duration, job: F) -> WatchdogResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let at = Instant::now().checked_add(delay).unwrap_or_else(Instant::now);
        self.sender
            .send(Command::RunAt(at, Box::new(job)))
            .map_err(|_closed| WatchdogError::WorkerStopped)
    }

    /// Run `action` every `period`, first immediately. Replaces any existing tick.
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::WorkerStopped`] after shutdown.
    pub fn schedule_at_fixed_rate<F>(&self, period: Duration, action: F) -> WatchdogResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.tick.lock() = Some(Tick {
            period,
            next: Instant::now(),
            action: Arc::new(action),
        });
        self.sender
            .send(Command::Wake)
            .map_err(|_closed| WatchdogError::WorkerStopped)
    }

    /// Remove the fixed-rate tick. Returns `false` if none was scheduled.
    ///
    /// Safe to call from the monitor thread itself.
    pub fn cancel_tick(&self) -> bool {
        self.tick.lock().take().is_some()
    }

    /// Whether a fixed-rate tick is scheduled.
    #[must_use]
    pub fn has_tick(&self) -> bool {
        self.tick.lock().is_some()
    }

    /// Identity of the monitor thread.
    #[must_use]
    pub fn thread(&self) -> &MonitorThreadHandle {
        &self.thread
    }

    /// Stop the monitor thread and wait for it, unless called from it.
    pub fn shutdown(&self) {
        // Ignore the error: the loop may already have exited.
        if self.sender.send(Command::Shutdown).is_err() {
            tracing::debug!("Monitor worker already stopped");
        }
        if self.thread.is_current() {
            return;
        }
        if let Some(join) = self.join.lock().take()
            && join.join().is_err()
        {
            tracing::warn!("Monitor worker thread panicked");
        }
    }
}

impl MonitorDispatch for MonitorWorker {
    fn dispatch(&self, job: Job) -> bool {
        self.sender.send(Command::Run(job)).is_ok()
    }

    fn dispatch_after(&self, delay: Duration, job: Job) -> bool {
        self.schedule_once(delay, job).is_ok()
    }
}

impl Drop for MonitorWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MonitorWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorWorker")
            .field("thread", &self.thread.get())
            .field("has_tick", &self.has_tick())
            .finish_non_exhaustive()
    }
}
