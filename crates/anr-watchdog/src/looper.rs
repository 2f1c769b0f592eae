//! Cooperative single-threaded task queue.
//!
//! The watchdog only needs three things from the monitored thread's queue:
//! post a task, optionally get told when the queue drains, and know which
//! thread runs it. [`TaskQueue`] captures that contract so hosts can plug in
//! their own event loop. [`Looper`] is a small implementation on top of a
//! `crossbeam` channel, used by hosts without an event loop of their own and
//! as the per-thread dispatch handle of the native sampler installer.

use crossbeam::channel::{self, Receiver, Sender};
use std::cell::RefCell;
use std::thread::{self, JoinHandle, ThreadId};

use crate::error::{WatchdogError, WatchdogResult};

/// A unit of work executed on a queue's thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Called when the queue runs out of work. Return `true` to stay registered.
pub type IdleHandler = Box<dyn FnMut() -> bool + Send + 'static>;

/// Task queue of a cooperative thread.
pub trait TaskQueue: Send + Sync {
    /// Enqueue `task`. Returns `false` if the queue no longer runs.
    fn post(&self, task: Task) -> bool;

    /// Register an idle callback. Returns `false` if unsupported or closed.
    fn add_idle_handler(&self, handler: IdleHandler) -> bool;

    /// Thread draining this queue, once known.
    fn thread_id(&self) -> Option<ThreadId>;
}

enum Message {
    Run(Task),
    AddIdleHandler(IdleHandler),
    Quit,
}

thread_local! {
    static CURRENT: RefCell<Option<LooperHandle>> = const { RefCell::new(None) };
}

/// Cloneable handle used to post work to a [`Looper`].
#[derive(Clone)]
pub struct LooperHandle {
    sender: Sender<Message>,
    thread: ThreadId,
    name: Option<String>,
}

impl LooperHandle {
    /// Ask the looper to stop once the tasks queued so far have run.
    pub fn quit(&self) -> bool {
        self.sender.send(Message::Quit).is_ok()
    }

    /// Number of messages waiting to be processed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    /// Name of the looper's thread, if it has one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl TaskQueue for LooperHandle {
    fn post(&self, task: Task) -> bool {
        self.sender.send(Message::Run(task)).is_ok()
    }

    fn add_idle_handler(&self, handler: IdleHandler) -> bool {
        self.sender.send(Message::AddIdleHandler(handler)).is_ok()
    }

    fn thread_id(&self) -> Option<ThreadId> {
        Some(self.thread)
    }
}

impl std::fmt::Debug for LooperHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LooperHandle")
            .field("thread", &self.thread)
            .field("name", &self.name)
            .field("pending", &self.sender.len())
            .finish()
    }
}

/// Task loop bound to the thread that prepared it.
pub struct Looper {
    receiver: Receiver<Message>,
    handle: LooperHandle,
    idle_handlers: Vec<IdleHandler>,
}

impl Looper {
    /// Create the loop for the calling thread and make it [`Looper::current`].
    ///
    /// Preparing again on the same thread replaces the previous handle.
    #[must_use]
    pub fn prepare() -> Self {
        let (sender, receiver) = channel::unbounded();
        let current = thread::current();
        let handle = LooperHandle {
            sender,
            thread: current.id(),
            name: current.name().map(str::to_string),
        };
        CURRENT.with(|slot| *slot.borrow_mut() = Some(handle.clone()));
        Self {
            receiver,
            handle,
            idle_handlers: Vec::new(),
        }
    }

    /// Handle of the calling thread's looper, if one was prepared.
    #[must_use]
    pub fn current() -> Option<LooperHandle> {
        CURRENT.with(|slot| slot.borrow().clone())
    }

    /// Handle for posting to this looper.
    #[must_use]
    pub fn handle(&self) -> LooperHandle {
        self.handle.clone()
    }

    /// Run tasks in submission order until [`LooperHandle::quit`] is called.
    ///
    /// Whenever the queue drains, idle handlers run before blocking for more
    /// work; handlers returning `false` are dropped.
    pub fn run(mut self) {
        loop {
            let message = match self.receiver.try_recv() {
                Ok(message) => message,
                Err(channel::TryRecvError::Empty) => {
                    self.run_idle_handlers();
                    match self.receiver.recv() {
                        Ok(message) => message,
                        Err(channel::RecvError) => break,
                    }
                }
                Err(channel::TryRecvError::Disconnected) => break,
            };

            match message {
                Message::Run(task) => task(),
                Message::AddIdleHandler(handler) => self.idle_handlers.push(handler),
                Message::Quit => break,
            }
        }
        CURRENT.with(|slot| slot.borrow_mut().take());
        tracing::debug!(thread = ?self.handle.thread, "Looper stopped");
    }

    fn run_idle_handlers(&mut self) {
        self.idle_handlers.retain_mut(|handler| handler());
    }

    /// Spawn a named thread running a looper.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned or never reports back.
    pub fn spawn(name: &str) -> WatchdogResult<LooperThread> {
        let (ready_tx, ready_rx) = channel::bounded(1);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let looper = Looper::prepare();
                if ready_tx.send(looper.handle()).is_ok() {
                    looper.run();
                }
            })
            .map_err(|e| WatchdogError::worker_spawn_failed(format!("{name}: {e}")))?;

        let handle = ready_rx
            .recv()
            .map_err(|e| WatchdogError::queue_closed(format!("{name}: {e}")))?;
        Ok(LooperThread {
            handle,
            join: Some(join),
        })
    }
}

impl std::fmt::Debug for Looper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Looper")
            .field("handle", &self.handle)
            .field("idle_handlers", &self.idle_handlers.len())
            .finish()
    }
}

/// A looper running on its own thread.
#[derive(Debug)]
pub struct LooperThread {
    handle: LooperHandle,
    join: Option<JoinHandle<()>>,
}

impl LooperThread {
    /// Handle for posting to the thread.
    #[must_use]
    pub fn handle(&self) -> LooperHandle {
        self.handle.clone()
    }

    /// Stop the looper and wait for its thread to exit.
    pub fn quit_and_join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.handle.quit();
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            tracing::warn!(thread = ?self.handle.thread, "Looper thread panicked");
        }
    }
}

impl Drop for LooperThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_tasks_run_in_order() -> WatchdogResult<()> {
        let looper = Looper::spawn("looper-order")?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = channel::bounded(1);

        for i in 0..10 {
            let seen = seen.clone();
            assert!(looper.handle().post(Box::new(move || seen.lock().push(i))));
        }
        assert!(looper.handle().post(Box::new(move || {
            let _ = done_tx.send(());
        })));

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
        looper.quit_and_join();
        Ok(())
    }

    #[test]
    fn test_idle_handler_runs_until_it_declines() -> WatchdogResult<()> {
        let looper = Looper::spawn("looper-idle")?;
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        assert!(looper.handle().add_idle_handler(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst) < 1
        })));

        for _ in 0..5 {
            assert!(looper.handle().post(Box::new(|| {})));
            thread::sleep(Duration::from_millis(10));
        }

        looper.quit_and_join();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn test_current_is_thread_local() {
        let looper = Looper::prepare();
        let current = Looper::current();
        assert!(current.is_some());
        assert_eq!(
            current.and_then(|h| h.thread_id()),
            Some(thread::current().id())
        );

        let other = thread::spawn(|| Looper::current().is_none()).join();
        assert!(matches!(other, Ok(true)));
        drop(looper);
    }

    #[test]
    fn test_post_after_quit_fails() -> WatchdogResult<()> {
        let looper = Looper::spawn("looper-quit")?;
        let handle = looper.handle();
        looper.quit_and_join();
        assert!(!handle.post(Box::new(|| {})));
        Ok(())
    }
}
