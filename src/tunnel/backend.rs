//! # Execution Backends
//!
//! Where connection tasks run. The dispatcher hands every accepted or
//! call-home connection to [`Backend::spawn`]; the task itself is the same
//! step machine whichever backend drives it.
//!
//! - [`ThreadBackend`]: one OS thread per connection
//! - [`ForkBackend`]: one child process per connection; the parent releases
//!   client slots as children are reaped
//! - [`CooperativeBackend`]: every task on the dispatcher's thread, stepped by
//!   the [`Scheduler`]

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{debug, warn};

use crate::config::Concurrency;
use crate::error::{Result, TunnelError};
use crate::poll::scheduler::{Scheduler, Spawner};
use crate::poll::{drive, HandleSet, Step, Task, Wake};

use super::signals;
use super::SharedState;

/// Runs connection tasks
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start running `task` concurrently with the caller
    fn spawn(&self, task: Box<dyn Task>) -> Result<()>;

    /// Drive `root` (the dispatcher) until it finishes
    fn run(&self, root: Box<dyn Task>) -> Result<()>;

    /// Collect finished child processes
    fn reap(&self, _shared: &SharedState) {}

    /// Descriptors a child process must close right after it starts
    fn set_parent_fds(&self, _fds: Vec<RawFd>) {}
}

/// Backend for the configured concurrency model
pub fn select(concurrency: Concurrency) -> Arc<dyn Backend> {
    match concurrency {
        Concurrency::Thread => Arc::new(ThreadBackend::default()),
        Concurrency::Process => Arc::new(ForkBackend::default()),
        Concurrency::Cooperative => Arc::new(CooperativeBackend::new()),
    }
}

/// One OS thread per connection
#[derive(Debug, Default)]
pub struct ThreadBackend {
    next_id: AtomicU64,
}

impl Backend for ThreadBackend {
    fn name(&self) -> &'static str {
        "thread"
    }

    fn spawn(&self, task: Box<dyn Task>) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("conn-{id}"))
            .spawn(move || drive(task))
            .map(|_| ())
            .map_err(|e| TunnelError::BackendError(format!("thread spawn failed: {e}")))
    }

    fn run(&self, root: Box<dyn Task>) -> Result<()> {
        drive(root);
        Ok(())
    }
}

/// One child process per connection
#[derive(Debug, Default)]
pub struct ForkBackend {
    parent_fds: Mutex<Vec<RawFd>>,
}

impl Backend for ForkBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn spawn(&self, mut task: Box<dyn Task>) -> Result<()> {
        // SAFETY: the dispatcher is single threaded in this mode; the child
        // only closes descriptors, resets handlers and runs the task.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(TunnelError::BackendError(format!(
                "fork failed: {}",
                io::Error::last_os_error()
            ))),
            0 => {
                let fds = self
                    .parent_fds
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for fd in fds {
                    // SAFETY: these descriptors belong to the parent's
                    // listeners and signal pipe and are never used here.
                    unsafe {
                        libc::close(fd);
                    }
                }
                signals::reset_child_handlers();
                drive(task);
                // SAFETY: leave without running the parent's atexit handlers
                unsafe { libc::_exit(0) }
            }
            pid => {
                debug!(pid, "Connection process started");
                task.detach();
                Ok(())
            }
        }
    }

    fn run(&self, root: Box<dyn Task>) -> Result<()> {
        drive(root);
        Ok(())
    }

    fn reap(&self, shared: &SharedState) {
        loop {
            let mut status: libc::c_int = 0;
            // SAFETY: plain non-blocking waitpid on any child
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            if libc::WIFSIGNALED(status) {
                warn!(pid, signal = libc::WTERMSIG(status), "Connection process terminated by signal");
            } else {
                debug!(pid, status = libc::WEXITSTATUS(status), "Connection process finished");
            }
            shared.release();
        }
    }

    fn set_parent_fds(&self, fds: Vec<RawFd>) {
        *self.parent_fds.lock().unwrap_or_else(PoisonError::into_inner) = fds;
    }
}

/// Every task on one thread
pub struct CooperativeBackend {
    scheduler: Mutex<Option<Scheduler>>,
    spawner: Mutex<Spawner>,
}

impl CooperativeBackend {
    pub fn new() -> Self {
        let scheduler = Scheduler::new();
        let spawner = scheduler.spawner();
        Self {
            scheduler: Mutex::new(Some(scheduler)),
            spawner: Mutex::new(spawner),
        }
    }
}

impl Default for CooperativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CooperativeBackend {
    fn name(&self) -> &'static str {
        "cooperative"
    }

    fn spawn(&self, task: Box<dyn Task>) -> Result<()> {
        self.spawner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(task);
        Ok(())
    }

    fn run(&self, root: Box<dyn Task>) -> Result<()> {
        let mut scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TunnelError::BackendError("scheduler already running".into()))?;

        let done = Arc::new(AtomicBool::new(false));
        scheduler.spawn(Box::new(RootTask {
            inner: root,
            done: done.clone(),
        }));
        let result = loop {
            if done.load(Ordering::Acquire) || scheduler.is_idle() {
                break Ok(());
            }
            if let Err(e) = scheduler.run_once() {
                break Err(TunnelError::socket("poll", e));
            }
        };
        debug!(remaining = scheduler.task_count(), "Scheduler stopped");
        drop(scheduler);

        let fresh = Scheduler::new();
        *self.spawner.lock().unwrap_or_else(PoisonError::into_inner) = fresh.spawner();
        *self.scheduler.lock().unwrap_or_else(PoisonError::into_inner) = Some(fresh);
        result
    }
}

/// Flags the end of the dispatcher so the scheduler can stop
struct RootTask {
    inner: Box<dyn Task>,
    done: Arc<AtomicBool>,
}

impl Task for RootTask {
    fn step(&mut self, handles: &mut HandleSet, wake: Wake) -> Step {
        let step = self.inner.step(handles, wake);
        if step == Step::Done {
            self.done.store(true, Ordering::Release);
        }
        step
    }
}
