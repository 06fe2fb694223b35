//! # Cooperative Scheduler
//!
//! Runs many [`Task`]s on one thread. Each scheduling step:
//!
//! 1. releases tasks that finished during the previous step,
//! 2. admits tasks queued through a [`Spawner`],
//! 3. steps every ready task in insertion order,
//! 4. polls the union of all waiting tasks' handle sets with the nearest
//!    deadline as timeout, and moves tasks with readiness or an expired
//!    deadline to the ready queue, again in insertion order.
//!
//! Finished tasks are kept for one extra step so that a task may hand
//! resources to a task it spawned before it is dropped.

use std::collections::VecDeque;
use std::io;
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{poll_fds, HandleSet, Step, Task, Wake};

/// Handle for queuing new tasks from inside a running task
#[derive(Clone, Default)]
pub struct Spawner {
    queue: Arc<Mutex<Vec<Box<dyn Task>>>>,
}

impl Spawner {
    /// Queue `task`; it starts at the next scheduling step
    pub fn spawn(&self, task: Box<dyn Task>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    fn take(&self) -> Vec<Box<dyn Task>> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn has_pending(&self) -> bool {
        !self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

struct Slot {
    task: Box<dyn Task>,
    handles: HandleSet,
    deadline: Option<Instant>,
    wake: Wake,
}

/// Single-threaded run queue over step-machine tasks
#[derive(Default)]
pub struct Scheduler {
    ready: VecDeque<Slot>,
    waiting: Vec<Slot>,
    finished: Vec<Box<dyn Task>>,
    spawner: Spawner,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    pub fn spawn(&mut self, task: Box<dyn Task>) {
        self.ready.push_back(Slot {
            task,
            handles: HandleSet::new(),
            deadline: None,
            wake: Wake::Start,
        });
    }

    /// Tasks still running, ready or waiting
    pub fn task_count(&self) -> usize {
        self.ready.len() + self.waiting.len()
    }

    /// Tasks that finished but have not been released yet
    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    pub fn is_idle(&self) -> bool {
        self.task_count() == 0 && !self.spawner.has_pending()
    }

    /// Run until every task is done
    pub fn run(&mut self) -> io::Result<()> {
        while !self.is_idle() {
            self.run_once()?;
        }
        self.finished.clear();
        Ok(())
    }

    /// One scheduling step
    pub fn run_once(&mut self) -> io::Result<()> {
        self.finished.clear();

        for task in self.spawner.take() {
            self.spawn(task);
        }

        while let Some(mut slot) = self.ready.pop_front() {
            let wake = std::mem::replace(&mut slot.wake, Wake::Start);
            match slot.task.step(&mut slot.handles, wake) {
                Step::Done => self.finished.push(slot.task),
                Step::Wait(timeout) => {
                    slot.deadline = timeout.map(|t| Instant::now() + t);
                    self.waiting.push(slot);
                }
            }
        }

        if self.waiting.is_empty() {
            return Ok(());
        }
        self.poll_waiting()
    }

    fn next_timeout(&self) -> Option<Duration> {
        if self.spawner.has_pending() {
            return Some(Duration::ZERO);
        }
        let now = Instant::now();
        self.waiting
            .iter()
            .filter_map(|s| s.deadline)
            .min()
            .map(|d| d.saturating_duration_since(now))
    }

    fn poll_waiting(&mut self) -> io::Result<()> {
        let mut fds = Vec::new();
        let mut spans: Vec<Range<usize>> = Vec::with_capacity(self.waiting.len());
        for slot in &self.waiting {
            let start = fds.len();
            fds.extend_from_slice(slot.handles.entries());
            spans.push(start..fds.len());
        }

        let timeout = self.next_timeout();
        trace!(fds = fds.len(), tasks = self.waiting.len(), ?timeout, "scheduler poll");

        if let Err(err) = poll_fds(&mut fds, timeout) {
            warn!(error = %err, "scheduler poll failed");
            for mut slot in self.waiting.drain(..) {
                slot.wake = Wake::Failed(copy_error(&err));
                self.ready.push_back(slot);
            }
            return Ok(());
        }

        let now = Instant::now();
        let mut still_waiting = Vec::with_capacity(self.waiting.len());
        for (mut slot, span) in self.waiting.drain(..).zip(spans) {
            let mut ready = 0;
            for (entry, polled) in slot.handles.entries_mut().iter_mut().zip(&fds[span]) {
                entry.revents = polled.revents;
                if polled.revents != 0 {
                    ready += 1;
                }
            }
            if ready > 0 {
                slot.wake = Wake::Ready(ready);
                self.ready.push_back(slot);
            } else if slot.deadline.is_some_and(|d| d <= now) {
                slot.wake = Wake::TimedOut;
                self.ready.push_back(slot);
            } else {
                still_waiting.push(slot);
            }
        }
        self.waiting = still_waiting;
        if !self.ready.is_empty() {
            debug!(ready = self.ready.len(), waiting = self.waiting.len(), "tasks woken");
        }
        Ok(())
    }
}

fn copy_error(err: &io::Error) -> io::Error {
    match err.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(err.kind(), err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        timeout: Duration,
        steps: usize,
    }

    fn wake_kind(wake: &Wake) -> &'static str {
        match wake {
            Wake::Start => "start",
            Wake::Ready(_) => "ready",
            Wake::TimedOut => "timeout",
            Wake::Failed(_) => "failed",
        }
    }

    impl Task for Recorder {
        fn step(&mut self, _handles: &mut HandleSet, wake: Wake) -> Step {
            self.log
                .lock()
                .expect("log")
                .push(format!("{}:{}", self.name, wake_kind(&wake)));
            self.steps += 1;
            if self.steps > 1 {
                return Step::Done;
            }
            Step::Wait(Some(self.timeout))
        }
    }

    #[test]
    fn test_timeout_wakes_in_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut sched = Scheduler::new();
        for name in ["a", "b"] {
            sched.spawn(Box::new(Recorder {
                name,
                log: log.clone(),
                timeout: Duration::from_millis(10),
                steps: 0,
            }));
        }
        sched.run().expect("run");
        let log = log.lock().expect("log");
        assert_eq!(log.len(), 4);
        assert_eq!(
            log.as_slice(),
            &["a:start", "b:start", "a:timeout", "b:timeout"]
        );
    }

    struct Reader {
        sock: UnixStream,
        woke: Arc<AtomicBool>,
    }

    impl Task for Reader {
        fn step(&mut self, handles: &mut HandleSet, wake: Wake) -> Step {
            match wake {
                Wake::Start => {
                    handles.init();
                    handles.add(self.sock.as_raw_fd(), true, false);
                    Step::Wait(Some(Duration::from_secs(5)))
                }
                Wake::Ready(_) => {
                    self.woke
                        .store(handles.can_read(self.sock.as_raw_fd()), Ordering::SeqCst);
                    Step::Done
                }
                _ => Step::Done,
            }
        }
    }

    #[test]
    fn test_readiness_wakes_task() {
        let (a, mut b) = UnixStream::pair().expect("pair");
        let woke = Arc::new(AtomicBool::new(false));
        let mut sched = Scheduler::new();
        sched.spawn(Box::new(Reader {
            sock: a,
            woke: woke.clone(),
        }));
        sched.run_once().expect("first step");
        assert_eq!(sched.task_count(), 1);
        b.write_all(b"ping").expect("write");
        sched.run().expect("run");
        assert!(woke.load(Ordering::SeqCst));
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct Finisher {
        _flag: DropFlag,
    }

    impl Task for Finisher {
        fn step(&mut self, _handles: &mut HandleSet, _wake: Wake) -> Step {
            Step::Done
        }
    }

    #[test]
    fn test_finished_task_released_one_step_late() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut sched = Scheduler::new();
        sched.spawn(Box::new(Finisher {
            _flag: DropFlag(dropped.clone()),
        }));
        sched.run_once().expect("step");
        assert_eq!(sched.finished_count(), 1);
        assert!(!dropped.load(Ordering::SeqCst));
        sched.run_once().expect("step");
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_spawner_admits_next_step() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut sched = Scheduler::new();
        sched.spawner().spawn(Box::new(Finisher {
            _flag: DropFlag(dropped.clone()),
        }));
        assert!(!sched.is_idle());
        assert_eq!(sched.task_count(), 0);
        sched.run().expect("run");
        assert!(dropped.load(Ordering::SeqCst));
        assert!(sched.is_idle());
    }
}
