//! # Readiness Multiplexer
//!
//! Descriptor readiness sets and the step-machine task model every backend
//! drives.
//!
//! A connection is written once as a [`Task`]: a state machine whose
//! [`step`](Task::step) registers interest in a [`HandleSet`] and returns
//! [`Step::Wait`]. The driver blocks until a registered descriptor is ready or
//! the timeout elapses, then calls `step` again with the outcome. Whether the
//! driver is a dedicated thread ([`drive`]), a forked child, or the
//! [`scheduler::Scheduler`] polling many tasks at once is invisible to the task.
//!
//! ## Example Usage
//! ```rust,no_run
//! use std::net::TcpStream;
//! use std::os::fd::AsRawFd;
//! use std::time::Duration;
//! use usc_tunnel::poll::HandleSet;
//!
//! let stream = TcpStream::connect("127.0.0.1:830").unwrap();
//! let mut set = HandleSet::new();
//! set.add(stream.as_raw_fd(), true, false);
//! if set.wait(Some(Duration::from_secs(1))).unwrap() > 0 && set.can_read(stream.as_raw_fd()) {
//!     // read without blocking
//! }
//! ```

pub mod scheduler;

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

#[cfg(any(target_os = "linux", target_os = "android"))]
const POLL_READ_HANG_UP: libc::c_short = libc::POLLRDHUP;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const POLL_READ_HANG_UP: libc::c_short = 0;

/// Ordered set of descriptors with read/write interest for one wait
#[derive(Default)]
pub struct HandleSet {
    fds: Vec<libc::pollfd>,
}

impl HandleSet {
    pub fn new() -> Self {
        Self { fds: Vec::new() }
    }

    /// Forget all registrations and results from the previous wait
    pub fn init(&mut self) {
        self.fds.clear();
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Register interest; a second call for the same fd merges into its entry
    pub fn add(&mut self, fd: RawFd, want_read: bool, want_write: bool) {
        let mut events: libc::c_short = 0;
        if want_read {
            events |= libc::POLLIN | POLL_READ_HANG_UP;
        }
        if want_write {
            events |= libc::POLLOUT;
        }
        match self.fds.iter_mut().find(|p| p.fd == fd) {
            Some(entry) => entry.events |= events,
            None => self.fds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            }),
        }
    }

    /// Block until a registered fd is ready or `timeout` elapses.
    ///
    /// `None` waits indefinitely. Interrupted waits are resumed with the
    /// remaining time. Returns the number of ready descriptors, zero on timeout.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        poll_fds(&mut self.fds, timeout)
    }

    fn revents(&self, fd: RawFd) -> libc::c_short {
        self.fds
            .iter()
            .find(|p| p.fd == fd)
            .map(|p| p.revents)
            .unwrap_or(0)
    }

    pub fn can_read(&self, fd: RawFd) -> bool {
        self.revents(fd) & (libc::POLLIN | libc::POLLERR) != 0
    }

    pub fn can_write(&self, fd: RawFd) -> bool {
        self.revents(fd) & (libc::POLLOUT | libc::POLLERR) != 0
    }

    /// Both directions hung up
    pub fn hang_up(&self, fd: RawFd) -> bool {
        self.revents(fd) & libc::POLLHUP != 0
    }

    /// Peer shut down its write side
    pub fn read_hang_up(&self, fd: RawFd) -> bool {
        POLL_READ_HANG_UP != 0 && self.revents(fd) & POLL_READ_HANG_UP != 0
    }

    /// Error or invalid descriptor reported for `fd`
    pub fn error(&self, fd: RawFd) -> bool {
        self.revents(fd) & (libc::POLLERR | libc::POLLNVAL) != 0
    }

    pub(crate) fn entries(&self) -> &[libc::pollfd] {
        &self.fds
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [libc::pollfd] {
        &mut self.fds
    }
}

impl std::fmt::Debug for HandleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        for p in &self.fds {
            list.entry(&(p.fd, p.events, p.revents));
        }
        list.finish()
    }
}

fn timeout_millis(remaining: Option<Duration>) -> libc::c_int {
    match remaining {
        None => -1,
        Some(d) => {
            // round up so a sub-millisecond remainder does not spin
            let ms = d.as_micros().div_ceil(1000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// `poll(2)` over `fds`, retrying `EINTR` with the remaining time
pub(crate) fn poll_fds(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    for p in fds.iter_mut() {
        p.revents = 0;
    }
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout_millis(remaining),
            )
        };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
        tracing::trace!("poll interrupted, retrying");
    }
}

/// What a task asks its driver to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Wait on the registered handles, at most this long (`None` = forever)
    Wait(Option<Duration>),
    /// The task finished; drop it
    Done,
}

/// Why a task is being stepped
#[derive(Debug)]
pub enum Wake {
    /// First step
    Start,
    /// The wait returned this many ready descriptors
    Ready(usize),
    /// The wait timed out with nothing ready
    TimedOut,
    /// The wait itself failed
    Failed(io::Error),
}

/// A resumable unit of work driven by readiness
pub trait Task: Send {
    /// Advance until the task must wait or is done
    fn step(&mut self, handles: &mut HandleSet, wake: Wake) -> Step;

    /// The task is being dropped unstarted in a process that handed it to another one
    fn detach(&mut self) {}
}

/// Run `task` to completion on the current thread
pub fn drive(mut task: Box<dyn Task>) {
    let mut handles = HandleSet::new();
    let mut wake = Wake::Start;
    loop {
        match task.step(&mut handles, wake) {
            Step::Done => return,
            Step::Wait(timeout) => {
                wake = match handles.wait(timeout) {
                    Ok(0) => Wake::TimedOut,
                    Ok(n) => Wake::Ready(n),
                    Err(e) => Wake::Failed(e),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_add_is_idempotent() {
        let mut set = HandleSet::new();
        set.add(5, true, false);
        set.add(5, false, true);
        set.add(5, true, false);
        assert_eq!(set.len(), 1);
        let entry = set.entries()[0];
        assert_ne!(entry.events & libc::POLLIN, 0);
        assert_ne!(entry.events & libc::POLLOUT, 0);
    }

    #[test]
    fn test_unknown_fd_not_ready() {
        let (a, _b) = UnixStream::pair().expect("pair");
        let mut set = HandleSet::new();
        set.add(a.as_raw_fd(), false, true);
        assert_eq!(set.wait(Some(Duration::from_millis(100))).expect("wait"), 1);
        assert!(set.can_write(a.as_raw_fd()));
        assert!(!set.can_read(9999));
        assert!(!set.can_write(9999));
        assert!(!set.hang_up(9999));
    }

    #[test]
    fn test_wait_times_out() {
        let (a, _b) = UnixStream::pair().expect("pair");
        let mut set = HandleSet::new();
        set.add(a.as_raw_fd(), true, false);
        let start = Instant::now();
        assert_eq!(set.wait(Some(Duration::from_millis(30))).expect("wait"), 0);
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert!(!set.can_read(a.as_raw_fd()));
    }

    #[test]
    fn test_read_readiness_and_hang_up() {
        let (a, mut b) = UnixStream::pair().expect("pair");
        b.write_all(b"x").expect("write");
        drop(b);
        let mut set = HandleSet::new();
        set.add(a.as_raw_fd(), true, false);
        assert!(set.wait(Some(Duration::from_millis(100))).expect("wait") > 0);
        assert!(set.can_read(a.as_raw_fd()));
        #[cfg(target_os = "linux")]
        assert!(set.read_hang_up(a.as_raw_fd()));
    }

    #[test]
    fn test_timeout_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(0))), 0);
        assert_eq!(timeout_millis(Some(Duration::from_millis(1500))), 1500);
    }
}
