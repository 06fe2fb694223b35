//! # Signal Bridge
//!
//! Handlers only write the signal number into a non-blocking self-pipe. The
//! dispatcher waits on the read end together with its listeners and acts on
//! the signals in normal context.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use libc::c_int;
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};

/// Write end of the installed pipe, read by the handler
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

const HANDLED: [c_int; 5] = [
    libc::SIGHUP,
    libc::SIGUSR1,
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGQUIT,
];

/// What the dispatcher does with a received signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// SIGHUP
    Reload,
    /// SIGUSR1
    ReopenLog,
    /// SIGTERM, SIGINT, SIGQUIT
    Terminate,
    /// SIGCHLD
    Child,
}

impl SignalAction {
    pub fn from_signal(sig: c_int) -> Option<Self> {
        match sig {
            libc::SIGHUP => Some(SignalAction::Reload),
            libc::SIGUSR1 => Some(SignalAction::ReopenLog),
            libc::SIGTERM | libc::SIGINT | libc::SIGQUIT => Some(SignalAction::Terminate),
            libc::SIGCHLD => Some(SignalAction::Child),
            _ => None,
        }
    }

    fn signal(self) -> c_int {
        match self {
            SignalAction::Reload => libc::SIGHUP,
            SignalAction::ReopenLog => libc::SIGUSR1,
            SignalAction::Terminate => libc::SIGTERM,
            SignalAction::Child => libc::SIGCHLD,
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno_location()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn errno_location() -> *mut c_int {
    libc::__error()
}

extern "C" fn on_signal(sig: c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    unsafe {
        let saved = *errno_location();
        let byte = sig as u8;
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        *errno_location() = saved;
    }
}

fn set_handler(sig: c_int, handler: libc::sighandler_t) -> Result<()> {
    let previous = unsafe { libc::signal(sig, handler) };
    if previous == libc::SIG_ERR {
        return Err(TunnelError::SignalError(format!(
            "signal({sig}): {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn create_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [c_int; 2] = [0; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn create_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [c_int; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    Ok(pair)
}

fn write_byte(fd: RawFd, sig: c_int) -> io::Result<()> {
    let byte = sig as u8;
    let rc = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Self-pipe carrying signal numbers to the dispatcher
#[derive(Debug)]
pub struct SignalPipe {
    read: OwnedFd,
    write: OwnedFd,
    installed: Vec<c_int>,
}

impl SignalPipe {
    /// A pipe fed only through [`notify`](Self::notify) and notifiers
    pub fn new() -> Result<Self> {
        let (read, write) =
            create_pipe().map_err(|e| TunnelError::SignalError(format!("pipe: {e}")))?;
        Ok(Self {
            read,
            write,
            installed: Vec::new(),
        })
    }

    /// Create the pipe and route the process signals into it.
    ///
    /// Only one pipe can be installed at a time. SIGCHLD is routed when
    /// `catch_children` is set.
    pub fn install(catch_children: bool) -> Result<Self> {
        let mut pipe = Self::new()?;
        let fd = pipe.write.as_raw_fd();
        if PIPE_WRITE_FD
            .compare_exchange(-1, fd, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TunnelError::SignalError(
                "a signal pipe is already installed".into(),
            ));
        }

        let mut signals = HANDLED.to_vec();
        if catch_children {
            signals.push(libc::SIGCHLD);
        }
        for sig in signals {
            set_handler(sig, on_signal as *const () as libc::sighandler_t)?;
            pipe.installed.push(sig);
        }
        debug!(signals = ?pipe.installed, "Signal handlers installed");
        Ok(pipe)
    }

    /// Descriptor to wait on for readability
    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Both pipe descriptors, for closing in forked children
    pub fn fds(&self) -> [RawFd; 2] {
        [self.read.as_raw_fd(), self.write.as_raw_fd()]
    }

    /// Read every queued signal
    pub fn drain(&self) -> Vec<SignalAction> {
        let mut actions = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rc > 0 {
                for &sig in &buf[..rc as usize] {
                    match SignalAction::from_signal(c_int::from(sig)) {
                        Some(action) => actions.push(action),
                        None => warn!(signal = sig, "Unexpected signal number on pipe"),
                    }
                }
                continue;
            }
            if rc < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }
        actions
    }

    /// Queue `action` as if its signal had arrived
    pub fn notify(&self, action: SignalAction) -> Result<()> {
        write_byte(self.write.as_raw_fd(), action.signal())
            .map_err(|e| TunnelError::SignalError(format!("pipe write: {e}")))
    }

    /// Independent handle that can queue actions from another thread
    pub fn notifier(&self) -> Result<SignalNotifier> {
        let fd = self
            .write
            .try_clone()
            .map_err(|e| TunnelError::SignalError(format!("dup: {e}")))?;
        Ok(SignalNotifier { fd })
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        if self.installed.is_empty() {
            return;
        }
        for &sig in &self.installed {
            let _ = set_handler(sig, libc::SIG_DFL);
        }
        let _ = PIPE_WRITE_FD.compare_exchange(
            self.write.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// Write handle onto a [`SignalPipe`]
#[derive(Debug)]
pub struct SignalNotifier {
    fd: OwnedFd,
}

impl SignalNotifier {
    pub fn notify(&self, action: SignalAction) -> Result<()> {
        write_byte(self.fd.as_raw_fd(), action.signal())
            .map_err(|e| TunnelError::SignalError(format!("pipe write: {e}")))
    }
}

/// Signal dispositions for a forked connection process.
///
/// Reload and log-reopen requests belong to the parent; everything else
/// reverts to the default action.
pub fn reset_child_handlers() {
    PIPE_WRITE_FD.store(-1, Ordering::SeqCst);
    for sig in [libc::SIGHUP, libc::SIGUSR1] {
        let _ = set_handler(sig, libc::SIG_IGN);
    }
    for sig in [libc::SIGTERM, libc::SIGINT, libc::SIGQUIT, libc::SIGCHLD] {
        let _ = set_handler(sig, libc::SIG_DFL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_mapping() {
        assert_eq!(SignalAction::from_signal(libc::SIGHUP), Some(SignalAction::Reload));
        assert_eq!(SignalAction::from_signal(libc::SIGQUIT), Some(SignalAction::Terminate));
        assert_eq!(SignalAction::from_signal(libc::SIGUSR2), None);
    }

    #[test]
    fn test_notify_and_drain_in_order() {
        let pipe = SignalPipe::new().expect("pipe");
        let notifier = pipe.notifier().expect("notifier");
        pipe.notify(SignalAction::Reload).expect("notify");
        notifier.notify(SignalAction::Terminate).expect("notify");
        assert_eq!(
            pipe.drain(),
            vec![SignalAction::Reload, SignalAction::Terminate]
        );
        assert!(pipe.drain().is_empty());
    }

    #[test]
    fn test_installed_handler_writes_to_pipe() {
        let pipe = SignalPipe::install(false).expect("install");
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        assert_eq!(pipe.drain(), vec![SignalAction::ReopenLog]);
        assert!(SignalPipe::install(false).is_err());
        drop(pipe);
        let again = SignalPipe::install(false).expect("reinstall");
        drop(again);
    }
}
