//! # Socket Helpers
//!
//! Listener setup, non-blocking outbound connects with address failover, and
//! the small socket options the engine toggles.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};
use crate::poll::HandleSet;

const LISTEN_BACKLOG: i32 = 128;

/// Bind a non-blocking listener with `SO_REUSEADDR`
pub fn bind_listener(addr: &str) -> Result<TcpListener> {
    let target = resolve(addr)?
        .into_iter()
        .next()
        .ok_or_else(|| TunnelError::ConfigError(format!("{addr}: no address to bind")))?;
    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| TunnelError::socket("socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| TunnelError::socket("setsockopt", e))?;
    socket
        .bind(&SockAddr::from(target))
        .map_err(|e| TunnelError::socket("bind", e))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| TunnelError::socket("listen", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TunnelError::socket("fcntl", e))?;
    Ok(socket.into())
}

/// Resolve `host:port`
pub fn resolve(addr: &str) -> Result<Vec<SocketAddr>> {
    addr.to_socket_addrs()
        .map(|it| it.collect())
        .map_err(|e| TunnelError::socket("getaddrinfo", e))
}

/// Make an accepted or connected stream ready for the engine
pub fn prepare_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)
}

/// Make the next close send RST instead of FIN
pub fn reset_on_close(stream: &TcpStream) -> io::Result<()> {
    SockRef::from(stream).set_linger(Some(Duration::ZERO))
}

/// Bytes queued in the kernel receive buffer
pub fn bytes_readable(fd: RawFd) -> usize {
    let mut avail: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD as _, &mut avail as *mut libc::c_int) };
    if rc < 0 {
        return 0;
    }
    avail.max(0) as usize
}

/// State of a freshly issued non-blocking connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Connected,
    InProgress,
}

/// Issue a non-blocking connect to `addr`
pub fn start_connect(addr: SocketAddr) -> io::Result<(Socket, ConnectProgress)> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => Ok((socket, ConnectProgress::Connected)),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
            Ok((socket, ConnectProgress::InProgress))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok((socket, ConnectProgress::InProgress)),
        Err(e) => Err(e),
    }
}

/// Result of a connect that `poll` reported writable
pub fn finish_connect(socket: &Socket) -> io::Result<()> {
    if let Some(err) = socket.take_error()? {
        return Err(err);
    }
    socket.peer_addr().map(|_| ())
}

/// Outcome of [`Connector::poll`]
#[derive(Debug)]
pub enum ConnectPoll {
    /// Connected; the stream is non-blocking
    Connected(TcpStream, SocketAddr),
    /// Register write interest on the fd and wait at most this long
    Pending(RawFd, Duration),
    /// Every address failed; carries the last error
    Failed(io::Error),
}

struct Attempt {
    socket: Socket,
    addr: SocketAddr,
    deadline: Instant,
    armed: bool,
}

/// Tries a list of targets in order, each bounded by a connect timeout
pub struct Connector {
    addrs: Vec<SocketAddr>,
    next: usize,
    current: Option<Attempt>,
    timeout: Duration,
    last_error: Option<io::Error>,
}

impl Connector {
    /// Resolve every target up front; unresolvable targets are skipped
    pub fn new(targets: &[String], timeout: Duration) -> Self {
        let mut addrs = Vec::new();
        let mut last_error = None;
        for target in targets {
            match target.to_socket_addrs() {
                Ok(resolved) => addrs.extend(resolved),
                Err(e) => {
                    warn!(target = %target, error = %e, "Failed to resolve connect target");
                    last_error = Some(e);
                }
            }
        }
        Self::from_addrs(addrs, timeout, last_error)
    }

    fn from_addrs(addrs: Vec<SocketAddr>, timeout: Duration, last_error: Option<io::Error>) -> Self {
        Self {
            addrs,
            next: 0,
            current: None,
            timeout,
            last_error,
        }
    }

    /// Addresses not tried yet
    pub fn remaining(&self) -> usize {
        self.addrs.len() - self.next
    }

    /// Advance the connect using the readiness in `handles`
    pub fn poll(&mut self, handles: &HandleSet) -> ConnectPoll {
        loop {
            if let Some(attempt) = self.current.as_mut() {
                let fd = attempt.socket.as_raw_fd();
                let signalled =
                    attempt.armed && (handles.can_write(fd) || handles.error(fd) || handles.hang_up(fd));
                if signalled {
                    let result = finish_connect(&attempt.socket);
                    if let Some(attempt) = self.current.take() {
                        match result {
                            Ok(()) => {
                                debug!(addr = %attempt.addr, "Connected");
                                return ConnectPoll::Connected(attempt.socket.into(), attempt.addr);
                            }
                            Err(e) => {
                                debug!(addr = %attempt.addr, error = %e, "Connect failed");
                                self.last_error = Some(e);
                            }
                        }
                    }
                    continue;
                }
                let now = Instant::now();
                if now >= attempt.deadline {
                    debug!(addr = %attempt.addr, "Connect timed out");
                    self.current = None;
                    self.last_error = Some(io::Error::from_raw_os_error(libc::ETIMEDOUT));
                    continue;
                }
                attempt.armed = true;
                return ConnectPoll::Pending(fd, attempt.deadline - now);
            }

            let Some(&addr) = self.addrs.get(self.next) else {
                return ConnectPoll::Failed(self.last_error.take().unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no target address")
                }));
            };
            self.next += 1;

            match start_connect(addr) {
                Ok((socket, ConnectProgress::Connected)) => {
                    debug!(addr = %addr, "Connected immediately");
                    return ConnectPoll::Connected(socket.into(), addr);
                }
                Ok((socket, ConnectProgress::InProgress)) => {
                    self.current = Some(Attempt {
                        socket,
                        addr,
                        deadline: Instant::now() + self.timeout,
                        armed: false,
                    });
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Connect failed");
                    self.last_error = Some(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_blocking(connector: &mut Connector) -> io::Result<(TcpStream, SocketAddr)> {
        let mut handles = HandleSet::new();
        loop {
            match connector.poll(&handles) {
                ConnectPoll::Connected(stream, addr) => return Ok((stream, addr)),
                ConnectPoll::Failed(e) => return Err(e),
                ConnectPoll::Pending(fd, timeout) => {
                    handles.init();
                    handles.add(fd, false, true);
                    handles.wait(Some(timeout))?;
                }
            }
        }
    }

    fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        addr
    }

    #[test]
    fn test_connect_refused_reports_errno() {
        let mut connector =
            Connector::from_addrs(vec![closed_port()], Duration::from_secs(2), None);
        let err = connect_blocking(&mut connector).expect_err("refused");
        assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
        assert_eq!(connector.remaining(), 0);
    }

    #[test]
    fn test_failover_to_second_address() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let good = listener.local_addr().expect("addr");
        let mut connector =
            Connector::from_addrs(vec![closed_port(), good], Duration::from_secs(2), None);
        let (stream, addr) = connect_blocking(&mut connector).expect("connect");
        assert_eq!(addr, good);
        assert!(stream.peer_addr().is_ok());
    }

    #[test]
    fn test_empty_target_list_fails() {
        let mut connector = Connector::new(&[], Duration::from_secs(1));
        assert!(matches!(
            connector.poll(&HandleSet::new()),
            ConnectPoll::Failed(_)
        ));
    }

    #[test]
    fn test_bind_listener_is_nonblocking() {
        let listener = bind_listener("127.0.0.1:0").expect("bind");
        let err = listener.accept().expect_err("no client");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
