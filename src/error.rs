//! # Error Types
//!
//! Error handling for the tunnel engine.
//!
//! Every fallible step in the engine returns [`Result`]. A connection task that
//! receives an error from any step aborts and runs its scoped teardown; the
//! dispatcher never sees per-connection errors.
//!
//! ## Error Categories
//! - **Transient I/O**: would-block, interrupted system calls. Never surfaced,
//!   see [`classify_socket_error`].
//! - **Protocol**: malformed or colliding USC envelopes.
//! - **Transport**: socket failures, TLS alerts, busy timeouts.
//! - **Startup**: configuration, bind and signal-pipe failures.
//!
//! ## Example Usage
//! ```rust
//! use usc_tunnel::error::{classify_socket_error, SocketErrorClass};
//! use std::io;
//!
//! let err = io::Error::from(io::ErrorKind::WouldBlock);
//! assert_eq!(classify_socket_error(&err), SocketErrorClass::Retry);
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Buffer errors
    pub const ERR_SHORT_ENVELOPE: &str = "Buffer shorter than a USC envelope";

    /// Connection errors
    pub const ERR_UNSENT_BYTES: &str = "Socket closed with unsent bytes";
    pub const ERR_STALLED: &str = "Transfer loop made no progress";

    /// TLS errors
    pub const ERR_HANDSHAKE_EOF: &str = "Peer closed the socket during the TLS handshake";
    pub const ERR_NO_CERTIFICATES: &str = "No certificates found";
    pub const ERR_NO_PRIVATE_KEY: &str = "No supported private key found";
}

/// TunnelError is the error type for all engine operations
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{call} failed: {source}")]
    Socket {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Timeout during {0}")]
    Timeout(&'static str),

    #[error("Connection aborted: {0}")]
    Aborted(String),

    #[error("Buffer overflow: {requested} bytes requested, {available} available")]
    BufferOverflow { requested: usize, available: usize },

    #[error("Invalid USC envelope: {0}")]
    InvalidEnvelope(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Signal handling error: {0}")]
    SignalError(String),

    #[error("Backend error: {0}")]
    BackendError(String),
}

impl TunnelError {
    /// Wrap an I/O error with the name of the call that produced it
    pub fn socket(call: &'static str, source: io::Error) -> Self {
        TunnelError::Socket { call, source }
    }
}

impl From<rustls::Error> for TunnelError {
    fn from(err: rustls::Error) -> Self {
        TunnelError::TlsError(err.to_string())
    }
}

/// Type alias for Results using TunnelError
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Outcome class of a failed socket call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketErrorClass {
    /// The peer closed the channel; mark the direction closed and carry on
    Closed,
    /// Non-critical; retry the call on the next iteration
    Retry,
    /// Critical; abort the connection
    Fatal,
}

/// Classify a socket error the way the transfer loop reacts to it.
///
/// `EPIPE` and `ECONNABORTED` mean the channel is closed. `EINTR`,
/// `EWOULDBLOCK` and `EAGAIN` are retried. Everything else aborts.
pub fn classify_socket_error(err: &io::Error) -> SocketErrorClass {
    match err.raw_os_error() {
        Some(0) => SocketErrorClass::Closed,
        Some(code) if code == libc::EPIPE || code == libc::ECONNABORTED => {
            SocketErrorClass::Closed
        }
        Some(code) if code == libc::EINTR || code == libc::EWOULDBLOCK || code == libc::EAGAIN => {
            SocketErrorClass::Retry
        }
        Some(_) => SocketErrorClass::Fatal,
        None => match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => SocketErrorClass::Retry,
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted => {
                SocketErrorClass::Closed
            }
            _ => SocketErrorClass::Fatal,
        },
    }
}

/// True when an accept failure means the process ran out of descriptors or memory
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EMFILE
            || code == libc::ENFILE
            || code == libc::ENOBUFS
            || code == libc::ENOMEM
    )
}
