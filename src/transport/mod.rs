//! # Transport Layer
//!
//! Sockets and TLS underneath the tunnel engine.
//!
//! ## Components
//! - **socket**: listeners, non-blocking connects with failover, socket options
//! - **tls**: rustls configuration builders and the non-blocking session
//! - **session_cache**: server-side session resumption and peer-chain cache

pub mod session_cache;
pub mod socket;
pub mod tls;

pub use session_cache::{PeerChainCache, SessionCache};
pub use tls::{ShutdownState, TlsIo, TlsSession};
