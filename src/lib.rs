//! # usc-tunnel
//!
//! TLS tunnel endpoint that carries NETCONF sessions inside USC envelopes.
//!
//! One side (the *initiator*) accepts plaintext NETCONF clients and wraps each
//! chunk it reads in an 8-byte USC envelope before pushing it through TLS. The
//! other side (the *responder*) terminates TLS, strips the envelopes, binds the
//! session carried in the first envelope and forwards the payload to the local
//! NETCONF server. A responder can also *call home*: it dials out to the
//! management station and then plays the TLS server role on that connection.
//!
//! ## Layout
//! - [`core`]: envelope codec, fixed-capacity buffers, session binding
//! - [`poll`]: readiness handle sets and the cooperative scheduler
//! - [`transport`]: sockets, TLS sessions, session caches
//! - [`tunnel`]: connection context, handshake, transfer engine, dispatcher
//! - [`utils`]: logging and metrics
//!
//! ## Concurrency
//! Every connection is a step machine implementing [`poll::Task`]. The same task
//! runs unchanged on an OS thread, in a forked child process, or inside the
//! single-threaded [`poll::scheduler::Scheduler`].

pub mod config;
pub mod core;
pub mod error;
pub mod poll;
pub mod transport;
pub mod tunnel;
pub mod utils;

pub use config::TunnelConfig;
pub use error::{Result, TunnelError};
