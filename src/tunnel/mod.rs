//! # Tunnel Engine
//!
//! Everything above the codec and transport layers: per-connection context,
//! TLS establishment, the duplex transfer loop, the dispatcher and the
//! execution backends that run connection tasks.
//!
//! ## Flow
//! ```text
//! Dispatcher ──accept──▶ ConnectionTask ──▶ Handshake ──▶ Transfer ──▶ teardown
//!      │                        ▲
//!      └── call-home services ──┘ (dial, handshake, transfer, cool down, repeat)
//! ```
//!
//! State shared between connections lives in [`SharedState`] and is passed
//! explicitly; a connection's own buffers and sockets never leave its task.

pub mod backend;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod handshake;
pub mod service;
pub mod signals;
pub mod transfer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::config::{Concurrency, TunnelConfig};
use crate::error::Result;
use crate::transport::PeerChainCache;
use crate::utils::Metrics;

pub use backend::Backend;
pub use connection::ConnectionTask;
pub use context::{ConnState, ConnectionContext};
pub use dispatcher::Dispatcher;
pub use service::Service;
pub use signals::{SignalAction, SignalNotifier, SignalPipe};

/// Process-wide state every connection task can reach
#[derive(Debug)]
pub struct SharedState {
    clients: Mutex<usize>,
    max_clients: AtomicUsize,
    /// Peer certificate chain per service, recorded once
    pub peer_chains: PeerChainCache,
    pub metrics: Metrics,
}

impl SharedState {
    pub fn new(max_clients: usize) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(0),
            max_clients: AtomicUsize::new(max_clients),
            peer_chains: PeerChainCache::new(),
            metrics: Metrics::new(),
        })
    }

    /// Connection tasks currently holding a client slot
    pub fn clients(&self) -> usize {
        *self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients.load(Ordering::Relaxed)
    }

    pub fn set_max_clients(&self, max: usize) {
        self.max_clients.store(max, Ordering::Relaxed);
    }

    /// Take a client slot unless the limit is reached
    pub fn try_admit(self: &Arc<Self>) -> Option<ClientSlot> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if *clients >= self.max_clients() {
            return None;
        }
        *clients += 1;
        Some(ClientSlot {
            shared: self.clone(),
            held: true,
        })
    }

    /// Take a client slot regardless of the limit
    pub fn admit(self: &Arc<Self>) -> ClientSlot {
        *self.clients.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        ClientSlot {
            shared: self.clone(),
            held: true,
        }
    }

    /// Give back a slot whose holder lives in another process
    pub(crate) fn release(&self) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        *clients = clients.saturating_sub(1);
    }
}

/// A counted client; released on drop
#[derive(Debug)]
pub struct ClientSlot {
    shared: Arc<SharedState>,
    held: bool,
}

impl ClientSlot {
    /// Stop counting this slot here; another process releases it
    pub fn forget(&mut self) {
        self.held = false;
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        if self.held {
            self.shared.release();
        }
    }
}

/// Run the tunnel described by `config` until a terminate signal.
///
/// `config_path` is re-read on SIGHUP.
pub fn run(config: TunnelConfig, config_path: Option<PathBuf>) -> Result<()> {
    let shared = SharedState::new(config.global.max_clients);
    let backend = backend::select(config.global.concurrency);
    let signals = SignalPipe::install(config.global.concurrency == Concurrency::Process)?;
    let dispatcher = Dispatcher::new(config, config_path, backend.clone(), shared.clone(), signals)?;

    info!(
        backend = backend.name(),
        pid = std::process::id(),
        "usc-tunnel started"
    );
    backend.run(Box::new(dispatcher))?;
    info!(clients = shared.clients(), "usc-tunnel stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_limit() {
        let shared = SharedState::new(2);
        let a = shared.try_admit().expect("first");
        let _b = shared.try_admit().expect("second");
        assert!(shared.try_admit().is_none());
        drop(a);
        assert_eq!(shared.clients(), 1);
        assert!(shared.try_admit().is_some());
    }

    #[test]
    fn test_forgotten_slot_is_not_released() {
        let shared = SharedState::new(4);
        let mut slot = shared.admit();
        slot.forget();
        drop(slot);
        assert_eq!(shared.clients(), 1);
        shared.release();
        assert_eq!(shared.clients(), 0);
    }
}
