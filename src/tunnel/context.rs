//! Connection context: the buffers, sockets and session binding of one
//! tunnelled connection, plus its scoped teardown.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ServiceRole;
use crate::core::buffer::IoBuffer;
use crate::core::session::SessionBinding;
use crate::transport::socket::reset_on_close;
use crate::transport::TlsSession;

use super::{Service, SharedState};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection; only moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    Created,
    HandshakeInProgress,
    Transferring,
    ShuttingDown,
    Closed,
}

/// Plaintext byte counters of one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounters {
    /// Read from the plain socket
    pub plain_in: u64,
    /// Written to the plain socket
    pub plain_out: u64,
    /// Read from TLS, envelopes included
    pub tls_in: u64,
    /// Written to TLS, envelopes included
    pub tls_out: u64,
}

/// One tunnelled connection
pub struct ConnectionContext {
    id: u64,
    state: ConnState,
    aborted: bool,
    pub(crate) service: Arc<Service>,
    pub(crate) shared: Arc<SharedState>,
    /// Plaintext read locally, framed, waiting for TLS
    pub(crate) to_tls: IoBuffer,
    /// Bytes read from TLS; a delivered prefix followed by undecoded input
    pub(crate) to_plain: IoBuffer,
    pub(crate) plain: Option<TcpStream>,
    pub(crate) tls: Option<TlsSession>,
    pub(crate) binding: Option<SessionBinding>,
    pub(crate) counters: ByteCounters,
}

impl ConnectionContext {
    pub fn new(service: Arc<Service>, shared: Arc<SharedState>) -> Self {
        let size = service.settings().buffer_size;
        let binding = match service.role() {
            ServiceRole::Initiator => Some(SessionBinding::defaults()),
            ServiceRole::Responder => None,
        };
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            state: ConnState::Created,
            aborted: false,
            service,
            shared,
            to_tls: IoBuffer::with_capacity(size),
            to_plain: IoBuffer::with_capacity(size),
            plain: None,
            tls: None,
            binding,
            counters: ByteCounters::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn role(&self) -> ServiceRole {
        self.service.role()
    }

    pub fn binding(&self) -> Option<&SessionBinding> {
        self.binding.as_ref()
    }

    pub fn counters(&self) -> ByteCounters {
        self.counters
    }

    /// Move to `next` if it lies ahead of the current state
    pub fn advance(&mut self, next: ConnState) -> bool {
        if next <= self.state {
            return false;
        }
        if self.state == ConnState::Created {
            self.shared.metrics.connection_established();
        }
        debug!(conn = self.id, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
        true
    }

    /// Teardown will reset the sockets instead of closing them
    pub fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn set_plain(&mut self, stream: TcpStream) {
        self.plain = Some(stream);
    }

    pub fn set_tls(&mut self, session: TlsSession) {
        self.tls = Some(session);
    }

    /// Close the local socket and forget the session binding
    pub(crate) fn detach_plain(&mut self) {
        if let Some(stream) = self.plain.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.binding = None;
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        if self.state == ConnState::Created {
            return;
        }
        self.state = ConnState::Closed;

        let metrics = &self.shared.metrics;
        if self.aborted {
            for stream in self.plain.iter().chain(self.tls.as_ref().map(|t| t.socket())) {
                if let Err(e) = reset_on_close(stream) {
                    warn!(conn = self.id, error = %e, "linger (local)");
                }
            }
            metrics.connection_error();
        }
        metrics.add_bytes(
            self.counters.plain_in,
            self.counters.plain_out,
            self.counters.tls_in,
            self.counters.tls_out,
        );
        metrics.connection_closed();

        let (wire_in, wire_out) = self.tls.as_ref().map(|t| t.wire_bytes()).unwrap_or_default();
        info!(
            conn = self.id,
            service = %self.service.name(),
            sent_to_tls = self.counters.tls_out,
            sent_to_socket = self.counters.plain_out,
            wire_in,
            wire_out,
            "{}",
            if self.aborted { "Connection reset" } else { "Connection closed" }
        );
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("service", &self.service.name())
            .field("to_tls", &self.to_tls)
            .field("to_plain", &self.to_plain)
            .field("binding", &self.binding)
            .field("aborted", &self.aborted)
            .finish()
    }
}
