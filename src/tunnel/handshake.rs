//! TLS session establishment as a resumable step.
//!
//! Each step advances the handshake as far as the socket allows, then
//! registers the readiness rustls asked for and waits at most `busy_timeout`.

use std::os::fd::AsRawFd;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TunnelError};
use crate::poll::{HandleSet, Wake};
use crate::transport::tls::describe_chain;
use crate::transport::TlsIo;
use crate::utils::Timer;

use super::context::{ConnState, ConnectionContext};

/// In-flight handshake of one connection
pub struct Handshaker {
    _timer: Timer,
}

impl Handshaker {
    pub fn new(ctx: &mut ConnectionContext) -> Self {
        ctx.advance(ConnState::HandshakeInProgress);
        ctx.shared.metrics.handshake_attempt();
        Self {
            _timer: Timer::start("tls_handshake"),
        }
    }

    /// Advance the handshake; `Ok(None)` once it completed
    pub fn step(
        &mut self,
        ctx: &mut ConnectionContext,
        handles: &mut HandleSet,
        wake: Wake,
    ) -> Result<Option<Duration>> {
        let result = self.try_step(ctx, handles, wake);
        if result.is_err() {
            ctx.shared.metrics.handshake_failed();
        }
        result
    }

    fn try_step(
        &mut self,
        ctx: &mut ConnectionContext,
        handles: &mut HandleSet,
        wake: Wake,
    ) -> Result<Option<Duration>> {
        match wake {
            Wake::TimedOut => return Err(TunnelError::Timeout("TLS handshake")),
            Wake::Failed(e) => return Err(TunnelError::socket("poll", e)),
            Wake::Start | Wake::Ready(_) => {}
        }

        let busy = ctx.service.settings().busy_timeout;
        let session = ctx
            .tls
            .as_mut()
            .ok_or_else(|| TunnelError::HandshakeError("no TLS session".into()))?;
        let fd = session.as_raw_fd();

        match session.handshake()? {
            TlsIo::Done(_) => {
                established(ctx);
                Ok(None)
            }
            TlsIo::WantRead => {
                debug!(conn = ctx.id(), "TLS handshake wants read");
                handles.init();
                handles.add(fd, true, false);
                Ok(Some(busy))
            }
            TlsIo::WantWrite => {
                debug!(conn = ctx.id(), "TLS handshake wants write");
                handles.init();
                handles.add(fd, false, true);
                Ok(Some(busy))
            }
            TlsIo::ZeroReturn | TlsIo::Eof => Err(TunnelError::HandshakeError(
                crate::error::constants::ERR_HANDSHAKE_EOF.into(),
            )),
        }
    }
}

fn established(ctx: &mut ConnectionContext) {
    let Some(session) = ctx.tls.as_ref() else {
        return;
    };
    let resumed = session.resumed();
    ctx.shared.metrics.handshake_success(resumed);

    if let Some(chain) = session.peer_chain() {
        let service = ctx.service.name();
        if ctx
            .shared
            .peer_chains
            .store_once(service, || describe_chain(&chain))
        {
            debug!(service, certificates = chain.len(), "Peer certificate was cached");
        }
    }

    info!(
        conn = ctx.id(),
        service = %ctx.service.name(),
        session = if resumed { "reused" } else { "new" },
        protocol = ?session.protocol_version(),
        cipher = ?session.cipher_suite(),
        "TLS connected"
    );
}
