//! Connection task: one tunnelled connection from accept (or dial-out) to
//! teardown, written as a resumable step machine so every backend can run it.
//!
//! ```text
//! Start ─▶ [Connect] ─▶ Handshake ─▶ Transfer ─▶ Done
//!   ▲                                              │
//!   └──────────── Cooldown ◀── call-home only ─────┘
//! ```

use std::mem;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::ServiceRole;
use crate::error::{Result, TunnelError};
use crate::poll::{HandleSet, Step, Task, Wake};
use crate::transport::socket::{prepare_stream, ConnectPoll, Connector};

use super::context::{ConnState, ConnectionContext};
use super::handshake::Handshaker;
use super::transfer::{Transfer, TransferStep};
use super::{ClientSlot, Service, SharedState};

enum Origin {
    Accepted {
        stream: Option<TcpStream>,
        peer: SocketAddr,
    },
    CallHome,
}

enum Phase {
    Start,
    Connect(Connector),
    Handshake(Handshaker),
    Transfer(Transfer),
    Cooldown(Instant),
    Done,
}

/// Task driving one connection of a service
pub struct ConnectionTask {
    service: Arc<Service>,
    shared: Arc<SharedState>,
    origin: Origin,
    ctx: Option<ConnectionContext>,
    phase: Phase,
    slot: ClientSlot,
}

impl ConnectionTask {
    /// Connection accepted on the service's listener
    pub fn accepted(
        service: Arc<Service>,
        shared: Arc<SharedState>,
        stream: TcpStream,
        peer: SocketAddr,
        slot: ClientSlot,
    ) -> Self {
        Self {
            service,
            shared,
            origin: Origin::Accepted {
                stream: Some(stream),
                peer,
            },
            ctx: None,
            phase: Phase::Start,
            slot,
        }
    }

    /// Call-home loop: dial the management station, serve, cool down, repeat
    pub fn call_home(service: Arc<Service>, shared: Arc<SharedState>, slot: ClientSlot) -> Self {
        Self {
            service,
            shared,
            origin: Origin::CallHome,
            ctx: None,
            phase: Phase::Start,
            slot,
        }
    }

    fn begin(&mut self) -> Result<Phase> {
        let mut ctx = ConnectionContext::new(self.service.clone(), self.shared.clone());
        let settings = self.service.settings();

        let phase = match &mut self.origin {
            Origin::Accepted { stream, peer } => {
                let stream = stream
                    .take()
                    .ok_or_else(|| TunnelError::Aborted("accepted socket already used".into()))?;
                info!(
                    conn = ctx.id(),
                    service = %self.service.name(),
                    peer = %peer,
                    "Service accepted connection"
                );
                match self.service.role() {
                    ServiceRole::Responder => {
                        ctx.set_tls(self.service.open_session(stream)?);
                        Phase::Handshake(Handshaker::new(&mut ctx))
                    }
                    ServiceRole::Initiator => {
                        ctx.set_plain(stream);
                        Phase::Connect(Connector::new(&settings.connect, settings.connect_timeout))
                    }
                }
            }
            Origin::CallHome => {
                let targets: Vec<String> = settings.call_home.iter().cloned().collect();
                info!(
                    conn = ctx.id(),
                    service = %self.service.name(),
                    target = ?settings.call_home,
                    "Calling home"
                );
                Phase::Connect(Connector::new(&targets, settings.connect_timeout))
            }
        };
        self.ctx = Some(ctx);
        Ok(phase)
    }

    fn context(&mut self) -> Result<&mut ConnectionContext> {
        self.ctx
            .as_mut()
            .ok_or_else(|| TunnelError::Aborted("connection context missing".into()))
    }

    fn advance(&mut self, handles: &mut HandleSet, mut wake: Wake) -> Result<Step> {
        loop {
            let next = match mem::replace(&mut self.phase, Phase::Done) {
                Phase::Start => self.begin()?,

                Phase::Connect(mut connector) => {
                    if let Wake::Failed(e) = wake {
                        return Err(TunnelError::socket("poll", e));
                    }
                    match connector.poll(handles) {
                        ConnectPoll::Pending(fd, timeout) => {
                            handles.init();
                            handles.add(fd, false, true);
                            self.phase = Phase::Connect(connector);
                            return Ok(Step::Wait(Some(timeout)));
                        }
                        ConnectPoll::Failed(e) => return Err(TunnelError::socket("connect", e)),
                        ConnectPoll::Connected(stream, addr) => {
                            if let Err(e) = prepare_stream(&stream) {
                                debug!(error = %e, "Failed to set remote socket options");
                            }
                            let session = self.service.open_session(stream)?;
                            let ctx = self.context()?;
                            info!(conn = ctx.id(), remote = %addr, "Remote connected");
                            ctx.set_tls(session);
                            Phase::Handshake(Handshaker::new(ctx))
                        }
                    }
                }

                Phase::Handshake(mut handshaker) => {
                    let ctx = self.context()?;
                    match handshaker.step(ctx, handles, wake)? {
                        Some(timeout) => {
                            self.phase = Phase::Handshake(handshaker);
                            return Ok(Step::Wait(Some(timeout)));
                        }
                        None => {
                            ctx.advance(ConnState::Transferring);
                            Phase::Transfer(Transfer::new(ctx))
                        }
                    }
                }

                Phase::Transfer(mut transfer) => {
                    let ctx = self.context()?;
                    match transfer.step(ctx, handles, wake)? {
                        TransferStep::Wait(timeout) => {
                            self.phase = Phase::Transfer(transfer);
                            return Ok(Step::Wait(timeout));
                        }
                        TransferStep::Finished => {
                            self.ctx = None;
                            self.after_close()
                        }
                    }
                }

                Phase::Cooldown(until) => {
                    let now = Instant::now();
                    if now < until {
                        handles.init();
                        self.phase = Phase::Cooldown(until);
                        return Ok(Step::Wait(Some(until - now)));
                    }
                    Phase::Start
                }

                Phase::Done => return Ok(Step::Done),
            };
            self.phase = next;
            wake = Wake::Start;
        }
    }

    fn after_close(&self) -> Phase {
        match self.origin {
            Origin::CallHome => {
                let base = self.service.settings().call_home_retry;
                let factor = rand::rng().random_range(0.9..=1.1);
                let delay = base.mul_f64(factor).max(Duration::from_millis(10));
                debug!(service = %self.service.name(), ?delay, "Call-home retry scheduled");
                Phase::Cooldown(Instant::now() + delay)
            }
            Origin::Accepted { .. } => Phase::Done,
        }
    }

    fn fail(&mut self, err: TunnelError) {
        let conn = self.ctx.as_ref().map(|c| c.id());
        match &err {
            TunnelError::Timeout(_) => {
                info!(conn, service = %self.service.name(), error = %err, "Connection timed out")
            }
            _ => warn!(conn, service = %self.service.name(), error = %err, "Connection failed"),
        }
        if let Some(mut ctx) = self.ctx.take() {
            ctx.mark_aborted();
        }
        self.phase = self.after_close();
    }
}

impl Task for ConnectionTask {
    fn step(&mut self, handles: &mut HandleSet, wake: Wake) -> Step {
        match self.advance(handles, wake) {
            Ok(step) => step,
            Err(err) => {
                self.fail(err);
                self.advance(handles, Wake::Start).unwrap_or(Step::Done)
            }
        }
    }

    fn detach(&mut self) {
        self.slot.forget();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceConfig, TlsSettings};
    use std::net::TcpListener;

    fn initiator(connect: &str) -> Arc<Service> {
        let settings = ServiceConfig {
            name: "conn-test".into(),
            accept: Some("127.0.0.1:0".into()),
            connect: vec![connect.into()],
            connect_timeout: Duration::from_millis(500),
            tls: TlsSettings {
                pinned_sha256: Some("22".repeat(32)),
                ..TlsSettings::default()
            },
            ..ServiceConfig::default()
        };
        Arc::new(Service::from_config(&settings).expect("service"))
    }

    fn accepted_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (server, peer) = listener.accept().expect("accept");
        (client, server, peer)
    }

    #[test]
    fn test_refused_remote_finishes_and_releases_slot() {
        let dead = TcpListener::bind("127.0.0.1:0").expect("bind");
        let target = dead.local_addr().expect("addr").to_string();
        drop(dead);

        let shared = SharedState::new(4);
        let (_client, server, peer) = accepted_pair();
        let slot = shared.try_admit().expect("slot");
        let task = ConnectionTask::accepted(initiator(&target), shared.clone(), server, peer, slot);
        crate::poll::drive(Box::new(task));

        assert_eq!(shared.clients(), 0);
        assert_eq!(shared.metrics.snapshot().connections_total, 0);
    }

    #[test]
    fn test_detached_task_keeps_slot_counted() {
        let shared = SharedState::new(4);
        let (_client, server, peer) = accepted_pair();
        let slot = shared.try_admit().expect("slot");
        let mut task =
            ConnectionTask::accepted(initiator("127.0.0.1:1"), shared.clone(), server, peer, slot);
        task.detach();
        drop(task);
        assert_eq!(shared.clients(), 1);
    }
}
