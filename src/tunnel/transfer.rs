//! # Duplex Transfer Engine
//!
//! Moves bytes between the plain socket and the TLS session of one
//! connection. Every [`Transfer::step`] is one loop iteration: it services the
//! readiness reported by the previous wait in a fixed order, applies the
//! closing rules, registers interest for the next wait and picks its timeout.
//!
//! Service order within an iteration:
//!
//! 1. pending close-notify or queued TLS records
//! 2. plain socket write (`to_plain` delivered prefix)
//! 3. plain socket read, framed as one DATA envelope per chunk
//! 4. queued control envelopes (alerts, heartbeats)
//! 5. TLS write (`to_tls`)
//! 6. TLS read and envelope stripping
//! 7. hang-up conditions
//! 8. plain write shutdown, close-notify, responder target release
//!
//! A responder has no local socket until the first DATA envelope arrives.
//! That envelope's application id selects the target; while the connect is
//! in progress TLS reading pauses, so later envelopes wait in the socket.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::config::ServiceRole;
use crate::core::buffer::IoBuffer;
use crate::core::envelope::{
    self, make_error, message_end, message_start, Envelope, Operation, SecurityTransport,
    ENVELOPE_LEN, MAX_PAYLOAD,
};
use crate::core::session::{Deframer, Frame, SessionBinding};
use crate::error::{classify_socket_error, constants, Result, SocketErrorClass, TunnelError};
use crate::poll::{HandleSet, Wake};
use crate::transport::socket::{bytes_readable, prepare_stream, ConnectPoll, Connector};
use crate::transport::{TlsIo, TlsSession};
use crate::utils::logging::hex_dump;
use crate::utils::metrics::Metrics;

use super::context::{ConnState, ConnectionContext};

/// What the connection task does after a transfer step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    /// Wait on the registered handles
    Wait(Option<Duration>),
    /// Both directions are closed
    Finished,
}

/// Outcome of one plain-side read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlainRead {
    /// A chunk of `len` bytes was framed; its envelope starts at `offset`
    Data { offset: usize, len: usize },
    /// The peer closed its write side
    Eof,
    /// `to_tls` cannot take an envelope plus one byte
    NoRoom,
}

/// Read one chunk from `src` into `to_tls` and prefix it with a DATA envelope.
///
/// At most `MAX_PAYLOAD` bytes are read so the length fits the header, and
/// room for the 8-byte header is kept free.
pub fn read_plain<R: Read>(
    src: &mut R,
    to_tls: &mut IoBuffer,
    binding: Option<&SessionBinding>,
) -> Result<PlainRead> {
    let room = to_tls.remaining();
    if room <= ENVELOPE_LEN {
        return Ok(PlainRead::NoRoom);
    }
    let offset = to_tls.len();
    let max = (room - ENVELOPE_LEN).min(MAX_PAYLOAD);
    let n = loop {
        match src.read(&mut to_tls.spare_mut()[..max]) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TunnelError::socket("readsocket", e)),
        }
    };
    if n == 0 {
        return Ok(PlainRead::Eof);
    }
    to_tls.commit(n)?;
    let header = envelope::encode(binding, n, Operation::Data, SecurityTransport::Tls);
    envelope::insert_at(to_tls, offset, &header)?;
    Ok(PlainRead::Data { offset, len: n })
}

/// Write the delivered prefix of `to_plain` to `dst`; returns the bytes written
pub fn write_plain<W: Write>(
    dst: &mut W,
    to_plain: &mut IoBuffer,
    deframer: &mut Deframer,
) -> Result<usize> {
    let ready = deframer.ready();
    if ready == 0 {
        return Ok(0);
    }
    let n = loop {
        match dst.write(&to_plain.as_slice()[..ready]) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TunnelError::socket("writesocket", e)),
        }
    };
    deframer.consume(to_plain, n)?;
    Ok(n)
}

/// Non-fatal socket errors become their class; everything else propagates
fn soft_error(err: TunnelError) -> Result<SocketErrorClass> {
    let class = match &err {
        TunnelError::Socket { source, .. } => classify_socket_error(source),
        _ => SocketErrorClass::Fatal,
    };
    match class {
        SocketErrorClass::Fatal => Err(err),
        other => Ok(other),
    }
}

fn session(ctx: &mut ConnectionContext) -> Result<&mut TlsSession> {
    ctx.tls
        .as_mut()
        .ok_or_else(|| TunnelError::Aborted("no TLS session".into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitKind {
    Idle,
    Close,
    Immediate,
    Heartbeat,
    Connect,
}

struct PendingTarget {
    connector: Connector,
    envelope: Envelope,
    wait: Option<(RawFd, Duration)>,
}

/// Counts consecutive wake-ups that moved nothing
#[derive(Debug, Default)]
struct StallWatchdog {
    stalls: u64,
}

impl StallWatchdog {
    /// Record one iteration; aborts once more than `limit` in a row were idle
    fn observe(
        &mut self,
        advanced: bool,
        counts_as_stall: bool,
        limit: u64,
        metrics: &Metrics,
        conn: u64,
    ) -> Result<()> {
        if advanced {
            self.stalls = 0;
            return Ok(());
        }
        if !counts_as_stall {
            return Ok(());
        }
        self.stalls += 1;
        if limit > 0 && self.stalls > limit {
            metrics.stall();
            error!(conn, iterations = self.stalls, "Transfer loop made no progress");
            return Err(TunnelError::Aborted(constants::ERR_STALLED.into()));
        }
        Ok(())
    }
}

/// Transfer loop state of one connection
pub struct Transfer {
    deframer: Deframer,
    control: VecDeque<Envelope>,
    sock_open_rd: bool,
    sock_open_wr: bool,
    read_wants_read: bool,
    read_wants_write: bool,
    write_wants_read: bool,
    write_wants_write: bool,
    shutdown_wants_read: bool,
    shutdown_wants_write: bool,
    target: Option<PendingTarget>,
    in_message: bool,
    wait_kind: WaitKind,
    last_activity: Instant,
    last_heartbeat: Instant,
    watchdog: StallWatchdog,
    progress: bool,
    moved: bool,
}

impl Transfer {
    pub fn new(ctx: &ConnectionContext) -> Self {
        let attached = ctx.plain.is_some();
        let now = Instant::now();
        Self {
            deframer: Deframer::new(),
            control: VecDeque::new(),
            sock_open_rd: attached,
            sock_open_wr: attached,
            read_wants_read: false,
            read_wants_write: false,
            write_wants_read: false,
            write_wants_write: false,
            shutdown_wants_read: false,
            shutdown_wants_write: false,
            target: None,
            in_message: false,
            wait_kind: WaitKind::Idle,
            last_activity: now,
            last_heartbeat: now,
            watchdog: StallWatchdog::default(),
            progress: false,
            moved: false,
        }
    }

    /// One iteration of the loop
    pub fn step(
        &mut self,
        ctx: &mut ConnectionContext,
        handles: &mut HandleSet,
        wake: Wake,
    ) -> Result<TransferStep> {
        let counts_as_stall = match wake {
            Wake::Failed(e) => return Err(TunnelError::socket("poll", e)),
            Wake::Start => {
                handles.init();
                false
            }
            Wake::Ready(_) => true,
            Wake::TimedOut => match self.wait_kind {
                WaitKind::Idle => {
                    info!(conn = ctx.id(), "Idle timeout exceeded: sending reset");
                    return Err(TunnelError::Timeout("idle transfer"));
                }
                WaitKind::Close => {
                    info!(conn = ctx.id(), "Close timeout exceeded: closing");
                    return Ok(TransferStep::Finished);
                }
                WaitKind::Heartbeat => {
                    self.queue_heartbeat(ctx);
                    false
                }
                WaitKind::Immediate => true,
                WaitKind::Connect => false,
            },
        };

        self.progress = false;
        self.moved = false;
        self.service(ctx, handles)?;

        if self.moved {
            self.last_activity = Instant::now();
        }
        self.watchdog.observe(
            self.progress || self.moved,
            counts_as_stall,
            ctx.service.settings().max_stall_iterations,
            &ctx.shared.metrics,
            ctx.id(),
        )?;

        if self.finished(ctx)? {
            return Ok(TransferStep::Finished);
        }
        Ok(TransferStep::Wait(self.register(ctx, handles)?))
    }

    fn service(&mut self, ctx: &mut ConnectionContext, handles: &HandleSet) -> Result<()> {
        let tls_fd = session(ctx)?.as_raw_fd();
        let plain_fd = ctx.plain.as_ref().map(|s| s.as_raw_fd());
        let sock_can_rd = plain_fd.is_some_and(|fd| handles.can_read(fd));
        let sock_can_wr = plain_fd.is_some_and(|fd| handles.can_write(fd));
        let ssl_can_rd = handles.can_read(tls_fd);
        let ssl_can_wr = handles.can_write(tls_fd);

        if self.target.is_some() {
            self.pump(ctx, handles)?;
        }

        // close-notify or records left over from an earlier call
        if self.shutdown_wants_read || self.shutdown_wants_write {
            self.send_close_notify(ctx)?;
        } else if ssl_can_wr && session(ctx)?.wants_flush() {
            if let Err(e) = session(ctx)?.flush() {
                if soft_error(e)? == SocketErrorClass::Closed {
                    self.tls_write_closed(ctx, "flush")?;
                }
            }
        }

        if self.sock_open_wr && sock_can_wr {
            self.write_to_plain(ctx)?;
        }

        if self.sock_open_rd && sock_can_rd {
            self.read_from_plain(ctx)?;
        }

        self.flush_control(ctx)?;
        self.update_wants(ctx)?;

        if (self.write_wants_read && ssl_can_rd) || (self.write_wants_write && ssl_can_wr) {
            self.write_to_tls(ctx)?;
        }

        let buffered = session(ctx)?.has_buffered_input();
        if self.target.is_none()
            && ((self.read_wants_read && (ssl_can_rd || buffered))
                || (self.read_wants_write && ssl_can_wr))
        {
            self.read_from_tls(ctx)?;
            self.pump(ctx, handles)?;
            self.flush_control(ctx)?;
        }

        self.check_hang_ups(ctx, handles, plain_fd, tls_fd)?;
        self.check_shutdowns(ctx)
    }

    fn update_wants(&mut self, ctx: &mut ConnectionContext) -> Result<()> {
        let state = session(ctx)?.shutdown_state();
        self.read_wants_read = !state.received
            && ctx.to_plain.remaining() > 0
            && self.target.is_none()
            && !self.read_wants_write;
        self.write_wants_write =
            !state.sent && !ctx.to_tls.is_empty() && !self.write_wants_read;
        Ok(())
    }

    fn write_to_plain(&mut self, ctx: &mut ConnectionContext) -> Result<()> {
        let Some(stream) = ctx.plain.as_mut() else {
            return Ok(());
        };
        match write_plain(stream, &mut ctx.to_plain, &mut self.deframer) {
            Ok(0) => Ok(()),
            Ok(n) => {
                trace!(conn = ctx.id(), bytes = n, "Wrote to plain socket");
                ctx.counters.plain_out += n as u64;
                self.moved = true;
                Ok(())
            }
            Err(e) => match soft_error(e)? {
                SocketErrorClass::Retry => Ok(()),
                _ => {
                    let unsent = self.deframer.ready();
                    error!(conn = ctx.id(), unsent, "Write socket closed with unsent bytes");
                    Err(TunnelError::Aborted(format!(
                        "{} ({unsent} bytes)",
                        constants::ERR_UNSENT_BYTES
                    )))
                }
            },
        }
    }

    fn read_from_plain(&mut self, ctx: &mut ConnectionContext) -> Result<()> {
        let Some(stream) = ctx.plain.as_mut() else {
            return Ok(());
        };
        match read_plain(stream, &mut ctx.to_tls, ctx.binding.as_ref()) {
            Ok(PlainRead::Data { offset, len }) => {
                ctx.counters.plain_in += len as u64;
                ctx.shared.metrics.envelope_sent();
                let start = offset + ENVELOPE_LEN;
                let chunk = &ctx.to_tls.as_slice()[start..start + len];
                if let Some(framing) = message_start(chunk) {
                    ctx.shared.metrics.message();
                    debug!(conn = ctx.id(), ?framing, "NETCONF message start");
                    self.in_message = true;
                }
                if message_end(chunk) {
                    self.in_message = false;
                }
                trace!(
                    conn = ctx.id(),
                    bytes = len,
                    "Read from plain socket\n{}",
                    hex_dump(&ctx.to_tls.as_slice()[offset..], 64)
                );
                self.moved = true;
                Ok(())
            }
            Ok(PlainRead::Eof) => {
                info!(conn = ctx.id(), "Read socket closed (readsocket)");
                self.plain_read_closed(ctx);
                Ok(())
            }
            Ok(PlainRead::NoRoom) => Ok(()),
            Err(e) => match soft_error(e)? {
                SocketErrorClass::Retry => Ok(()),
                _ => {
                    info!(conn = ctx.id(), "Plain socket closed (readsocket error)");
                    self.sock_open_rd = false;
                    self.sock_open_wr = false;
                    self.progress = true;
                    Ok(())
                }
            },
        }
    }

    fn plain_read_closed(&mut self, ctx: &ConnectionContext) {
        if self.in_message {
            warn!(conn = ctx.id(), "Plain socket closed inside a NETCONF message");
        }
        self.sock_open_rd = false;
        self.progress = true;
    }

    fn flush_control(&mut self, ctx: &mut ConnectionContext) -> Result<()> {
        if session(ctx)?.shutdown_state().sent {
            self.control.clear();
            return Ok(());
        }
        while let Some(env) = self.control.front().copied() {
            if ctx.to_tls.remaining() < ENVELOPE_LEN {
                break;
            }
            ctx.to_tls.extend_from_slice(&env.to_bytes())?;
            self.control.pop_front();
            ctx.shared.metrics.envelope_sent();
            if env.op == Operation::Alerts {
                ctx.shared.metrics.alert_sent();
            }
            trace!(conn = ctx.id(), op = ?env.op, "Queued control envelope");
            self.progress = true;
        }
        Ok(())
    }

    fn write_to_tls(&mut self, ctx: &mut ConnectionContext) -> Result<()> {
        self.write_wants_read = false;
        self.write_wants_write = false;
        let Some(tls) = ctx.tls.as_mut() else {
            return Ok(());
        };
        let result = tls.write(ctx.to_tls.as_slice());
        match result {
            Ok(TlsIo::Done(n)) => {
                if n > 0 {
                    ctx.to_tls.shift_left(n)?;
                    ctx.counters.tls_out += n as u64;
                    self.moved = true;
                    trace!(conn = ctx.id(), bytes = n, "Wrote to TLS");
                } else {
                    debug!(conn = ctx.id(), "TLS write returned 0");
                }
            }
            Ok(TlsIo::WantWrite) => {
                debug!(conn = ctx.id(), "TLS write wants write: retrying");
                self.write_wants_write = true;
            }
            Ok(TlsIo::WantRead) => {
                debug!(conn = ctx.id(), "TLS write wants read: retrying");
                self.write_wants_read = true;
            }
            Ok(TlsIo::ZeroReturn) | Ok(TlsIo::Eof) => {
                self.tls_write_closed(ctx, "SSL_write")?;
            }
            Err(e) => {
                if soft_error(e)? == SocketErrorClass::Closed {
                    self.tls_write_closed(ctx, "SSL_write")?;
                }
            }
        }
        Ok(())
    }

    /// TLS socket gone on the write path
    fn tls_write_closed(&mut self, ctx: &mut ConnectionContext, call: &'static str) -> Result<()> {
        let unsent = ctx.to_tls.len();
        if unsent > 0 {
            error!(conn = ctx.id(), call, unsent, "TLS socket closed with unsent bytes");
            return Err(TunnelError::Aborted(format!(
                "{} ({unsent} bytes, {call})",
                constants::ERR_UNSENT_BYTES
            )));
        }
        info!(conn = ctx.id(), call, "TLS socket closed");
        session(ctx)?.mark_shutdown();
        self.progress = true;
        Ok(())
    }

    fn read_from_tls(&mut self, ctx: &mut ConnectionContext) -> Result<()> {
        self.read_wants_read = false;
        self.read_wants_write = false;
        let Some(tls) = ctx.tls.as_mut() else {
            return Ok(());
        };
        let result = tls.read(ctx.to_plain.spare_mut());
        match result {
            Ok(TlsIo::Done(n)) => {
                ctx.to_plain.commit(n)?;
                ctx.counters.tls_in += n as u64;
                self.moved = true;
                trace!(conn = ctx.id(), bytes = n, "Read from TLS");
            }
            Ok(TlsIo::WantRead) => self.read_wants_read = true,
            Ok(TlsIo::WantWrite) => {
                debug!(conn = ctx.id(), "TLS read wants write: retrying");
                self.read_wants_write = true;
            }
            Ok(TlsIo::ZeroReturn) => {
                info!(conn = ctx.id(), "TLS closed (close_notify received)");
                self.progress = true;
            }
            Ok(TlsIo::Eof) => {
                let unsent = ctx.to_tls.len();
                if unsent > 0 {
                    error!(conn = ctx.id(), unsent, "TLS socket closed (SSL_read) with unsent bytes");
                    return Err(TunnelError::Aborted(format!(
                        "{} ({unsent} bytes, SSL_read)",
                        constants::ERR_UNSENT_BYTES
                    )));
                }
                info!(conn = ctx.id(), "TLS socket closed without close_notify");
                session(ctx)?.mark_shutdown();
                self.progress = true;
            }
            Err(e) => {
                if soft_error(e)? == SocketErrorClass::Closed {
                    session(ctx)?.mark_shutdown();
                    self.progress = true;
                }
            }
        }
        Ok(())
    }

    /// Strip envelopes and resolve target connects until input runs out
    fn pump(&mut self, ctx: &mut ConnectionContext, handles: &HandleSet) -> Result<()> {
        loop {
            self.deframe(ctx)?;
            if self.target.is_none() || !self.poll_target(ctx, handles)? {
                return Ok(());
            }
        }
    }

    fn deframe(&mut self, ctx: &mut ConnectionContext) -> Result<()> {
        while self.target.is_none() {
            let env = match self.deframer.next_frame(&mut ctx.to_plain)? {
                Some(Frame::Envelope(env)) => env,
                Some(Frame::Skipped(raw)) => {
                    ctx.shared.metrics.envelope_received();
                    ctx.shared.metrics.envelope_rejected();
                    warn!(
                        conn = ctx.id(),
                        op = raw.op,
                        security = raw.security,
                        app_id = raw.app_id,
                        len = raw.payload_len,
                        "Undecodable USC envelope: message dropped"
                    );
                    self.progress = true;
                    continue;
                }
                None => break,
            };
            ctx.shared.metrics.envelope_received();
            trace!(conn = ctx.id(), "USC envelope\n{}", hex_dump(&env.to_bytes(), ENVELOPE_LEN));
            self.progress = true;

            match env.op {
                Operation::Alerts => {
                    ctx.shared.metrics.alert_received();
                    let code = env.alert_code().unwrap_or_default();
                    warn!(
                        conn = ctx.id(),
                        app_id = env.app_id,
                        app_session = env.app_session,
                        code,
                        reason = %io::Error::from_raw_os_error(code),
                        "Peer reported an alert"
                    );
                }
                Operation::HeartBeatReq => {
                    ctx.shared.metrics.heartbeat();
                    debug!(conn = ctx.id(), "Heartbeat request");
                    self.control.push_back(Envelope::new(
                        Operation::HeartBeatResp,
                        env.security,
                        env.app_id,
                        env.app_session,
                        0,
                    ));
                }
                Operation::HeartBeatResp => {
                    ctx.shared.metrics.heartbeat();
                    debug!(conn = ctx.id(), "Heartbeat response");
                }
                Operation::Data => self.verdict(ctx, env),
                other => {
                    debug!(conn = ctx.id(), op = ?other, "Unsupported USC operation: payload dropped");
                    self.deframer.reject();
                    ctx.shared.metrics.envelope_rejected();
                }
            }
        }
        Ok(())
    }

    fn verdict(&mut self, ctx: &mut ConnectionContext, env: Envelope) {
        if let Some(binding) = ctx.binding.as_ref() {
            match binding.check(&env) {
                Ok(()) => self.deframer.accept(),
                Err(mismatch) => {
                    warn!(conn = ctx.id(), %mismatch, "USC session mismatch: message rejected");
                    self.deframer.reject();
                    ctx.shared.metrics.envelope_rejected();
                }
            }
            return;
        }

        let settings = ctx.service.settings();
        if env.app_id != settings.app_id {
            warn!(
                conn = ctx.id(),
                app_id = env.app_id,
                served = settings.app_id,
                "Unknown application id: sending alert"
            );
            self.control
                .push_back(make_error(env.app_id, env.app_session, libc::EPROTONOSUPPORT));
            self.deframer.reject();
            ctx.shared.metrics.envelope_rejected();
            return;
        }

        debug!(
            conn = ctx.id(),
            app_id = env.app_id,
            app_session = env.app_session,
            "Connecting target"
        );
        self.target = Some(PendingTarget {
            connector: Connector::new(&settings.connect, settings.connect_timeout),
            envelope: env,
            wait: None,
        });
    }

    /// Advance the target connect; true once it succeeded or failed
    fn poll_target(&mut self, ctx: &mut ConnectionContext, handles: &HandleSet) -> Result<bool> {
        let Some(pending) = self.target.as_mut() else {
            return Ok(false);
        };
        let env = pending.envelope;
        match pending.connector.poll(handles) {
            ConnectPoll::Pending(fd, timeout) => {
                pending.wait = Some((fd, timeout));
                Ok(false)
            }
            ConnectPoll::Connected(stream, addr) => {
                self.target = None;
                if let Err(e) = prepare_stream(&stream) {
                    warn!(conn = ctx.id(), error = %e, "Failed to set target socket options");
                }
                info!(
                    conn = ctx.id(),
                    target = %addr,
                    app_id = env.app_id,
                    app_session = env.app_session,
                    "Target connected: session bound"
                );
                ctx.plain = Some(stream);
                ctx.binding = Some(SessionBinding::from_envelope(&env));
                self.sock_open_rd = true;
                self.sock_open_wr = true;
                self.deframer.accept();
                self.progress = true;
                Ok(true)
            }
            ConnectPoll::Failed(e) => {
                self.target = None;
                let errno = e.raw_os_error().unwrap_or(libc::EIO);
                warn!(
                    conn = ctx.id(),
                    app_id = env.app_id,
                    error = %e,
                    "Target unreachable: sending alert"
                );
                self.control
                    .push_back(make_error(env.app_id, env.app_session, errno));
                self.deframer.reject();
                ctx.shared.metrics.envelope_rejected();
                self.progress = true;
                Ok(true)
            }
        }
    }

    fn check_hang_ups(
        &mut self,
        ctx: &mut ConnectionContext,
        handles: &HandleSet,
        plain_fd: Option<RawFd>,
        tls_fd: RawFd,
    ) -> Result<()> {
        if let Some(fd) = plain_fd.filter(|_| ctx.plain.is_some()) {
            if self.sock_open_rd && handles.read_hang_up(fd) && bytes_readable(fd) == 0 {
                info!(conn = ctx.id(), "Read socket closed (read hangup)");
                self.plain_read_closed(ctx);
            }
            if self.sock_open_wr && handles.hang_up(fd) {
                let unsent = self.deframer.ready();
                if unsent > 0 {
                    error!(conn = ctx.id(), unsent, "Write socket closed (write hangup) with unsent bytes");
                    return Err(TunnelError::Aborted(format!(
                        "{} ({unsent} bytes, write hangup)",
                        constants::ERR_UNSENT_BYTES
                    )));
                }
                info!(conn = ctx.id(), "Write socket closed (write hangup)");
                self.sock_open_wr = false;
                self.sock_open_rd = false;
                self.progress = true;
            }
        }

        let state = session(ctx)?.shutdown_state();
        if !state.sent && handles.hang_up(tls_fd) {
            let unsent = ctx.to_tls.len();
            if unsent > 0 {
                error!(conn = ctx.id(), unsent, "TLS socket closed (write hangup) with unsent bytes");
                return Err(TunnelError::Aborted(format!(
                    "{} ({unsent} bytes, write hangup)",
                    constants::ERR_UNSENT_BYTES
                )));
            }
            info!(conn = ctx.id(), "TLS socket closed (write hangup)");
            session(ctx)?.mark_sent();
            self.progress = true;
        }
        Ok(())
    }

    fn check_shutdowns(&mut self, ctx: &mut ConnectionContext) -> Result<()> {
        let state = session(ctx)?.shutdown_state();

        if state.received {
            ctx.advance(ConnState::ShuttingDown);
            if self.target.take().is_some() {
                debug!(conn = ctx.id(), "Peer closed during target connect");
                self.deframer.reject();
            }
        }

        if self.sock_open_wr && state.received && self.deframer.ready() == 0 {
            self.sock_open_wr = false;
            self.progress = true;
            if let Some(stream) = ctx.plain.as_ref() {
                match stream.shutdown(Shutdown::Write) {
                    Ok(()) => debug!(conn = ctx.id(), "Sent socket write shutdown"),
                    Err(e) => {
                        debug!(conn = ctx.id(), error = %e, "Failed to send socket write shutdown");
                        self.sock_open_rd = false;
                    }
                }
            }
        }

        let state = session(ctx)?.shutdown_state();
        let drained = ctx.to_tls.is_empty() && self.control.is_empty() && !self.write_wants_write;
        if !state.sent && drained {
            let close = match ctx.role() {
                ServiceRole::Initiator => !self.sock_open_rd,
                ServiceRole::Responder => {
                    state.received && (ctx.plain.is_none() || !self.sock_open_rd)
                }
            };
            if close {
                debug!(conn = ctx.id(), "Sending close_notify alert");
                self.shutdown_wants_write = true;
                self.send_close_notify(ctx)?;
                ctx.advance(ConnState::ShuttingDown);
            }
        }

        if ctx.role() == ServiceRole::Responder
            && ctx.plain.is_some()
            && !self.sock_open_rd
            && !state.received
            && ctx.to_tls.is_empty()
            && !self.deframer.in_message()
            && (self.deframer.ready() == 0 || !self.sock_open_wr)
        {
            let undelivered = self.deframer.ready();
            if undelivered > 0 {
                warn!(conn = ctx.id(), undelivered, "Dropping bytes for a closed target");
                self.deframer.consume(&mut ctx.to_plain, undelivered)?;
            }
            info!(conn = ctx.id(), "Target closed: session unbound");
            ctx.detach_plain();
            self.sock_open_wr = false;
            self.in_message = false;
            self.progress = true;
        }
        Ok(())
    }

    fn send_close_notify(&mut self, ctx: &mut ConnectionContext) -> Result<()> {
        let result = session(ctx)?.shutdown();
        match result {
            Ok(TlsIo::WantWrite) => {
                debug!(conn = ctx.id(), "TLS shutdown wants write: retrying");
                self.shutdown_wants_read = false;
                self.shutdown_wants_write = true;
            }
            Ok(TlsIo::WantRead) => {
                debug!(conn = ctx.id(), "TLS shutdown wants read: retrying");
                self.shutdown_wants_read = true;
                self.shutdown_wants_write = false;
            }
            Ok(_) => {
                info!(conn = ctx.id(), "TLS shutdown: close_notify sent");
                self.shutdown_wants_read = false;
                self.shutdown_wants_write = false;
                self.progress = true;
            }
            Err(e) => match soft_error(e)? {
                SocketErrorClass::Retry => {}
                _ => {
                    session(ctx)?.mark_shutdown();
                    self.shutdown_wants_read = false;
                    self.shutdown_wants_write = false;
                    self.progress = true;
                }
            },
        }
        Ok(())
    }

    fn queue_heartbeat(&mut self, ctx: &mut ConnectionContext) {
        let Some(binding) = ctx.binding.as_ref() else {
            return;
        };
        debug!(conn = ctx.id(), "Sending heartbeat request");
        self.control
            .push_back(binding.envelope(Operation::HeartBeatReq, 0));
        ctx.shared.metrics.heartbeat();
        self.last_heartbeat = Instant::now();
    }

    fn finished(&self, ctx: &mut ConnectionContext) -> Result<bool> {
        let state = session(ctx)?.shutdown_state();
        let plain_writable = ctx.plain.is_some() && self.sock_open_wr;
        Ok(!plain_writable
            && state.sent
            && !self.shutdown_wants_read
            && !self.shutdown_wants_write)
    }

    /// Register interest for the next wait and return its timeout
    fn register(
        &mut self,
        ctx: &mut ConnectionContext,
        handles: &mut HandleSet,
    ) -> Result<Option<Duration>> {
        self.update_wants(ctx)?;
        handles.init();

        if let Some((fd, _)) = self.target.as_ref().and_then(|t| t.wait) {
            handles.add(fd, false, true);
        }

        if let Some(stream) = ctx.plain.as_ref() {
            let fd = stream.as_raw_fd();
            if self.sock_open_rd {
                handles.add(fd, ctx.to_tls.remaining() > ENVELOPE_LEN, false);
            }
            if self.sock_open_wr {
                handles.add(fd, false, self.deframer.ready() > 0);
            }
        }

        let tls = session(ctx)?;
        let state = tls.shutdown_state();
        let flushing = tls.wants_flush();
        if !(state.sent && state.received) || flushing {
            handles.add(
                tls.as_raw_fd(),
                self.read_wants_read || self.write_wants_read || self.shutdown_wants_read,
                self.read_wants_write
                    || self.write_wants_write
                    || self.shutdown_wants_write
                    || flushing,
            );
        }
        let buffered = tls.has_buffered_input();

        let settings = ctx.service.settings();
        if let Some((_, timeout)) = self.target.as_ref().and_then(|t| t.wait) {
            self.wait_kind = WaitKind::Connect;
            return Ok(Some(timeout));
        }
        if buffered && self.read_wants_read {
            self.wait_kind = WaitKind::Immediate;
            return Ok(Some(Duration::ZERO));
        }

        let open = !state.received
            && match ctx.role() {
                ServiceRole::Initiator => self.sock_open_rd,
                ServiceRole::Responder => ctx.plain.is_none() || self.sock_open_rd,
            };
        if open || !ctx.to_plain.is_empty() || !ctx.to_tls.is_empty() {
            let idle = settings
                .idle_timeout
                .saturating_sub(self.last_activity.elapsed());
            let heartbeat = settings
                .heartbeat_interval
                .filter(|_| ctx.role() == ServiceRole::Initiator && !state.sent)
                .map(|interval| {
                    let since = self.last_activity.max(self.last_heartbeat);
                    interval.saturating_sub(since.elapsed())
                });
            match heartbeat {
                Some(due) if due < idle => {
                    self.wait_kind = WaitKind::Heartbeat;
                    Ok(Some(due))
                }
                _ => {
                    self.wait_kind = WaitKind::Idle;
                    Ok(Some(idle))
                }
            }
        } else {
            self.wait_kind = WaitKind::Close;
            Ok(Some(settings.close_timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::{DEFAULT_APP_ID, USC_VERSION};
    use std::io::Cursor;

    struct ShortWriter {
        accepted: Vec<u8>,
        limit: usize,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.limit);
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn netconf_message(len: usize) -> Vec<u8> {
        let mut msg = b"<?xml version=\"1.0\"?><rpc>".to_vec();
        msg.resize(len - 6, b'x');
        msg.extend_from_slice(b"]]>]]>");
        msg
    }

    #[test]
    fn test_plain_chunk_becomes_one_data_envelope() {
        let msg = netconf_message(200);
        let mut to_tls = IoBuffer::with_capacity(16 * 1024);
        let binding = SessionBinding::defaults();
        let outcome = read_plain(&mut Cursor::new(msg.clone()), &mut to_tls, Some(&binding))
            .expect("read");
        assert_eq!(outcome, PlainRead::Data { offset: 0, len: 200 });
        assert_eq!(to_tls.len(), 208);

        let bytes = to_tls.as_slice();
        assert_eq!(&bytes[6..8], &[0x00, 0xC8]);
        let env = Envelope::from_bytes(bytes).expect("decode");
        assert_eq!(env.version, USC_VERSION);
        assert_eq!(env.op, Operation::Data);
        assert_eq!(env.app_id, DEFAULT_APP_ID);
        assert_eq!(&bytes[8..], msg.as_slice());
    }

    #[test]
    fn test_second_chunk_framed_after_first() {
        let mut to_tls = IoBuffer::with_capacity(1024);
        read_plain(&mut Cursor::new(b"abc".to_vec()), &mut to_tls, None).expect("first");
        let outcome =
            read_plain(&mut Cursor::new(b"defg".to_vec()), &mut to_tls, None).expect("second");
        assert_eq!(outcome, PlainRead::Data { offset: 11, len: 4 });
        let second = Envelope::from_bytes(&to_tls.as_slice()[11..]).expect("decode");
        assert_eq!(second.payload_len, 4);
        assert_eq!(&to_tls.as_slice()[19..], b"defg");
    }

    #[test]
    fn test_read_reserves_header_room() {
        let mut to_tls = IoBuffer::with_capacity(20);
        let outcome = read_plain(&mut Cursor::new(vec![7u8; 64]), &mut to_tls, None).expect("read");
        assert_eq!(outcome, PlainRead::Data { offset: 0, len: 12 });
        assert!(to_tls.is_full());
        let outcome = read_plain(&mut Cursor::new(vec![7u8; 64]), &mut to_tls, None).expect("read");
        assert_eq!(outcome, PlainRead::NoRoom);
    }

    #[test]
    fn test_read_eof() {
        let mut to_tls = IoBuffer::with_capacity(64);
        let outcome = read_plain(&mut Cursor::new(Vec::new()), &mut to_tls, None).expect("read");
        assert_eq!(outcome, PlainRead::Eof);
        assert!(to_tls.is_empty());
    }

    #[test]
    fn test_partial_plain_write_keeps_tail() {
        let binding = SessionBinding::defaults();
        let payload: Vec<u8> = (0..208u16).map(|i| i as u8).collect();
        let mut to_plain = IoBuffer::with_capacity(1024);
        to_plain
            .extend_from_slice(&binding.envelope(Operation::Data, 208).to_bytes())
            .expect("header");
        to_plain.extend_from_slice(&payload).expect("payload");

        let mut deframer = Deframer::new();
        deframer.next(&mut to_plain).expect("next").expect("envelope");
        deframer.accept();
        assert!(deframer.next(&mut to_plain).expect("drain").is_none());
        assert_eq!(deframer.ready(), 208);

        let mut writer = ShortWriter {
            accepted: Vec::new(),
            limit: 50,
        };
        let n = write_plain(&mut writer, &mut to_plain, &mut deframer).expect("write");
        assert_eq!(n, 50);
        assert_eq!(deframer.ready(), 158);
        assert_eq!(to_plain.as_slice(), &payload[50..]);
        assert_eq!(writer.accepted, &payload[..50]);
    }

    #[test]
    fn test_nothing_written_before_delivery() {
        let mut to_plain = IoBuffer::with_capacity(64);
        to_plain.extend_from_slice(&[1, 2, 3]).expect("fill");
        let mut deframer = Deframer::new();
        let mut writer = ShortWriter {
            accepted: Vec::new(),
            limit: 64,
        };
        assert_eq!(write_plain(&mut writer, &mut to_plain, &mut deframer).expect("write"), 0);
        assert!(writer.accepted.is_empty());
    }

    #[test]
    fn test_watchdog_aborts_after_limit() {
        let metrics = Metrics::new();
        let mut watchdog = StallWatchdog::default();
        for _ in 0..3 {
            watchdog.observe(false, true, 3, &metrics, 1).expect("within limit");
        }
        // timer wake-ups are not stalls
        watchdog.observe(false, false, 3, &metrics, 1).expect("not counted");
        match watchdog.observe(false, true, 3, &metrics, 1) {
            Err(TunnelError::Aborted(reason)) => assert_eq!(reason, constants::ERR_STALLED),
            other => panic!("expected a stall abort, got {other:?}"),
        }
        assert_eq!(metrics.snapshot().stalls, 1);
    }

    #[test]
    fn test_watchdog_reset_by_movement() {
        let metrics = Metrics::new();
        let mut watchdog = StallWatchdog::default();
        for _ in 0..10 {
            watchdog.observe(false, true, 3, &metrics, 1).expect("idle");
            watchdog.observe(false, true, 3, &metrics, 1).expect("idle");
            watchdog.observe(true, true, 3, &metrics, 1).expect("bytes moved");
        }
        assert_eq!(watchdog.stalls, 0);

        // a zero limit disables the watchdog
        for _ in 0..5000 {
            watchdog.observe(false, true, 0, &metrics, 1).expect("disabled");
        }
        assert_eq!(metrics.snapshot().stalls, 0);
    }

    #[test]
    fn test_soft_error_classes() {
        let closed = TunnelError::socket("writesocket", io::Error::from_raw_os_error(libc::EPIPE));
        assert_eq!(soft_error(closed).expect("class"), SocketErrorClass::Closed);
        let retry = TunnelError::socket("readsocket", io::Error::from_raw_os_error(libc::EAGAIN));
        assert_eq!(soft_error(retry).expect("class"), SocketErrorClass::Retry);
        let reset = TunnelError::socket("readsocket", io::Error::from_raw_os_error(libc::ECONNRESET));
        assert!(soft_error(reset).is_err());
        assert!(soft_error(TunnelError::TlsError("bad record".into())).is_err());
    }
}
