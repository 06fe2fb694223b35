//! # Session Binding
//!
//! The USC session a tunnel is bound to, plus the receive-side [`Deframer`]
//! that strips envelopes off the decrypted byte stream.

use std::fmt;

use crate::core::buffer::IoBuffer;
use crate::core::envelope::{
    self, Envelope, Operation, RawHeader, SecurityTransport, DEFAULT_APP_ID,
    DEFAULT_APP_SESSION, ENVELOPE_LEN, USC_VERSION,
};
use crate::error::Result;

/// Session fields every envelope on a bound tunnel must agree with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBinding {
    pub version: u8,
    pub app_id: u16,
    pub app_session: u16,
    pub security: SecurityTransport,
}

/// Field that disagreed with the bound session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMismatch {
    Version { bound: u8, received: u8 },
    AppId { bound: u16, received: u16 },
    AppSession { bound: u16, received: u16 },
    Security { bound: SecurityTransport, received: SecurityTransport },
}

impl fmt::Display for BindingMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingMismatch::Version { bound, received } => {
                write!(f, "version {received} does not match bound {bound}")
            }
            BindingMismatch::AppId { bound, received } => {
                write!(f, "app id {received} does not match bound {bound}")
            }
            BindingMismatch::AppSession { bound, received } => {
                write!(f, "app session {received} does not match bound {bound}")
            }
            BindingMismatch::Security { bound, received } => {
                write!(f, "security {received:?} does not match bound {bound:?}")
            }
        }
    }
}

impl SessionBinding {
    /// Binding an initiator sends with and expects back
    pub fn defaults() -> Self {
        Self {
            version: USC_VERSION,
            app_id: DEFAULT_APP_ID,
            app_session: DEFAULT_APP_SESSION,
            security: SecurityTransport::Tls,
        }
    }

    /// Record the session carried by the first envelope of a tunnel
    pub fn from_envelope(env: &Envelope) -> Self {
        Self {
            version: env.version,
            app_id: env.app_id,
            app_session: env.app_session,
            security: env.security,
        }
    }

    /// Validate an incoming envelope; the binding itself is never modified
    pub fn check(&self, env: &Envelope) -> std::result::Result<(), BindingMismatch> {
        if env.version != self.version {
            return Err(BindingMismatch::Version {
                bound: self.version,
                received: env.version,
            });
        }
        if env.app_id != self.app_id {
            return Err(BindingMismatch::AppId {
                bound: self.app_id,
                received: env.app_id,
            });
        }
        if env.app_session != self.app_session {
            return Err(BindingMismatch::AppSession {
                bound: self.app_session,
                received: env.app_session,
            });
        }
        if env.security != self.security {
            return Err(BindingMismatch::Security {
                bound: self.security,
                received: env.security,
            });
        }
        Ok(())
    }

    /// Envelope for `op` carrying this session
    pub fn envelope(&self, op: Operation, payload_len: usize) -> Envelope {
        envelope::encode(Some(self), payload_len, op, self.security)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeframeState {
    /// Waiting for the next 8-byte header
    Header,
    /// Header surfaced; the engine has not yet said whether to forward its payload
    Verdict(usize),
    /// Streaming payload bytes through (deliver) or dropping them
    Payload { remaining: usize, deliver: bool },
}

/// One header taken off the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Envelope(Envelope),
    /// Unknown operation or security tag; the header and its payload are dropped
    Skipped(RawHeader),
}

/// Incremental envelope stripper over the remote-to-local buffer.
///
/// The buffer holds a deliverable prefix of `ready()` bytes followed by
/// undecoded wire bytes. Each call to [`next`](Deframer::next) strips headers
/// in place, extends the deliverable prefix with accepted payload and drops
/// rejected payload, until it either surfaces an envelope or runs out of
/// complete input. Envelopes split across reads are handled naturally: an
/// incomplete header simply stays in the buffer until more bytes arrive.
#[derive(Debug)]
pub struct Deframer {
    state: DeframeState,
    ready: usize,
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deframer {
    pub fn new() -> Self {
        Self {
            state: DeframeState::Header,
            ready: 0,
        }
    }

    /// Bytes at the head of the buffer that are plaintext ready for the local side
    pub fn ready(&self) -> usize {
        self.ready
    }

    /// An envelope was surfaced and still needs [`accept`](Self::accept) or [`reject`](Self::reject)
    pub fn awaiting_verdict(&self) -> bool {
        matches!(self.state, DeframeState::Verdict(_))
    }

    /// Mid-way through a payload or a header verdict
    pub fn in_message(&self) -> bool {
        !matches!(self.state, DeframeState::Header)
    }

    /// Process buffered wire bytes and return the next envelope, if complete.
    ///
    /// Envelopes whose operation carries a payload leave the deframer waiting
    /// for a verdict; until one is given this returns `Ok(None)`. Headers
    /// that do not decode are dropped along with their payload.
    pub fn next(&mut self, buf: &mut IoBuffer) -> Result<Option<Envelope>> {
        loop {
            match self.next_frame(buf)? {
                Some(Frame::Envelope(env)) => return Ok(Some(env)),
                Some(Frame::Skipped(_)) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Like [`next`](Self::next), but also reports each undecodable header
    pub fn next_frame(&mut self, buf: &mut IoBuffer) -> Result<Option<Frame>> {
        loop {
            match self.state {
                DeframeState::Verdict(_) => return Ok(None),
                DeframeState::Payload { remaining, deliver } => {
                    let available = buf.len() - self.ready;
                    let take = remaining.min(available);
                    if deliver {
                        self.ready += take;
                    } else {
                        buf.shift_left_at(self.ready, take)?;
                    }
                    let remaining = remaining - take;
                    if remaining > 0 {
                        self.state = DeframeState::Payload { remaining, deliver };
                        return Ok(None);
                    }
                    self.state = DeframeState::Header;
                }
                DeframeState::Header => {
                    if buf.len() - self.ready < ENVELOPE_LEN {
                        return Ok(None);
                    }
                    let raw = RawHeader::parse(&buf.as_slice()[self.ready..])?;
                    let Ok(env) = raw.decode() else {
                        buf.shift_left_at(self.ready, ENVELOPE_LEN)?;
                        let remaining = raw.payload_on_wire();
                        if remaining > 0 {
                            self.state = DeframeState::Payload {
                                remaining,
                                deliver: false,
                            };
                        }
                        return Ok(Some(Frame::Skipped(raw)));
                    };
                    envelope::strip_at(buf, self.ready)?;
                    if env.op.carries_payload() {
                        self.state = DeframeState::Verdict(usize::from(env.payload_len));
                    }
                    return Ok(Some(Frame::Envelope(env)));
                }
            }
        }
    }

    /// Forward the payload of the surfaced envelope
    pub fn accept(&mut self) {
        if let DeframeState::Verdict(len) = self.state {
            self.state = DeframeState::Payload {
                remaining: len,
                deliver: true,
            };
        }
    }

    /// Drop the payload of the surfaced envelope
    pub fn reject(&mut self) {
        if let DeframeState::Verdict(len) = self.state {
            self.state = DeframeState::Payload {
                remaining: len,
                deliver: false,
            };
        }
    }

    /// Remove `n` delivered bytes from the head of the buffer after a local write
    pub fn consume(&mut self, buf: &mut IoBuffer, n: usize) -> Result<()> {
        let n = n.min(self.ready);
        buf.shift_left(n)?;
        self.ready -= n;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(binding: &SessionBinding, payload: &[u8]) -> Vec<u8> {
        let mut out = binding.envelope(Operation::Data, payload.len()).to_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_binding_mismatch_leaves_binding() {
        let binding = SessionBinding::defaults();
        let before = binding;
        let mut env = binding.envelope(Operation::Data, 4);
        env.app_session = 1001;
        assert_eq!(
            binding.check(&env),
            Err(BindingMismatch::AppSession {
                bound: 1000,
                received: 1001
            })
        );
        env.app_session = 1000;
        env.version = 2;
        assert!(matches!(
            binding.check(&env),
            Err(BindingMismatch::Version { .. })
        ));
        env.version = 1;
        env.security = SecurityTransport::Dtls;
        assert!(binding.check(&env).is_err());
        assert_eq!(binding, before);
    }

    #[test]
    fn test_deframe_two_messages_in_one_read() {
        let binding = SessionBinding::defaults();
        let first = vec![b'a'; 200];
        let second = vec![b'b'; 200];
        let mut wire = data(&binding, &first);
        wire.extend(data(&binding, &second));
        assert_eq!(wire.len(), 416);

        let mut buf = IoBuffer::with_capacity(1024);
        buf.extend_from_slice(&wire).expect("fill");
        let mut deframer = Deframer::new();

        let env = deframer.next(&mut buf).expect("next").expect("first");
        assert_eq!(env.payload_len, 200);
        assert!(binding.check(&env).is_ok());
        assert!(deframer.next(&mut buf).expect("next").is_none());
        deframer.accept();

        let env = deframer.next(&mut buf).expect("next").expect("second");
        assert_eq!(env.payload_len, 200);
        deframer.accept();
        assert!(deframer.next(&mut buf).expect("next").is_none());

        assert_eq!(deframer.ready(), 400);
        assert_eq!(&buf.as_slice()[..200], &first[..]);
        assert_eq!(&buf.as_slice()[200..400], &second[..]);
    }

    #[test]
    fn test_deframe_split_header_and_payload() {
        let binding = SessionBinding::defaults();
        let wire = data(&binding, b"<rpc/>]]>]]>");
        let mut buf = IoBuffer::with_capacity(64);
        let mut deframer = Deframer::new();

        buf.extend_from_slice(&wire[..5]).expect("fill");
        assert!(deframer.next(&mut buf).expect("next").is_none());

        buf.extend_from_slice(&wire[5..12]).expect("fill");
        let env = deframer.next(&mut buf).expect("next").expect("header");
        deframer.accept();
        assert!(deframer.next(&mut buf).expect("next").is_none());
        assert_eq!(deframer.ready(), 4);
        assert!(deframer.in_message());

        buf.extend_from_slice(&wire[12..]).expect("fill");
        assert!(deframer.next(&mut buf).expect("next").is_none());
        assert_eq!(deframer.ready(), usize::from(env.payload_len));
        assert_eq!(buf.as_slice(), b"<rpc/>]]>]]>");
        assert!(!deframer.in_message());
    }

    #[test]
    fn test_rejected_payload_is_dropped() {
        let binding = SessionBinding::defaults();
        let mut wire = data(&binding, b"drop me");
        wire.extend(data(&binding, b"keep"));
        let mut buf = IoBuffer::with_capacity(64);
        buf.extend_from_slice(&wire).expect("fill");
        let mut deframer = Deframer::new();

        deframer.next(&mut buf).expect("next").expect("first");
        deframer.reject();
        deframer.next(&mut buf).expect("next").expect("second");
        deframer.accept();
        deframer.next(&mut buf).expect("next");
        assert_eq!(buf.as_slice(), b"keep");
        assert_eq!(deframer.ready(), 4);

        deframer.consume(&mut buf, 4).expect("consume");
        assert!(buf.is_empty());
        assert_eq!(deframer.ready(), 0);
    }

    #[test]
    fn test_unknown_tags_drop_only_their_message() {
        let binding = SessionBinding::defaults();
        // DATA under security tag 5, then op 14, then a good message
        let mut wire = vec![0x14, 0x05, 0x19, 0x71, 0x03, 0xe8, 0x00, 0x06];
        wire.extend_from_slice(b"secret");
        wire.extend_from_slice(&[0x1e, 0x01, 0x19, 0x71, 0x03, 0xe8, 0x00, 0x03]);
        wire.extend_from_slice(b"???");
        wire.extend(data(&binding, b"<ok/>"));

        let mut buf = IoBuffer::with_capacity(64);
        let mut deframer = Deframer::new();
        // split inside the first skipped payload
        buf.extend_from_slice(&wire[..11]).expect("fill");
        match deframer.next_frame(&mut buf).expect("next") {
            Some(Frame::Skipped(raw)) => assert_eq!(raw.security, 5),
            other => panic!("expected a skipped header, got {other:?}"),
        }
        assert!(deframer.next_frame(&mut buf).expect("next").is_none());
        assert!(buf.is_empty());

        buf.extend_from_slice(&wire[11..]).expect("fill");
        match deframer.next_frame(&mut buf).expect("next") {
            Some(Frame::Skipped(raw)) => assert_eq!(raw.op, 14),
            other => panic!("expected a skipped header, got {other:?}"),
        }
        let env = deframer.next(&mut buf).expect("next").expect("good envelope");
        assert!(binding.check(&env).is_ok());
        deframer.accept();
        assert!(deframer.next(&mut buf).expect("next").is_none());
        assert_eq!(buf.as_slice(), b"<ok/>");
        assert_eq!(deframer.ready(), 5);
    }

    #[test]
    fn test_control_envelopes_need_no_verdict() {
        let binding = SessionBinding::defaults();
        let alert = envelope::make_error(binding.app_id, binding.app_session, libc::ECONNREFUSED);
        let mut wire = alert.to_bytes().to_vec();
        wire.extend(data(&binding, b"x"));
        let mut buf = IoBuffer::with_capacity(64);
        buf.extend_from_slice(&wire).expect("fill");
        let mut deframer = Deframer::new();

        let env = deframer.next(&mut buf).expect("next").expect("alert");
        assert_eq!(env.op, Operation::Alerts);
        assert!(!deframer.awaiting_verdict());
        let env = deframer.next(&mut buf).expect("next").expect("data");
        assert_eq!(env.op, Operation::Data);
        assert!(deframer.awaiting_verdict());
    }
}
