//! # USC Envelope
//!
//! Wire codec for the 8-byte USC header that tags every chunk of NETCONF
//! plaintext crossing the tunnel.
//!
//! ## Wire Format
//! ```text
//! byte 0      : version (high nibble) | operation (low nibble)
//! byte 1      : security transport tag
//! bytes 2..4  : application id       (big endian)
//! bytes 4..6  : application session  (big endian)
//! bytes 6..8  : payload length       (big endian)
//! ```
//!
//! For [`Operation::Alerts`] the length field carries the OS error code of the
//! failed target connect and no payload follows.
//!
//! The codec works in place on an [`IoBuffer`]: [`insert_at`] opens an 8-byte
//! gap in front of a chunk and writes the header into it, [`strip_at`] decodes
//! a header and closes the gap again.

use bytes::{Buf, BufMut};

use crate::core::buffer::IoBuffer;
use crate::core::session::SessionBinding;
use crate::error::{constants, Result, TunnelError};

/// Size of the envelope on the wire
pub const ENVELOPE_LEN: usize = 8;

/// Protocol version written by this implementation
pub const USC_VERSION: u8 = 1;

/// Application id used when no session is bound (NETCONF over TLS port)
pub const DEFAULT_APP_ID: u16 = 6513;

/// Application session used when no session is bound
pub const DEFAULT_APP_SESSION: u16 = 1000;

/// Largest payload a single envelope can describe
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// NETCONF 1.0 message start (`<?xml`)
pub const NC_V10_START: &[u8] = b"<?xml";

/// NETCONF 1.1 chunk start (`\n#`)
pub const NC_V11_START: &[u8] = b"\n#";

/// NETCONF 1.0 end-of-message delimiter
pub const NC_V10_END: &[u8] = b"]]>]]>";

/// NETCONF 1.1 end-of-chunks delimiter
pub const NC_V11_END: &[u8] = b"\n##\n";

/// USC operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    HelloReq = 1,
    HelloResp = 2,
    Acknowledge = 3,
    Data = 4,
    ServiceUpdate = 5,
    ServiceAck = 6,
    HealthStatReq = 7,
    HealthStatResp = 8,
    Alerts = 9,
    HeartBeatReq = 10,
    HeartBeatResp = 11,
}

impl Operation {
    /// Whether `payload_len` bytes of payload follow the header
    pub fn carries_payload(self) -> bool {
        !matches!(
            self,
            Operation::Alerts | Operation::HeartBeatReq | Operation::HeartBeatResp
        )
    }
}

impl TryFrom<u8> for Operation {
    type Error = TunnelError;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            1 => Operation::HelloReq,
            2 => Operation::HelloResp,
            3 => Operation::Acknowledge,
            4 => Operation::Data,
            5 => Operation::ServiceUpdate,
            6 => Operation::ServiceAck,
            7 => Operation::HealthStatReq,
            8 => Operation::HealthStatResp,
            9 => Operation::Alerts,
            10 => Operation::HeartBeatReq,
            11 => Operation::HeartBeatResp,
            other => {
                return Err(TunnelError::InvalidEnvelope(format!(
                    "unknown operation code {other}"
                )))
            }
        })
    }
}

/// Security transport tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecurityTransport {
    Tls = 1,
    Dtls = 2,
    Ssh = 3,
    Ipsec = 4,
}

impl TryFrom<u8> for SecurityTransport {
    type Error = TunnelError;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            1 => SecurityTransport::Tls,
            2 => SecurityTransport::Dtls,
            3 => SecurityTransport::Ssh,
            4 => SecurityTransport::Ipsec,
            other => {
                return Err(TunnelError::InvalidEnvelope(format!(
                    "unknown security transport {other}"
                )))
            }
        })
    }
}

/// Which NETCONF framing a chunk starts with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetconfFraming {
    /// `]]>]]>`-delimited framing
    V10,
    /// Chunked framing
    V11,
}

/// Decoded USC header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub version: u8,
    pub op: Operation,
    pub security: SecurityTransport,
    pub app_id: u16,
    pub app_session: u16,
    pub payload_len: u16,
}

impl Envelope {
    /// Envelope at the current protocol version
    pub fn new(
        op: Operation,
        security: SecurityTransport,
        app_id: u16,
        app_session: u16,
        payload_len: u16,
    ) -> Self {
        Self {
            version: USC_VERSION,
            op,
            security,
            app_id,
            app_session,
            payload_len,
        }
    }

    /// Serialize to the 8-byte wire form
    pub fn to_bytes(&self) -> [u8; ENVELOPE_LEN] {
        let mut out = [0u8; ENVELOPE_LEN];
        let mut w = &mut out[..];
        w.put_u8(((self.version & 0x0f) << 4) | (self.op as u8 & 0x0f));
        w.put_u8(self.security as u8);
        w.put_u16(self.app_id);
        w.put_u16(self.app_session);
        w.put_u16(self.payload_len);
        out
    }

    /// Parse the first 8 bytes of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        RawHeader::parse(bytes)?.decode()
    }

    /// Error code carried by an ALERTS envelope
    pub fn alert_code(&self) -> Option<i32> {
        (self.op == Operation::Alerts).then_some(i32::from(self.payload_len))
    }
}

/// Header fields as they appear on the wire, before the operation and
/// security tag are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub version: u8,
    pub op: u8,
    pub security: u8,
    pub app_id: u16,
    pub app_session: u16,
    pub payload_len: u16,
}

impl RawHeader {
    /// Split the first 8 bytes of `bytes` into fields
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENVELOPE_LEN {
            return Err(TunnelError::InvalidEnvelope(
                constants::ERR_SHORT_ENVELOPE.into(),
            ));
        }
        let mut r = &bytes[..ENVELOPE_LEN];
        let first = r.get_u8();
        Ok(Self {
            version: first >> 4,
            op: first & 0x0f,
            security: r.get_u8(),
            app_id: r.get_u16(),
            app_session: r.get_u16(),
            payload_len: r.get_u16(),
        })
    }

    pub fn decode(&self) -> Result<Envelope> {
        Ok(Envelope {
            version: self.version,
            op: Operation::try_from(self.op)?,
            security: SecurityTransport::try_from(self.security)?,
            app_id: self.app_id,
            app_session: self.app_session,
            payload_len: self.payload_len,
        })
    }

    /// Payload bytes that follow this header on the wire.
    ///
    /// Unknown operations are assumed to carry `payload_len` bytes so the
    /// stream stays in step with the sender.
    pub fn payload_on_wire(&self) -> usize {
        match Operation::try_from(self.op) {
            Ok(op) if !op.carries_payload() => 0,
            _ => usize::from(self.payload_len),
        }
    }
}

/// Build the envelope for an outgoing chunk.
///
/// Version, application id and session come from `binding` when one is
/// established; otherwise the protocol defaults are used. Lengths of 65536 or
/// more are truncated to 16 bits.
pub fn encode(
    binding: Option<&SessionBinding>,
    payload_len: usize,
    op: Operation,
    security: SecurityTransport,
) -> Envelope {
    let (version, app_id, app_session) = match binding {
        Some(b) => (b.version, b.app_id, b.app_session),
        None => (USC_VERSION, DEFAULT_APP_ID, DEFAULT_APP_SESSION),
    };
    Envelope {
        version,
        op,
        security,
        app_id,
        app_session,
        payload_len: payload_len as u16,
    }
}

/// Decode the envelope at the head of `bytes` without consuming it.
///
/// Returns the envelope and the offset at which its payload starts.
pub fn decode(bytes: &[u8]) -> Result<(Envelope, usize)> {
    Ok((Envelope::from_bytes(bytes)?, ENVELOPE_LEN))
}

/// Prefix the whole buffer with `envelope`
pub fn insert(buf: &mut IoBuffer, envelope: &Envelope) -> Result<()> {
    insert_at(buf, 0, envelope)
}

/// Shift bytes `offset..len` forward by 8 and write `envelope` into the gap
pub fn insert_at(buf: &mut IoBuffer, offset: usize, envelope: &Envelope) -> Result<()> {
    buf.shift_right_at(offset, ENVELOPE_LEN)?;
    buf.write_at(offset, &envelope.to_bytes())
}

/// Remove the envelope at the head of the buffer
pub fn strip(buf: &mut IoBuffer) -> Result<Envelope> {
    strip_at(buf, 0)
}

/// Decode the envelope at `offset` and close the gap it leaves.
///
/// The buffer is untouched when decoding fails.
pub fn strip_at(buf: &mut IoBuffer, offset: usize) -> Result<Envelope> {
    let head = buf.as_slice().get(offset..).unwrap_or_default();
    let (envelope, _) = decode(head)?;
    buf.shift_left_at(offset, ENVELOPE_LEN)?;
    Ok(envelope)
}

/// Alert sent back to the peer when the mapped target cannot be reached
pub fn make_error(app_id: u16, app_session: u16, err_code: i32) -> Envelope {
    Envelope::new(
        Operation::Alerts,
        SecurityTransport::Tls,
        app_id,
        app_session,
        err_code as u16,
    )
}

/// Detect a NETCONF message start at the head of `chunk`
pub fn message_start(chunk: &[u8]) -> Option<NetconfFraming> {
    if chunk.starts_with(NC_V10_START) {
        Some(NetconfFraming::V10)
    } else if chunk.starts_with(NC_V11_START) {
        Some(NetconfFraming::V11)
    } else {
        None
    }
}

/// Whether `chunk` ends with either NETCONF end-of-message delimiter
pub fn message_end(chunk: &[u8]) -> bool {
    chunk.ends_with(NC_V10_END) || chunk.ends_with(NC_V11_END)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let env = Envelope::new(
            Operation::Data,
            SecurityTransport::Tls,
            DEFAULT_APP_ID,
            DEFAULT_APP_SESSION,
            200,
        );
        let bytes = env.to_bytes();
        assert_eq!(bytes[0], 0x14);
        assert_eq!(bytes[1], 0x01);
        assert_eq!(&bytes[2..4], &6513u16.to_be_bytes());
        assert_eq!(&bytes[4..6], &1000u16.to_be_bytes());
        assert_eq!(&bytes[6..8], &[0x00, 0xC8]);
    }

    #[test]
    fn test_decode_rejects_unknown_codes() {
        let mut bytes = Envelope::new(Operation::Data, SecurityTransport::Tls, 1, 2, 3).to_bytes();
        bytes[0] = 0x1f;
        assert!(Envelope::from_bytes(&bytes).is_err());
        bytes[0] = 0x14;
        bytes[1] = 9;
        assert!(Envelope::from_bytes(&bytes).is_err());
        assert!(Envelope::from_bytes(&bytes[..7]).is_err());
    }

    #[test]
    fn test_raw_header_keeps_unknown_tags() {
        let raw = RawHeader::parse(&[0x14, 0x05, 0x19, 0x71, 0x03, 0xe8, 0x00, 0x20]).expect("raw");
        assert_eq!((raw.op, raw.security, raw.payload_len), (4, 5, 32));
        assert!(raw.decode().is_err());
        assert_eq!(raw.payload_on_wire(), 32);

        // unknown op: length still taken as payload
        let raw = RawHeader::parse(&[0x1e, 0x01, 0, 0, 0, 0, 0x00, 0x10]).expect("raw");
        assert_eq!(raw.payload_on_wire(), 16);

        // heartbeat under an unknown tag has nothing behind it
        let raw = RawHeader::parse(&[0x1a, 0x07, 0, 0, 0, 0, 0x00, 0x10]).expect("raw");
        assert_eq!(raw.payload_on_wire(), 0);
    }

    #[test]
    fn test_encode_uses_binding() {
        let binding = SessionBinding {
            version: 2,
            app_id: 830,
            app_session: 7,
            security: SecurityTransport::Ssh,
        };
        let env = encode(Some(&binding), 70_000, Operation::Data, SecurityTransport::Tls);
        assert_eq!(env.version, 2);
        assert_eq!(env.app_id, 830);
        assert_eq!(env.app_session, 7);
        assert_eq!(env.payload_len, (70_000usize & 0xffff) as u16);

        let env = encode(None, 10, Operation::Data, SecurityTransport::Tls);
        assert_eq!(env.version, USC_VERSION);
        assert_eq!(env.app_id, DEFAULT_APP_ID);
        assert_eq!(env.app_session, DEFAULT_APP_SESSION);
    }

    #[test]
    fn test_insert_then_strip_at_offset() {
        let mut buf = IoBuffer::with_capacity(64);
        buf.extend_from_slice(b"headtail").expect("fill");
        let env = encode(None, 4, Operation::Data, SecurityTransport::Tls);
        insert_at(&mut buf, 4, &env).expect("insert");
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf.as_slice()[..4], b"head");
        assert_eq!(&buf.as_slice()[12..], b"tail");

        let stripped = strip_at(&mut buf, 4).expect("strip");
        assert_eq!(stripped, env);
        assert_eq!(buf.as_slice(), b"headtail");
    }

    #[test]
    fn test_strip_failure_leaves_buffer() {
        let mut buf = IoBuffer::with_capacity(16);
        buf.extend_from_slice(&[0xff; 10]).expect("fill");
        assert!(strip(&mut buf).is_err());
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_make_error() {
        let env = make_error(6513, 1000, libc::ECONNREFUSED);
        assert_eq!(env.version, USC_VERSION);
        assert_eq!(env.op, Operation::Alerts);
        assert_eq!(env.security, SecurityTransport::Tls);
        assert_eq!(env.alert_code(), Some(libc::ECONNREFUSED));
        assert!(!env.op.carries_payload());
    }

    #[test]
    fn test_markers() {
        assert_eq!(message_start(b"<?xml version"), Some(NetconfFraming::V10));
        assert_eq!(message_start(b"\n#4\nabcd"), Some(NetconfFraming::V11));
        assert_eq!(message_start(b"<rpc>"), None);
        assert!(message_end(b"</rpc>]]>]]>"));
        assert!(message_end(b"\n##\n"));
        assert!(!message_end(b"</rpc>"));
    }
}
