//! Message framing.
//!
//! ```text
//!   ┌──────────┬────────┬──────────┬──────────────┬──────────────┐
//!   │ version  │ flags  │ msg_type │ body_length  │ body ...     │
//!   │ u16      │ u16    │ u16      │ u32          │              │
//!   └──────────┴────────┴──────────┴──────────────┴──────────────┘
//! ```

use std::fmt;
use std::ops::BitOr;

use bytes::Bytes;
use tracing::trace;

use crate::error::{ProtoError, ProtoResult};
use crate::pack::{Packer, Unpacker};
use crate::version::ProtocolVersion;

pub const HEADER_LEN: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HeaderFlags(u16);

impl HeaderFlags {
    pub const NONE: Self = Self(0);
    /// The receiver keeps the buffer after handling the message.
    pub const KEEP_BUFFER: Self = Self(1 << 0);
    pub const BCAST_NETWORK: Self = Self(1 << 1);
    pub const CTLD_QUEUE: Self = Self(1 << 2);
    pub const NO_AUTH: Self = Self(1 << 3);
    pub const PACKED_ADDRS: Self = Self(1 << 4);

    const ALL: u16 = 0x1f;

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> ProtoResult<Self> {
        if bits & !Self::ALL != 0 {
            return Err(ProtoError::invalid("header flags", format!("unknown bits {bits:#06x}")));
        }
        Ok(Self(bits))
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HeaderFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    NodeRegistrationStatus = 1002,
    JobAllocInfo = 4014,
    StepStatResponse = 5017,
}

impl TryFrom<u16> for MessageType {
    type Error = ProtoError;

    fn try_from(raw: u16) -> ProtoResult<Self> {
        match raw {
            1002 => Ok(Self::NodeRegistrationStatus),
            4014 => Ok(Self::JobAllocInfo),
            5017 => Ok(Self::StepStatResponse),
            other => Err(ProtoError::invalid("message type", other.to_string())),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NodeRegistrationStatus => "node_registration_status",
            Self::JobAllocInfo => "job_alloc_info",
            Self::StepStatResponse => "step_stat_response",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: ProtocolVersion,
    pub flags: HeaderFlags,
    pub msg_type: MessageType,
    pub body_length: u32,
}

impl Header {
    pub fn new(version: ProtocolVersion, msg_type: MessageType) -> Self {
        Self {
            version,
            flags: HeaderFlags::NONE,
            msg_type,
            body_length: 0,
        }
    }

    pub fn with_flags(mut self, flags: HeaderFlags) -> Self {
        self.flags = flags;
        self
    }

    fn pack(&self, p: &mut Packer) {
        p.u16(self.version.raw());
        p.u16(self.flags.bits());
        p.u16(self.msg_type as u16);
        p.u32(self.body_length);
    }

    fn unpack(u: &mut Unpacker) -> ProtoResult<Self> {
        let version = ProtocolVersion::negotiate(u.u16("header version")?)?;
        let flags = HeaderFlags::from_bits(u.u16("header flags")?)?;
        let msg_type = MessageType::try_from(u.u16("header msg_type")?)?;
        let body_length = u.u32("header body_length")?;
        Ok(Self {
            version,
            flags,
            msg_type,
            body_length,
        })
    }
}

/// A message body with a fixed type and a versioned encoding.
pub trait Message: Sized {
    const TYPE: MessageType;

    fn encode(&self, version: ProtocolVersion, p: &mut Packer);

    fn decode(version: ProtocolVersion, u: &mut Unpacker) -> ProtoResult<Self>;
}

/// Frame `body` behind `header`, filling in `body_length`.
pub fn encode_message(mut header: Header, body: &[u8]) -> ProtoResult<Bytes> {
    header.body_length = u32::try_from(body.len())
        .map_err(|_| ProtoError::invalid("body", format!("{} bytes is too large", body.len())))?;
    let mut p = Packer::new();
    header.pack(&mut p);
    let mut out = p.finish().to_vec();
    out.extend_from_slice(body);
    Ok(Bytes::from(out))
}

/// Split a framed message into its header and body.
pub fn decode_message(bytes: impl Into<Bytes>) -> ProtoResult<(Header, Bytes)> {
    let mut bytes: Bytes = bytes.into();
    if bytes.len() < HEADER_LEN {
        return Err(ProtoError::Truncated {
            what: "header",
            needed: HEADER_LEN - bytes.len(),
        });
    }
    let body = bytes.split_off(HEADER_LEN);
    let header = Header::unpack(&mut Unpacker::new(bytes))?;
    if body.len() != header.body_length as usize {
        return Err(ProtoError::LengthMismatch {
            expected: header.body_length,
            actual: body.len(),
        });
    }
    trace!(msg_type = %header.msg_type, version = %header.version, len = body.len(), "message decoded");
    Ok((header, body))
}

/// Encode `msg` for a peer speaking `version`.
pub fn frame<M: Message>(msg: &M, version: ProtocolVersion, flags: HeaderFlags) -> ProtoResult<Bytes> {
    let mut body = Packer::new();
    msg.encode(version, &mut body);
    encode_message(Header::new(version, M::TYPE).with_flags(flags), &body.finish())
}

/// Decode a framed `M`, checking the message type.
pub fn unframe<M: Message>(bytes: impl Into<Bytes>) -> ProtoResult<(Header, M)> {
    let (header, body) = decode_message(bytes)?;
    if header.msg_type != M::TYPE {
        return Err(ProtoError::invalid(
            "message type",
            format!("expected {}, got {}", M::TYPE, header.msg_type),
        ));
    }
    let mut u = Unpacker::new(body);
    let msg = M::decode(header.version, &mut u)?;
    u.finish("message body")?;
    Ok((header, msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_with_flags() {
        let flags = HeaderFlags::NO_AUTH | HeaderFlags::KEEP_BUFFER;
        let header = Header::new(ProtocolVersion::PREVIOUS, MessageType::JobAllocInfo).with_flags(flags);
        let bytes = encode_message(header, &[1, 2, 3]).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 3);

        let (decoded, body) = decode_message(bytes).unwrap();
        assert_eq!(decoded.body_length, 3);
        assert_eq!(decoded.version, ProtocolVersion::PREVIOUS);
        assert!(decoded.flags.contains(HeaderFlags::NO_AUTH));
        assert!(!decoded.flags.contains(HeaderFlags::CTLD_QUEUE));
        assert_eq!(&body[..], &[1, 2, 3]);
    }

    #[test]
    fn body_length_is_checked() {
        let header = Header::new(ProtocolVersion::CURRENT, MessageType::JobAllocInfo);
        let mut bytes = encode_message(header, &[0; 4]).unwrap().to_vec();
        bytes.pop();
        assert_eq!(
            decode_message(bytes),
            Err(ProtoError::LengthMismatch {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn old_peer_is_refused() {
        let mut bytes = encode_message(Header::new(ProtocolVersion::CURRENT, MessageType::JobAllocInfo), &[])
            .unwrap()
            .to_vec();
        bytes[0] = 39;
        assert_eq!(decode_message(bytes), Err(ProtoError::UnsupportedVersion(39 << 8)));
    }

    #[test]
    fn unknown_flag_bits_are_invalid() {
        assert!(HeaderFlags::from_bits(0x20).is_err());
        assert_eq!(HeaderFlags::from_bits(0x1f).map(|f| f.bits()), Ok(0x1f));
    }
}
