//! SMP (Session Multiplex Protocol) frame codec.
//!
//! When MARS is negotiated every TDS packet travels inside an SMP frame.
//! A frame is a 16-byte header — marker byte 0x53, flags, session id,
//! header-inclusive length, sequence number, window — optionally followed
//! by payload bytes for DATA frames.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// The fixed marker byte leading every SMP frame.
pub const SMP_MARKER: u8 = 0x53;

/// SMP header length.
pub const SMP_HEADER_LEN: usize = 16;

/// Initial receive window advertised on SYN.
pub const SMP_INITIAL_WINDOW: u32 = 4;

bitflags! {
    /// SMP frame flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SmpFlags: u8 {
        /// Open a session.
        const SYN = 0x01;
        /// Acknowledge receipt and widen the peer's send window.
        const ACK = 0x02;
        /// Close one direction of a session.
        const FIN = 0x04;
        /// Application payload follows the header.
        const DATA = 0x08;
    }
}

/// One SMP frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmpHeader {
    /// Frame flags.
    pub flags: SmpFlags,
    /// Virtual session id.
    pub session_id: u16,
    /// Total frame length including this header.
    pub length: u32,
    /// Sender's sequence number for DATA, else the current high mark.
    pub seqnum: u32,
    /// Sender's receive high-water mark.
    pub window: u32,
}

impl SmpHeader {
    /// Build a header for a payload of `payload_len` bytes.
    #[must_use]
    pub fn new(flags: SmpFlags, session_id: u16, payload_len: usize, seqnum: u32, window: u32) -> Self {
        Self {
            flags,
            session_id,
            length: (SMP_HEADER_LEN + payload_len) as u32,
            seqnum,
            window,
        }
    }

    /// Payload length: total minus the header.
    #[must_use]
    pub const fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(SMP_HEADER_LEN)
    }

    /// Decode a header; the marker and length are validated.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < SMP_HEADER_LEN {
            return Err(ProtocolError::UnexpectedEof("smp header"));
        }
        let marker = src.get_u8();
        if marker != SMP_MARKER {
            return Err(ProtocolError::SmpViolation("bad marker byte"));
        }
        let flags = SmpFlags::from_bits(src.get_u8())
            .ok_or(ProtocolError::SmpViolation("unknown flag bits"))?;
        let session_id = src.get_u16_le();
        let length = src.get_u32_le();
        let seqnum = src.get_u32_le();
        let window = src.get_u32_le();
        if (length as usize) < SMP_HEADER_LEN {
            return Err(ProtocolError::SmpViolation("length shorter than header"));
        }
        Ok(Self {
            flags,
            session_id,
            length,
            seqnum,
            window,
        })
    }

    /// Encode the header.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(SMP_MARKER);
        dst.put_u8(self.flags.bits());
        dst.put_u16_le(self.session_id);
        dst.put_u32_le(self.length);
        dst.put_u32_le(self.seqnum);
        dst.put_u32_le(self.window);
    }
}

/// Virtual session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpSessionState {
    /// Allocated, SYN not yet sent.
    New,
    /// Open in both directions.
    Established,
    /// We sent FIN, peer has not.
    FinSent,
    /// Peer sent FIN, we have not.
    FinReceived,
    /// Both directions closed; id is reusable.
    Closed,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn header_roundtrip() {
        let header = SmpHeader::new(SmpFlags::DATA, 3, 100, 7, 12);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), SMP_HEADER_LEN);

        let decoded = SmpHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.payload_len(), 100);
    }

    #[test]
    fn bad_marker_is_a_violation() {
        let header = SmpHeader::new(SmpFlags::SYN, 0, 0, 0, SMP_INITIAL_WINDOW);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf[0] = 0x54;
        assert!(SmpHeader::decode(&mut buf.freeze()).is_err());
    }

    #[test]
    fn short_length_is_a_violation() {
        let mut buf = BytesMut::new();
        buf.put_u8(SMP_MARKER);
        buf.put_u8(SmpFlags::ACK.bits());
        buf.put_u16_le(0);
        buf.put_u32_le(8); // < header length
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        assert!(SmpHeader::decode(&mut buf.freeze()).is_err());
    }
}
