//! TDS packet header definitions.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// TDS packet header size in bytes.
pub const PACKET_HEADER_LEN: usize = 8;

/// Default negotiated packet (block) size.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Smallest block size the protocol permits.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Largest block size the protocol permits (64KB - 1).
pub const MAX_BLOCK_SIZE: usize = 65535;

/// TDS packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// SQL batch request.
    Query = 1,
    /// Remote procedure call.
    Rpc = 3,
    /// Tabular response from the server.
    Reply = 4,
    /// Attention signal cancelling the current request.
    Cancel = 6,
    /// Bulk load data.
    Bulk = 7,
    /// Federated authentication token.
    FedAuthToken = 8,
    /// Transaction manager request.
    Trans = 14,
    /// TDS7+ login.
    Login = 16,
    /// SSPI authentication payload.
    Auth = 17,
    /// Pre-login negotiation.
    PreLogin = 18,
}

impl PacketKind {
    /// Create a packet kind from its wire byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(Self::Query),
            3 => Ok(Self::Rpc),
            4 => Ok(Self::Reply),
            6 => Ok(Self::Cancel),
            7 => Ok(Self::Bulk),
            8 => Ok(Self::FedAuthToken),
            14 => Ok(Self::Trans),
            16 => Ok(Self::Login),
            17 => Ok(Self::Auth),
            18 => Ok(Self::PreLogin),
            _ => Err(ProtocolError::InvalidPacketKind(value)),
        }
    }
}

bitflags! {
    /// TDS packet status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// Last packet in the message.
        const END_OF_MESSAGE = 0x01;
        /// Ignore this event (sent with an attention acknowledgment).
        const IGNORE_EVENT = 0x02;
        /// Reset connection before processing.
        const RESET_CONNECTION = 0x08;
        /// Reset connection but keep transaction state.
        const RESET_CONNECTION_KEEP_TRANSACTION = 0x10;
    }
}

/// TDS packet header.
///
/// Every packet begins with an 8-byte header; `length` covers the header
/// itself plus the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Kind of packet.
    pub kind: PacketKind,
    /// Status flags.
    pub status: PacketStatus,
    /// Total packet length including header, big-endian on the wire.
    pub length: u16,
    /// Server process id, echoed by the server in responses.
    pub spid: u16,
    /// Packet sequence number, wraps mod 256.
    pub packet_id: u8,
    /// Window; unused, always 0.
    pub window: u8,
}

impl PacketHeader {
    /// Create a header for an outgoing packet.
    #[must_use]
    pub const fn new(kind: PacketKind, status: PacketStatus, length: u16) -> Self {
        Self {
            kind,
            status,
            length,
            spid: 0,
            packet_id: 0,
            window: 0,
        }
    }

    /// Parse a header from the front of `src`.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < PACKET_HEADER_LEN {
            return Err(ProtocolError::UnexpectedEof("packet header"));
        }

        let kind = PacketKind::from_u8(src.get_u8())?;
        let status = PacketStatus::from_bits_truncate(src.get_u8());
        let length = src.get_u16();
        let spid = src.get_u16();
        let packet_id = src.get_u8();
        let window = src.get_u8();

        if (length as usize) < PACKET_HEADER_LEN {
            return Err(ProtocolError::InvalidPacketLength(length));
        }

        Ok(Self {
            kind,
            status,
            length,
            spid,
            packet_id,
            window,
        })
    }

    /// Encode the header into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.status.bits());
        dst.put_u16(self.length);
        dst.put_u16(self.spid);
        dst.put_u8(self.packet_id);
        dst.put_u8(self.window);
    }

    /// Payload length: total length minus the header.
    #[must_use]
    pub const fn payload_len(&self) -> usize {
        self.length.saturating_sub(PACKET_HEADER_LEN as u16) as usize
    }

    /// True when this is the last packet of its message.
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn header_roundtrip() {
        let header = PacketHeader {
            kind: PacketKind::Query,
            status: PacketStatus::END_OF_MESSAGE,
            length: 512,
            spid: 61,
            packet_id: 7,
            window: 0,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), PACKET_HEADER_LEN);

        let decoded = PacketHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(PacketKind::from_u8(0x2A).is_err());
        assert_eq!(PacketKind::from_u8(18).unwrap(), PacketKind::PreLogin);
    }

    #[test]
    fn rejects_undersized_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(PacketKind::Reply as u8);
        buf.put_u8(0x01);
        buf.put_u16(4); // shorter than the header itself
        buf.put_u16(0);
        buf.put_u8(1);
        buf.put_u8(0);

        assert!(PacketHeader::decode(&mut buf.freeze()).is_err());
    }

    #[test]
    fn payload_len_subtracts_header() {
        let header = PacketHeader::new(PacketKind::Reply, PacketStatus::END_OF_MESSAGE, 100);
        assert_eq!(header.payload_len(), 92);
    }
}
