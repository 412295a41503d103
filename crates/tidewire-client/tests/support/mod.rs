//! Scripted-server test support: token stream builders and TDS framing
//! helpers for driving a session against canned responses.

#![allow(dead_code, missing_docs, clippy::unwrap_used, clippy::expect_used)]

use bytes::{BufMut, BytesMut};
use tidewire_proto::codec::{write_b_varchar, write_us_varchar};
use tidewire_proto::collation::Collation;
use tidewire_proto::encode::encode_value;
use tidewire_proto::packet::{PacketKind, PACKET_HEADER_LEN};
use tidewire_proto::token::{DoneStatus, TokenId};
use tidewire_proto::typeinfo::{CharWidth, TypeId, TypeInfo};
use tidewire_proto::value::Value;
use tidewire_proto::version::TdsVersion;

/// Builds the token stream of one server response.
pub struct ResponseBuilder {
    buf: BytesMut,
    version: TdsVersion,
}

impl ResponseBuilder {
    pub fn new(version: TdsVersion) -> Self {
        Self {
            buf: BytesMut::new(),
            version,
        }
    }

    pub fn int_type() -> TypeInfo {
        TypeInfo::ByteLen {
            id: TypeId::IntN,
            size: 4,
        }
    }

    pub fn nvarchar_type(size: u16) -> TypeInfo {
        TypeInfo::UShortString {
            id: TypeId::NVarChar,
            size,
            collation: Collation::new(1033, 0),
            width: CharWidth::Wide,
        }
    }

    pub fn colmetadata(mut self, columns: &[(&str, TypeInfo)]) -> Self {
        self.buf.put_u8(TokenId::ColMetaData as u8);
        self.buf.put_u16_le(columns.len() as u16);
        for (name, info) in columns {
            if self.version.is_72_plus() {
                self.buf.put_u32_le(0);
            } else {
                self.buf.put_u16_le(0);
            }
            self.buf.put_u16_le(0x0009);
            info.encode(&mut self.buf);
            write_b_varchar(&mut self.buf, name);
        }
        self
    }

    pub fn row(mut self, columns: &[(&str, TypeInfo)], values: &[Value]) -> Self {
        self.buf.put_u8(TokenId::Row as u8);
        for ((_, info), value) in columns.iter().zip(values) {
            encode_value(&mut self.buf, info, value).expect("encodable test value");
        }
        self
    }

    pub fn nbcrow(
        mut self,
        columns: &[(&str, TypeInfo)],
        bitmap: &[u8],
        values: &[Value],
    ) -> Self {
        self.buf.put_u8(TokenId::NbcRow as u8);
        self.buf.put_slice(bitmap);
        let mut value_iter = values.iter();
        for (i, (_, info)) in columns.iter().enumerate() {
            let is_null = bitmap[i / 8] & (1 << (i % 8)) != 0;
            if !is_null {
                let value = value_iter.next().expect("value for non-null column");
                encode_value(&mut self.buf, info, value).expect("encodable test value");
            }
        }
        self
    }

    pub fn done(mut self, id: TokenId, status: DoneStatus, row_count: u64) -> Self {
        self.buf.put_u8(id as u8);
        self.buf.put_u16_le(status.bits());
        self.buf.put_u16_le(0);
        if self.version.is_72_plus() {
            self.buf.put_u64_le(row_count);
        } else {
            self.buf.put_u32_le(row_count as u32);
        }
        self
    }

    pub fn return_status(mut self, status: i32) -> Self {
        self.buf.put_u8(TokenId::ReturnStatus as u8);
        self.buf.put_i32_le(status);
        self
    }

    pub fn return_value(mut self, ordinal: u16, name: &str, value: &Value) -> Self {
        self.buf.put_u8(TokenId::ReturnValue as u8);
        self.buf.put_u16_le(ordinal);
        write_b_varchar(&mut self.buf, name);
        self.buf.put_u8(0x01);
        if self.version.is_72_plus() {
            self.buf.put_u32_le(0);
        } else {
            self.buf.put_u16_le(0);
        }
        self.buf.put_u16_le(0);
        let info = value.infer_type(self.version);
        info.encode(&mut self.buf);
        encode_value(&mut self.buf, &info, value).expect("encodable output value");
        self
    }

    pub fn server_error(mut self, number: i32, class: u8, message: &str) -> Self {
        let mut body = BytesMut::new();
        body.put_i32_le(number);
        body.put_u8(1);
        body.put_u8(class);
        write_us_varchar(&mut body, message);
        write_b_varchar(&mut body, "mock");
        write_b_varchar(&mut body, "");
        if self.version.is_72_plus() {
            body.put_u32_le(1);
        } else {
            body.put_u16_le(1);
        }
        self.buf.put_u8(TokenId::Error as u8);
        self.buf.put_u16_le(body.len() as u16);
        self.buf.put_slice(&body);
        self
    }

    pub fn env_database(self, new: &str, old: &str) -> Self {
        let mut body = BytesMut::new();
        body.put_u8(1);
        write_b_varchar(&mut body, new);
        write_b_varchar(&mut body, old);
        self.env(body)
    }

    pub fn env_packet_size(self, new: u32) -> Self {
        let mut body = BytesMut::new();
        body.put_u8(4);
        write_b_varchar(&mut body, &new.to_string());
        write_b_varchar(&mut body, "4096");
        self.env(body)
    }

    pub fn env_collation(self, collation: Collation) -> Self {
        let mut body = BytesMut::new();
        body.put_u8(7);
        body.put_u8(5);
        collation.encode(&mut body);
        body.put_u8(0);
        self.env(body)
    }

    pub fn env_routing(self, host: &str, port: u16) -> Self {
        let mut body = BytesMut::new();
        body.put_u8(20);
        body.put_u16_le((1 + 2 + 2 + host.encode_utf16().count() * 2) as u16);
        body.put_u8(0);
        body.put_u16_le(port);
        write_us_varchar(&mut body, host);
        self.env(body)
    }

    fn env(mut self, body: BytesMut) -> Self {
        self.buf.put_u8(TokenId::EnvChange as u8);
        self.buf.put_u16_le(body.len() as u16);
        self.buf.put_slice(&body);
        self
    }

    pub fn login_ack(mut self, version: TdsVersion) -> Self {
        let mut body = BytesMut::new();
        body.put_u8(1);
        let raw = match version {
            v if v == TdsVersion::V7_0 => 0x0700_0000,
            v if v == TdsVersion::V7_1 => 0x0701_0000,
            v => v.raw(),
        };
        body.put_u32(raw);
        write_b_varchar(&mut body, "Microsoft SQL Server");
        body.put_u8(12);
        body.put_u8(0);
        body.put_u16(2000);
        self.buf.put_u8(TokenId::LoginAck as u8);
        self.buf.put_u16_le(body.len() as u16);
        self.buf.put_slice(&body);
        self
    }

    pub fn finish(self) -> BytesMut {
        self.buf
    }

    /// Frame the token stream into REPLY packets of the given block size.
    pub fn into_packets(self, block_size: usize) -> Vec<u8> {
        frame_message(PacketKind::Reply, &self.buf, block_size)
    }
}

/// Split a message payload into TDS packets.
pub fn frame_message(kind: PacketKind, payload: &[u8], block_size: usize) -> Vec<u8> {
    let cap = block_size - PACKET_HEADER_LEN;
    let mut out = Vec::new();
    let mut chunks = payload.chunks(cap).peekable();
    let mut packet_id = 1u8;
    let mut wrote_any = false;
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        push_packet(&mut out, kind, last, packet_id, chunk);
        packet_id = packet_id.wrapping_add(1);
        wrote_any = true;
    }
    if !wrote_any {
        push_packet(&mut out, kind, true, packet_id, &[]);
    }
    out
}

fn push_packet(out: &mut Vec<u8>, kind: PacketKind, last: bool, packet_id: u8, payload: &[u8]) {
    out.push(kind as u8);
    out.push(u8::from(last));
    out.extend_from_slice(&((payload.len() + PACKET_HEADER_LEN) as u16).to_be_bytes());
    out.extend_from_slice(&42u16.to_be_bytes());
    out.push(packet_id);
    out.push(0);
    out.extend_from_slice(payload);
}

/// Read one whole TDS message (all packets to EOM) from a raw byte source.
pub struct MessageScanner {
    pending: Vec<u8>,
}

impl MessageScanner {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Pop one complete message: (kind, payload across all its packets).
    pub fn pop_message(&mut self) -> Option<(PacketKind, Vec<u8>)> {
        let mut offset = 0;
        let mut payload = Vec::new();
        let mut kind = None;
        loop {
            if self.pending.len() < offset + PACKET_HEADER_LEN {
                return None;
            }
            let header = &self.pending[offset..offset + PACKET_HEADER_LEN];
            let length = u16::from_be_bytes([header[2], header[3]]) as usize;
            if self.pending.len() < offset + length {
                return None;
            }
            kind.get_or_insert(header[0]);
            let last = header[1] & 0x01 != 0;
            payload.extend_from_slice(&self.pending[offset + PACKET_HEADER_LEN..offset + length]);
            offset += length;
            if last {
                self.pending.drain(..offset);
                let kind = PacketKind::from_u8(kind.unwrap_or(1)).ok()?;
                return Some((kind, payload));
            }
        }
    }
}
