//! The packet framer and the typed reader/writer built on it.
//!
//! [`TdsLink`] owns the transport and carries both directions of a session:
//!
//! - the **reader** decodes typed values out of a response, silently
//!   re-reading packet headers at packet boundaries. Only the transport
//!   read inside the internal refill suspends, and it is cancel-safe:
//!   partial bytes live in the link, not in a dropped future.
//! - the **writer** buffers up to one packet payload, spills full non-final
//!   packets as the buffer fills, and stamps every emitted packet with the
//!   connection's packet id counter (incremented mod 256, never reset).
//!
//! The reader refuses `begin_response` while a previous response is
//! unfinished, and the writer refuses payloads that would exceed the
//! negotiated block size minus the header.

use bytes::{Buf, Bytes, BytesMut};
use encoding_rs::Encoding;
use tidewire_proto::packet::{
    PacketHeader, PacketKind, PacketStatus, DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE, PACKET_HEADER_LEN,
};

use crate::error::StreamError;
use crate::transport::Transport;

/// Framer state detached from its transport during a transport swap.
pub struct LinkState {
    block_size: usize,
    packet_id: u8,
    read_timeout: Option<std::time::Duration>,
    net: BytesMut,
    rbuf: BytesMut,
    current: Option<PacketHeader>,
    in_response: bool,
    finished: bool,
    wkind: PacketKind,
    wbuf: BytesMut,
}

/// Framed, typed, bidirectional stream over one transport.
pub struct TdsLink<T> {
    transport: T,
    block_size: usize,
    packet_id: u8,
    read_timeout: Option<std::time::Duration>,

    // Reader state.
    net: BytesMut,
    rbuf: BytesMut,
    current: Option<PacketHeader>,
    in_response: bool,
    finished: bool,

    // Writer state.
    wkind: PacketKind,
    wbuf: BytesMut,
}

impl<T: Transport> TdsLink<T> {
    /// Wrap a transport with the default block size.
    pub fn new(transport: T) -> Self {
        Self::with_block_size(transport, DEFAULT_BLOCK_SIZE)
    }

    /// Wrap a transport with an explicit block size.
    pub fn with_block_size(transport: T, block_size: usize) -> Self {
        Self {
            transport,
            block_size: block_size.max(MIN_BLOCK_SIZE),
            packet_id: 1,
            read_timeout: None,
            net: BytesMut::with_capacity(block_size),
            rbuf: BytesMut::new(),
            current: None,
            in_response: false,
            finished: true,
            wkind: PacketKind::Query,
            wbuf: BytesMut::with_capacity(block_size),
        }
    }

    /// Current block (packet) size.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Resize after a packet-size ENVCHANGE.
    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size.clamp(MIN_BLOCK_SIZE, 65535);
    }

    /// Bound every transport read; `None` waits forever.
    pub fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) {
        self.read_timeout = timeout;
    }

    /// Detach the transport, keeping the framer state (packet id counter,
    /// buffers) for [`TdsLink::from_parts`].
    ///
    /// The TLS splice replaces the transport at pre-login completion and
    /// again at LOGIN completion for "encrypt login only"; the packet id
    /// counter survives both swaps.
    pub fn into_parts(self) -> (T, LinkState) {
        (
            self.transport,
            LinkState {
                block_size: self.block_size,
                packet_id: self.packet_id,
                read_timeout: self.read_timeout,
                net: self.net,
                rbuf: self.rbuf,
                current: self.current,
                in_response: self.in_response,
                finished: self.finished,
                wkind: self.wkind,
                wbuf: self.wbuf,
            },
        )
    }

    /// Reattach framer state to a (possibly different) transport.
    pub fn from_parts(transport: T, state: LinkState) -> Self {
        Self {
            transport,
            block_size: state.block_size,
            packet_id: state.packet_id,
            read_timeout: state.read_timeout,
            net: state.net,
            rbuf: state.rbuf,
            current: state.current,
            in_response: state.in_response,
            finished: state.finished,
            wkind: state.wkind,
            wbuf: state.wbuf,
        }
    }

    /// Replace the transport, keeping framer state.
    pub fn map_transport<U: Transport>(self, f: impl FnOnce(T) -> U) -> TdsLink<U> {
        let (transport, state) = self.into_parts();
        TdsLink::from_parts(f(transport), state)
    }

    /// Consume the link, returning the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    // ------------------------------------------------------------------
    // Reader
    // ------------------------------------------------------------------

    /// Read the first packet of a response, returning its kind and spid.
    ///
    /// Calling this while a previous response is still being read is a
    /// protocol-usage error.
    pub async fn begin_response(&mut self) -> Result<(PacketKind, u16), StreamError> {
        if self.in_response && !self.finished {
            return Err(StreamError::InvalidState(
                "begin_response while a response is still being read",
            ));
        }
        self.rbuf.clear();
        self.current = None;
        self.load_packet().await?;
        self.in_response = true;
        self.finished = false;
        let header = self
            .current
            .ok_or(StreamError::InvalidState("no packet after load"))?;
        tracing::trace!(kind = ?header.kind, spid = header.spid, "response started");
        Ok((header.kind, header.spid))
    }

    /// True when the current response's last packet is fully consumed.
    #[must_use]
    pub fn stream_finished(&self) -> bool {
        self.finished
    }

    /// SPID echoed by the server in the current response.
    #[must_use]
    pub fn spid(&self) -> u16 {
        self.current.map_or(0, |h| h.spid)
    }

    async fn recv_more(&mut self) -> Result<(), StreamError> {
        let mut chunk = [0u8; 4096];
        let n = match self.read_timeout {
            None => self.transport.recv(&mut chunk).await?,
            Some(limit) => tokio::time::timeout(limit, self.transport.recv(&mut chunk))
                .await
                .map_err(|_| StreamError::ReadTimeout)??,
        };
        if n == 0 {
            return Err(StreamError::ConnectionClosed);
        }
        self.net.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    async fn load_packet(&mut self) -> Result<(), StreamError> {
        while self.net.len() < PACKET_HEADER_LEN {
            self.recv_more().await?;
        }
        let header = PacketHeader::decode(&mut &self.net[..PACKET_HEADER_LEN])?;
        let total = header.length as usize;
        while self.net.len() < total {
            self.recv_more().await?;
        }
        self.net.advance(PACKET_HEADER_LEN);
        self.rbuf = self.net.split_to(total - PACKET_HEADER_LEN);
        self.current = Some(header);
        Ok(())
    }

    /// Make payload bytes available, crossing into the next packet of the
    /// same response when the current one is drained and not the last.
    async fn ensure_data(&mut self) -> Result<bool, StreamError> {
        loop {
            if !self.rbuf.is_empty() {
                return Ok(true);
            }
            match self.current {
                Some(header) if header.is_last() => {
                    self.finished = true;
                    return Ok(false);
                }
                _ => self.load_packet().await?,
            }
        }
    }

    /// Up to `n` bytes, never crossing a packet boundary.
    ///
    /// Returns an empty buffer once the response is exhausted.
    pub async fn recv(&mut self, n: usize) -> Result<Bytes, StreamError> {
        if !self.ensure_data().await? {
            return Ok(Bytes::new());
        }
        let take = n.min(self.rbuf.len());
        Ok(self.rbuf.split_to(take).freeze())
    }

    /// The remainder of the current packet in one buffer.
    pub async fn read_whole_packet(&mut self) -> Result<Bytes, StreamError> {
        if !self.ensure_data().await? {
            return Ok(Bytes::new());
        }
        Ok(self.rbuf.split().freeze())
    }

    /// Exactly `buf.len()` bytes, crossing packet boundaries as needed.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let mut filled = 0;
        while filled < buf.len() {
            if !self.ensure_data().await? {
                return Err(StreamError::Protocol(
                    tidewire_proto::ProtocolError::UnexpectedEof("response stream"),
                ));
            }
            let take = (buf.len() - filled).min(self.rbuf.len());
            buf[filled..filled + take].copy_from_slice(&self.rbuf.split_to(take));
            filled += take;
        }
        Ok(())
    }

    /// Exactly `n` bytes as an owned buffer.
    pub async fn read_bytes(&mut self, n: usize) -> Result<Bytes, StreamError> {
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Read one byte.
    pub async fn read_u8(&mut self) -> Result<u8, StreamError> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b).await?;
        Ok(b[0])
    }

    /// Read a little-endian u16.
    pub async fn read_u16(&mut self) -> Result<u16, StreamError> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b).await?;
        Ok(u16::from_le_bytes(b))
    }

    /// Read a little-endian i16.
    pub async fn read_i16(&mut self) -> Result<i16, StreamError> {
        Ok(self.read_u16().await? as i16)
    }

    /// Read a little-endian u32.
    pub async fn read_u32(&mut self) -> Result<u32, StreamError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b).await?;
        Ok(u32::from_le_bytes(b))
    }

    /// Read a little-endian i32.
    pub async fn read_i32(&mut self) -> Result<i32, StreamError> {
        Ok(self.read_u32().await? as i32)
    }

    /// Read a big-endian u32 (LOGINACK's version field).
    pub async fn read_u32_be(&mut self) -> Result<u32, StreamError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b).await?;
        Ok(u32::from_be_bytes(b))
    }

    /// Read a little-endian u64.
    pub async fn read_u64(&mut self) -> Result<u64, StreamError> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b).await?;
        Ok(u64::from_le_bytes(b))
    }

    /// Read a little-endian i64.
    pub async fn read_i64(&mut self) -> Result<i64, StreamError> {
        Ok(self.read_u64().await? as i64)
    }

    /// Read `char_count` UCS-2 LE code units.
    pub async fn read_ucs2(&mut self, char_count: usize) -> Result<String, StreamError> {
        let raw = self.read_bytes(char_count * 2).await?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units)
            .map_err(|_| StreamError::Protocol(tidewire_proto::ProtocolError::InvalidUcs2))
    }

    /// Read `n_bytes` and decode them with the given codec.
    pub async fn read_str(
        &mut self,
        n_bytes: usize,
        codec: &'static Encoding,
    ) -> Result<String, StreamError> {
        let raw = self.read_bytes(n_bytes).await?;
        let (text, _, _) = codec.decode(&raw);
        Ok(text.into_owned())
    }

    // ------------------------------------------------------------------
    // Writer
    // ------------------------------------------------------------------

    /// Start a new outgoing message of the given kind.
    pub fn begin_packet(&mut self, kind: PacketKind) {
        self.wkind = kind;
        self.wbuf.clear();
    }

    /// Append bytes, spilling full non-final packets as the buffer fills.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<(), StreamError> {
        let cap = self.block_size - PACKET_HEADER_LEN;
        while !data.is_empty() {
            if self.wbuf.len() == cap {
                self.emit_packet(false).await?;
            }
            let take = (cap - self.wbuf.len()).min(data.len());
            self.wbuf.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        Ok(())
    }

    /// Emit the final packet of the message (status bit 0 set).
    pub async fn flush(&mut self) -> Result<(), StreamError> {
        self.emit_packet(true).await
    }

    /// Convenience: one whole message.
    pub async fn send_message(
        &mut self,
        kind: PacketKind,
        payload: &[u8],
    ) -> Result<(), StreamError> {
        self.begin_packet(kind);
        self.write(payload).await?;
        self.flush().await
    }

    /// Send a CANCEL (attention) packet.
    pub async fn send_cancel(&mut self) -> Result<(), StreamError> {
        self.send_message(PacketKind::Cancel, &[]).await
    }

    async fn emit_packet(&mut self, last: bool) -> Result<(), StreamError> {
        let status = if last {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::empty()
        };
        let payload = self.wbuf.split();
        let header = PacketHeader {
            kind: self.wkind,
            status,
            length: (PACKET_HEADER_LEN + payload.len()) as u16,
            spid: 0,
            packet_id: self.packet_id,
            window: 0,
        };
        self.packet_id = self.packet_id.wrapping_add(1);

        let mut out = BytesMut::with_capacity(PACKET_HEADER_LEN + payload.len());
        header.encode(&mut out);
        out.extend_from_slice(&payload);
        tracing::trace!(
            kind = ?header.kind,
            len = out.len(),
            packet_id = header.packet_id,
            last,
            "packet out"
        );
        self.transport.send_all(&out).await?;
        Ok(())
    }
}
