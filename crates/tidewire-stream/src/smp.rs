//! The SMP multiplexer realizing MARS.
//!
//! One [`SmpManager`] owns the physical transport; each virtual session is
//! an [`SmpStream`] that implements [`Transport`] and can carry its own
//! `TdsLink`. All sends and receives are serialized under a single async
//! mutex: whichever session holds it pumps frames, dispatching payloads to
//! their owning sessions' queues.
//!
//! Flow control follows the protocol's windows: a sender's DATA sequence
//! number may never exceed the peer's last advertised high-water mark; a
//! sender with an exhausted window reads frames until an ACK widens it.
//! The local side advertises `last received + 4` and emits an ACK whenever
//! that mark has advanced by at least 2 since the last advertisement.
//!
//! Any illegal frame — wrong marker, unknown session, backward sequence,
//! shrinking window, FIN on a closed session — poisons the whole manager:
//! MARS framing errors are not recoverable per-session.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tidewire_proto::smp::{
    SmpFlags, SmpHeader, SmpSessionState, SMP_HEADER_LEN, SMP_INITIAL_WINDOW,
};
use tokio::sync::Mutex;

use crate::error::StreamError;
use crate::transport::Transport;

/// Multiplexes virtual sessions over one transport.
pub struct SmpManager<T> {
    inner: Arc<Mutex<SmpInner<T>>>,
}

impl<T> Clone for SmpManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A virtual session; implements [`Transport`] for use under a `TdsLink`.
pub struct SmpStream<T> {
    session_id: u16,
    inner: Arc<Mutex<SmpInner<T>>>,
}

struct SmpInner<T> {
    transport: T,
    sessions: HashMap<u16, SmpSession>,
    ids: IdBitmap,
    poisoned: bool,
    rnet: BytesMut,
}

struct SmpSession {
    state: SmpSessionState,
    /// Sequence number of the last DATA frame sent.
    send_seq: u32,
    /// Peer-advertised high-water mark bounding `send_seq`.
    peer_window: u32,
    /// Sequence number of the last DATA frame received.
    recv_seq: u32,
    /// High-water mark last advertised to the peer.
    last_advertised: u32,
    recv_queue: VecDeque<Bytes>,
}

impl SmpSession {
    fn new() -> Self {
        Self {
            state: SmpSessionState::New,
            send_seq: 0,
            peer_window: SMP_INITIAL_WINDOW,
            recv_seq: 0,
            last_advertised: SMP_INITIAL_WINDOW,
            recv_queue: VecDeque::new(),
        }
    }

    /// The receive high-water mark this side can advertise.
    fn recv_high_water(&self) -> u32 {
        self.recv_seq + SMP_INITIAL_WINDOW
    }
}

/// 65536-bit session id allocator; lowest clear bit wins.
struct IdBitmap {
    words: Vec<u64>,
}

impl IdBitmap {
    fn new() -> Self {
        Self {
            words: vec![0u64; 1024],
        }
    }

    fn allocate(&mut self) -> Option<u16> {
        for (i, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                return Some((i * 64 + bit) as u16);
            }
        }
        None
    }

    fn release(&mut self, id: u16) {
        let id = id as usize;
        self.words[id / 64] &= !(1 << (id % 64));
    }
}

impl<T: Transport> SmpManager<T> {
    /// Take ownership of the transport and start multiplexing.
    pub fn new(transport: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SmpInner {
                transport,
                sessions: HashMap::new(),
                ids: IdBitmap::new(),
                poisoned: false,
                rnet: BytesMut::new(),
            })),
        }
    }

    /// Open a new virtual session: allocate the lowest free id, send SYN.
    pub async fn open_session(&self) -> Result<SmpStream<T>, StreamError> {
        let mut inner = self.inner.lock().await;
        inner.check_poisoned()?;

        let session_id = inner
            .ids
            .allocate()
            .ok_or(StreamError::SmpCorrupt("session ids exhausted"))?;
        let session = SmpSession::new();
        let syn = SmpHeader::new(
            SmpFlags::SYN,
            session_id,
            0,
            session.send_seq,
            session.recv_high_water(),
        );
        inner.send_frame(syn, &[]).await?;

        let mut session = session;
        session.state = SmpSessionState::Established;
        inner.sessions.insert(session_id, session);
        tracing::debug!(session_id, "smp session opened");

        Ok(SmpStream {
            session_id,
            inner: Arc::clone(&self.inner),
        })
    }
}

impl<T: Transport> SmpInner<T> {
    fn check_poisoned(&self) -> Result<(), StreamError> {
        if self.poisoned {
            Err(StreamError::SmpCorrupt("manager is dead"))
        } else {
            Ok(())
        }
    }

    fn poison(&mut self, reason: &'static str) -> StreamError {
        self.poisoned = true;
        tracing::warn!(reason, "smp manager poisoned");
        StreamError::SmpCorrupt(reason)
    }

    async fn send_frame(&mut self, header: SmpHeader, payload: &[u8]) -> Result<(), StreamError> {
        let mut out = BytesMut::with_capacity(SMP_HEADER_LEN + payload.len());
        header.encode(&mut out);
        out.extend_from_slice(payload);
        self.transport.send_all(&out).await?;
        Ok(())
    }

    async fn recv_more(&mut self) -> Result<(), StreamError> {
        let mut chunk = [0u8; 4096];
        let n = self.transport.recv(&mut chunk).await?;
        if n == 0 {
            return Err(StreamError::ConnectionClosed);
        }
        self.rnet.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Read and dispatch exactly one frame.
    async fn pump_frame(&mut self) -> Result<(), StreamError> {
        while self.rnet.len() < SMP_HEADER_LEN {
            self.recv_more().await?;
        }
        let header = match SmpHeader::decode(&mut &self.rnet[..SMP_HEADER_LEN]) {
            Ok(h) => h,
            Err(_) => return Err(self.poison("malformed frame header")),
        };
        let total = header.length as usize;
        while self.rnet.len() < total {
            self.recv_more().await?;
        }
        self.rnet.advance(SMP_HEADER_LEN);
        let payload = self.rnet.split_to(total - SMP_HEADER_LEN).freeze();

        let Some(session) = self.sessions.get_mut(&header.session_id) else {
            return Err(self.poison("frame for unknown session"));
        };

        if header.flags.contains(SmpFlags::SYN) {
            return Err(self.poison("unexpected SYN from server"));
        }

        if header.flags.contains(SmpFlags::DATA) {
            if matches!(session.state, SmpSessionState::Closed) {
                return Err(self.poison("data on closed session"));
            }
            if header.seqnum <= session.recv_seq {
                return Err(self.poison("backward data sequence"));
            }
            if header.seqnum != session.recv_seq + 1 {
                return Err(self.poison("data sequence gap"));
            }
            session.recv_seq = header.seqnum;
            session.peer_window = session.peer_window.max(header.window);
            session.recv_queue.push_back(payload);

            // Advertise a wider window once it has moved enough.
            let high_water = session.recv_high_water();
            let send_seq = session.send_seq;
            if high_water - session.last_advertised >= 2 {
                session.last_advertised = high_water;
                let ack =
                    SmpHeader::new(SmpFlags::ACK, header.session_id, 0, send_seq, high_water);
                self.send_frame(ack, &[]).await?;
            }
            return Ok(());
        }

        if header.flags.contains(SmpFlags::ACK) {
            if header.window < session.peer_window {
                return Err(self.poison("peer shrank the send window"));
            }
            session.peer_window = header.window;
            return Ok(());
        }

        if header.flags.contains(SmpFlags::FIN) {
            match session.state {
                SmpSessionState::Established => {
                    session.state = SmpSessionState::FinReceived;
                }
                SmpSessionState::FinSent => {
                    session.state = SmpSessionState::Closed;
                    self.sessions.remove(&header.session_id);
                    self.ids.release(header.session_id);
                }
                SmpSessionState::Closed | SmpSessionState::New | SmpSessionState::FinReceived => {
                    return Err(self.poison("unexpected FIN"));
                }
            }
            return Ok(());
        }

        Err(self.poison("frame with no operation flag"))
    }
}

impl<T: Transport> SmpStream<T> {
    /// The virtual session id.
    #[must_use]
    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    /// Close this direction; completes when both sides have FINed.
    pub async fn close(&mut self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().await;
        inner.check_poisoned()?;

        let Some(session) = inner.sessions.get_mut(&self.session_id) else {
            return Ok(());
        };
        let state = session.state;
        let fin = SmpHeader::new(
            SmpFlags::FIN,
            self.session_id,
            0,
            session.send_seq,
            session.recv_high_water(),
        );
        match state {
            SmpSessionState::Established => {
                inner.send_frame(fin, &[]).await?;
                if let Some(s) = inner.sessions.get_mut(&self.session_id) {
                    s.state = SmpSessionState::FinSent;
                }
                while inner.sessions.contains_key(&self.session_id) {
                    inner.pump_frame().await?;
                }
            }
            SmpSessionState::FinReceived => {
                inner.send_frame(fin, &[]).await?;
                inner.sessions.remove(&self.session_id);
                inner.ids.release(self.session_id);
            }
            _ => {}
        }
        tracing::debug!(session_id = self.session_id, "smp session closed");
        Ok(())
    }
}

#[async_trait]
impl<T: Transport> Transport for SmpStream<T> {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().await;
        inner
            .check_poisoned()
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;

        loop {
            let Some(session) = inner.sessions.get_mut(&self.session_id) else {
                return Ok(0);
            };
            if let Some(front) = session.recv_queue.front_mut() {
                let take = front.len().min(buf.len());
                buf[..take].copy_from_slice(&front[..take]);
                front.advance(take);
                if front.is_empty() {
                    session.recv_queue.pop_front();
                }
                return Ok(take);
            }
            if matches!(
                session.state,
                SmpSessionState::FinReceived | SmpSessionState::Closed
            ) {
                return Ok(0);
            }
            inner
                .pump_frame()
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
    }

    async fn send_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .check_poisoned()
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;

        loop {
            let Some(session) = inner.sessions.get(&self.session_id) else {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    StreamError::SmpClosed,
                ));
            };
            if !matches!(session.state, SmpSessionState::Established) {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    StreamError::SmpClosed,
                ));
            }
            // Sequence numbers may not pass the peer's advertised mark.
            if session.send_seq + 1 <= session.peer_window {
                break;
            }
            tracing::trace!(
                session_id = self.session_id,
                "send window exhausted, pumping for ACK"
            );
            inner
                .pump_frame()
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }

        let (seq, window) = {
            let session = inner
                .sessions
                .get_mut(&self.session_id)
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, StreamError::SmpClosed))?;
            session.send_seq += 1;
            (session.send_seq, session.recv_high_water())
        };
        let header = SmpHeader::new(SmpFlags::DATA, self.session_id, data.len(), seq, window);
        inner
            .send_frame(header, data)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }
}
