//! The transport capability seam.
//!
//! A session talks to a [`Transport`]: something that can receive bytes and
//! send whole buffers. The concrete transports are [`TdsTransport`] (plain
//! TCP or TLS over the pre-login splice) and the SMP virtual stream from
//! [`crate::smp`]. The trait is the only place a session suspends.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::tls::TlsSpliceStream;

/// Byte transport under a session.
#[async_trait]
pub trait Transport: Send {
    /// Receive up to `buf.len()` bytes. Zero means the peer closed.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send the whole buffer.
    async fn send_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Adapter from any async byte stream to [`Transport`].
///
/// Production code wraps sockets through [`TdsTransport`]; tests wrap
/// in-memory duplex pipes through this.
#[derive(Debug)]
pub struct IoTransport<S>(pub S);

#[async_trait]
impl<S> Transport for IoTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).await
    }

    async fn send_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.write_all(data).await?;
        self.0.flush().await
    }
}

/// The physical connection to a server: plain TCP, or TLS established
/// through the pre-login splice.
///
/// The session holds one of these and replaces it exactly at pre-login
/// completion (plain to TLS) and, for "encrypt login only", once more at
/// LOGIN completion (TLS back to plain).
pub enum TdsTransport {
    /// Unencrypted TCP.
    Plain(TcpStream),
    /// TLS over the spliced stream.
    Tls(Box<TlsStream<TlsSpliceStream<TcpStream>>>),
}

impl TdsTransport {
    /// Whether the transport is currently TLS-wrapped.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Remove the TLS wrapper, recovering the plain socket.
    ///
    /// Used after LOGIN completes when only the login sequence was to be
    /// encrypted. A plain transport passes through unchanged.
    #[must_use]
    pub fn unwrap_tls(self) -> Self {
        match self {
            Self::Plain(tcp) => Self::Plain(tcp),
            Self::Tls(tls) => {
                let (splice, _connection) = tls.into_inner();
                Self::Plain(splice.into_inner())
            }
        }
    }
}

impl std::fmt::Debug for TdsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("TdsTransport::Plain"),
            Self::Tls(_) => f.write_str("TdsTransport::Tls"),
        }
    }
}

#[async_trait]
impl Transport for TdsTransport {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf).await,
            Self::Tls(s) => s.read(buf).await,
        }
    }

    async fn send_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Plain(s) => {
                s.write_all(data).await?;
                s.flush().await
            }
            Self::Tls(s) => {
                s.write_all(data).await?;
                s.flush().await
            }
        }
    }
}
