//! Transport-layer error type.

use thiserror::Error;
use tidewire_proto::ProtocolError;

/// Errors surfaced by the framing, TLS, SMP and browser layers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StreamError {
    /// The byte stream violated the protocol grammar.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// A read blocked past the configured query timeout. The session
    /// answers this with a CANCEL and drains to the acknowledging DONE.
    #[error("read timed out")]
    ReadTimeout,

    /// An operation was attempted in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// TLS setup or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// The SMP manager observed an illegal frame and is dead.
    #[error("smp stream corrupted: {0}")]
    SmpCorrupt(&'static str),

    /// The SMP session is closed.
    #[error("smp session closed")]
    SmpClosed,

    /// The instance browser reply could not be parsed.
    #[error("malformed browser reply")]
    BrowserFormat,

    /// The instance browser does not know the requested instance.
    #[error("instance {0:?} not found on server")]
    InstanceNotFound(String),

    /// The instance browser did not answer in time.
    #[error("timed out waiting for the instance browser")]
    BrowserTimeout,
}
