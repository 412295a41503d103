//! # tidewire-stream
//!
//! The async transport layer of tidewire: packet framing over a byte
//! transport, the typed reader/writer that suspend only on transport
//! reads and writes, streaming value decode, the TLS splice used during
//! pre-login, the SMP multiplexer that realizes MARS, and the UDP
//! instance browser.
//!
//! Everything here is runtime-agnostic in spirit but tokio in practice:
//! suspension points are exactly the [`Transport`] calls.

pub mod browser;
pub mod decode;
pub mod error;
pub mod framer;
pub mod smp;
pub mod tls;
pub mod tokens;
pub mod transport;

pub use error::StreamError;
pub use framer::{LinkState, TdsLink};
pub use smp::{SmpManager, SmpStream};
pub use tls::{hostname_matches, splice_handshake, TlsSettings, TlsSpliceStream};
pub use tokens::ColumnMeta;
pub use transport::{IoTransport, TdsTransport, Transport};
