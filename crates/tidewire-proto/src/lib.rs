//! # tidewire-proto
//!
//! Wire-level implementation of the MS-TDS (Tabular Data Stream) protocol
//! spoken by Microsoft SQL Server, versions 7.0 through 7.4.
//!
//! This crate is intentionally IO-agnostic: everything here encodes into and
//! decodes out of [`bytes`] buffers. It contains no sockets and no async
//! runtime assumptions. The `tidewire-stream` crate layers packet framing and
//! streaming decode on top; `tidewire-client` drives sessions.
//!
//! The protocol surface covered here:
//!
//! - packet headers and packet kinds ([`packet`])
//! - TDS version negotiation values ([`version`])
//! - collations and their character encodings ([`collation`])
//! - the PRELOGIN option codec and encryption negotiation ([`prelogin`])
//! - LOGIN7 construction including password obfuscation ([`login7`])
//! - the response token data model ([`token`])
//! - column type descriptors and the version-gated type registry
//!   ([`typeinfo`])
//! - host values and their encodings ([`value`], [`encode`])
//! - RPC, SQL batch, transaction-manager and TVP payload builders
//!   ([`rpc`], [`batch`], [`trans`], [`tvp`])
//! - the SMP (MARS) frame codec ([`smp`])

pub mod batch;
pub mod codec;
pub mod collation;
pub mod encode;
pub mod error;
pub mod login7;
pub mod packet;
pub mod prelogin;
pub mod rpc;
pub mod smp;
pub mod token;
pub mod trans;
pub mod tvp;
pub mod typeinfo;
pub mod value;
pub mod version;

pub use collation::Collation;
pub use error::ProtocolError;
pub use packet::{PacketHeader, PacketKind, PacketStatus, DEFAULT_BLOCK_SIZE, PACKET_HEADER_LEN};
pub use prelogin::{negotiate_encryption, EncryptionLevel, NegotiatedEncryption, PreLogin};
pub use token::{
    Done, DoneStatus, EnvChange, LoginAck, RoutingTarget, ServerMessage, TokenId,
};
pub use typeinfo::{TypeInfo, TypeId};
pub use value::Value;
pub use version::TdsVersion;
