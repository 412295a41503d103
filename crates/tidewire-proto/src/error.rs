//! Protocol-level error type.

use thiserror::Error;

/// Errors raised while encoding or decoding TDS wire structures.
///
/// These are always framing-level failures: the byte stream did not match
/// the protocol grammar, or a value cannot be represented in the negotiated
/// encoding. Higher layers treat them as fatal to the session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A packet kind byte outside the known set.
    #[error("invalid packet kind: 0x{0:02X}")]
    InvalidPacketKind(u8),

    /// A packet length smaller than its own header.
    #[error("invalid packet length: {0}")]
    InvalidPacketLength(u16),

    /// A token id outside the known set; the stream is corrupt.
    #[error("unknown token id: 0x{0:02X}")]
    UnknownToken(u8),

    /// A type code outside the registry for the negotiated TDS version.
    #[error("unknown type code 0x{code:02X} for {version}")]
    UnknownType {
        /// Raw wire type code.
        code: u8,
        /// Negotiated version the registry was keyed by.
        version: crate::version::TdsVersion,
    },

    /// A PRELOGIN option byte outside the known set.
    #[error("invalid prelogin option: 0x{0:02X}")]
    InvalidPreloginOption(u8),

    /// The buffer ended in the middle of a structure.
    #[error("unexpected end of buffer while decoding {0}")]
    UnexpectedEof(&'static str),

    /// UCS-2 data did not decode to valid text.
    #[error("invalid UCS-2 string data")]
    InvalidUcs2,

    /// An SMP frame violated the framing rules.
    #[error("SMP framing violation: {0}")]
    SmpViolation(&'static str),

    /// A value cannot be encoded into its declared type.
    #[error("value out of range for {0}")]
    ValueOutOfRange(&'static str),

    /// A variant payload used an inner type the dispatch table does not know.
    #[error("unsupported sql_variant inner type: 0x{0:02X}")]
    UnsupportedVariantType(u8),
}
