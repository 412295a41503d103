//! Response token definitions.
//!
//! A response is a concatenation of tokens, each led by a one-byte id.
//! The small self-contained tokens (DONE family, ENVCHANGE, INFO/ERROR,
//! LOGINACK) are parsed here from complete buffers; COLMETADATA, ROW,
//! NBCROW and RETURNVALUE contain column values that may span packets and
//! are parsed by the streaming layer.

use bitflags::bitflags;
use bytes::Buf;

use crate::codec::{read_b_varchar, read_us_varchar};
use crate::collation::Collation;
use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// Token identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenId {
    /// Stored-procedure return status.
    ReturnStatus = 0x79,
    /// Column metadata for a result set.
    ColMetaData = 0x81,
    /// Table name for text-pointer columns; skipped.
    TabName = 0xA4,
    /// Column info; skipped.
    ColInfo = 0xA5,
    /// ORDER BY columns; skipped.
    Order = 0xA9,
    /// Server error message.
    Error = 0xAA,
    /// Server informational message.
    Info = 0xAB,
    /// Output parameter value.
    ReturnValue = 0xAC,
    /// Login acknowledgment.
    LoginAck = 0xAD,
    /// A row of data.
    Row = 0xD1,
    /// A row with a null bitmap (TDS 7.3+).
    NbcRow = 0xD2,
    /// Environment change.
    EnvChange = 0xE3,
    /// SSPI challenge.
    Sspi = 0xED,
    /// Federated authentication info.
    FedAuthInfo = 0xEE,
    /// Statement completion.
    Done = 0xFD,
    /// Procedure completion.
    DoneProc = 0xFE,
    /// Completion of a statement within a procedure.
    DoneInProc = 0xFF,
}

impl TokenId {
    /// Decode a token id; unknown ids are stream corruption.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0x79 => Self::ReturnStatus,
            0x81 => Self::ColMetaData,
            0xA4 => Self::TabName,
            0xA5 => Self::ColInfo,
            0xA9 => Self::Order,
            0xAA => Self::Error,
            0xAB => Self::Info,
            0xAC => Self::ReturnValue,
            0xAD => Self::LoginAck,
            0xD1 => Self::Row,
            0xD2 => Self::NbcRow,
            0xE3 => Self::EnvChange,
            0xED => Self::Sspi,
            0xEE => Self::FedAuthInfo,
            0xFD => Self::Done,
            0xFE => Self::DoneProc,
            0xFF => Self::DoneInProc,
            other => return Err(ProtocolError::UnknownToken(other)),
        })
    }
}

bitflags! {
    /// DONE status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DoneStatus: u16 {
        /// More results follow in this response.
        const MORE = 0x0001;
        /// The statement raised an error.
        const ERROR = 0x0002;
        /// A transaction is in progress.
        const INXACT = 0x0004;
        /// The row count field is valid.
        const COUNT = 0x0010;
        /// Acknowledges an attention (cancel) request.
        const ATTENTION = 0x0020;
        /// A server error terminated the statement.
        const SRVERROR = 0x0100;
    }
}

/// A DONE, DONEPROC or DONEINPROC token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    /// Which of the three completion tokens this was.
    pub id: TokenId,
    /// Status flags.
    pub status: DoneStatus,
    /// The token of the current command, informational.
    pub cur_cmd: u16,
    /// Rows affected, valid when `COUNT` is set.
    pub row_count: u64,
}

impl Done {
    /// Parse the body following the token id. The row count is 32-bit
    /// before TDS 7.2 and 64-bit from there on.
    pub fn decode(
        id: TokenId,
        src: &mut impl Buf,
        version: TdsVersion,
    ) -> Result<Self, ProtocolError> {
        let fixed = if version.is_72_plus() { 12 } else { 8 };
        if src.remaining() < fixed {
            return Err(ProtocolError::UnexpectedEof("done token"));
        }
        let status = DoneStatus::from_bits_truncate(src.get_u16_le());
        let cur_cmd = src.get_u16_le();
        let row_count = if version.is_72_plus() {
            src.get_u64_le()
        } else {
            u64::from(src.get_u32_le())
        };
        Ok(Self {
            id,
            status,
            cur_cmd,
            row_count,
        })
    }

    /// More results follow this completion.
    #[must_use]
    pub fn more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// This completion acknowledges a cancel.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.status.contains(DoneStatus::ATTENTION)
    }
}

/// Server-instructed redirect from a routing ENVCHANGE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTarget {
    /// Host to reconnect to.
    pub host: String,
    /// TCP port on that host.
    pub port: u16,
}

/// A parsed ENVCHANGE token.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvChange {
    /// Current database changed.
    Database {
        /// New database name.
        new: String,
        /// Previous database name.
        old: String,
    },
    /// Session language changed.
    Language {
        /// New language.
        new: String,
    },
    /// Negotiated packet size changed; the framer must resize.
    PacketSize {
        /// New block size in bytes.
        size: u32,
    },
    /// Session collation changed.
    Collation {
        /// New collation, absent when the server sent an empty value.
        new: Option<Collation>,
    },
    /// A transaction began; the descriptor keys ALL_HEADERS.
    BeginTransaction {
        /// Server-assigned transaction descriptor.
        descriptor: u64,
    },
    /// The transaction committed.
    CommitTransaction,
    /// The transaction rolled back.
    RollbackTransaction,
    /// Database mirroring partner advertisement.
    MirrorPartner {
        /// Partner server name.
        server: String,
    },
    /// Server-instructed redirect; login must stop and reconnect.
    Routing(RoutingTarget),
    /// Environment ids this client has no use for.
    Other {
        /// Raw ENVCHANGE type byte.
        kind: u8,
    },
}

impl EnvChange {
    /// Parse an ENVCHANGE body (after its u16 length prefix).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 1 {
            return Err(ProtocolError::UnexpectedEof("envchange type"));
        }
        let kind = src.get_u8();
        match kind {
            1 => {
                let new = read_b_varchar(src)?;
                let old = read_b_varchar(src)?;
                Ok(Self::Database { new, old })
            }
            2 => {
                let new = read_b_varchar(src)?;
                let _old = read_b_varchar(src)?;
                Ok(Self::Language { new })
            }
            4 => {
                let new = read_b_varchar(src)?;
                let _old = read_b_varchar(src)?;
                let size = new
                    .parse::<u32>()
                    .map_err(|_| ProtocolError::UnexpectedEof("packet size digits"))?;
                Ok(Self::PacketSize { size })
            }
            7 => {
                let new = read_b_varbyte(src)?;
                let _old = read_b_varbyte(src)?;
                let collation = if new.len() >= 5 {
                    Some(Collation::decode(&mut new.as_slice())?)
                } else {
                    None
                };
                Ok(Self::Collation { new: collation })
            }
            8 => {
                let new = read_b_varbyte(src)?;
                let _old = read_b_varbyte(src)?;
                if new.len() < 8 {
                    return Err(ProtocolError::UnexpectedEof("transaction descriptor"));
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&new[..8]);
                Ok(Self::BeginTransaction {
                    descriptor: u64::from_le_bytes(raw),
                })
            }
            9 => {
                skip_b_varbyte(src)?;
                skip_b_varbyte(src)?;
                Ok(Self::CommitTransaction)
            }
            10 => {
                skip_b_varbyte(src)?;
                skip_b_varbyte(src)?;
                Ok(Self::RollbackTransaction)
            }
            13 => {
                let server = read_b_varchar(src)?;
                let _old = read_b_varchar(src)?;
                Ok(Self::MirrorPartner { server })
            }
            20 => {
                if src.remaining() < 2 {
                    return Err(ProtocolError::UnexpectedEof("routing length"));
                }
                let _value_len = src.get_u16_le();
                if src.remaining() < 3 {
                    return Err(ProtocolError::UnexpectedEof("routing body"));
                }
                let protocol = src.get_u8();
                if protocol != 0 {
                    return Err(ProtocolError::ValueOutOfRange("routing protocol"));
                }
                let port = src.get_u16_le();
                let host = read_us_varchar(src)?;
                Ok(Self::Routing(RoutingTarget { host, port }))
            }
            other => Ok(Self::Other { kind: other }),
        }
    }
}

fn read_b_varbyte(src: &mut impl Buf) -> Result<Vec<u8>, ProtocolError> {
    if src.remaining() < 1 {
        return Err(ProtocolError::UnexpectedEof("b_varbyte length"));
    }
    let len = src.get_u8() as usize;
    if src.remaining() < len {
        return Err(ProtocolError::UnexpectedEof("b_varbyte data"));
    }
    let mut data = vec![0u8; len];
    src.copy_to_slice(&mut data);
    Ok(data)
}

fn skip_b_varbyte(src: &mut impl Buf) -> Result<(), ProtocolError> {
    read_b_varbyte(src).map(|_| ())
}

/// A server message from an INFO or ERROR token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// True for ERROR tokens, false for INFO.
    pub is_error: bool,
    /// Message number.
    pub number: i32,
    /// Message state.
    pub state: u8,
    /// Severity class; 11+ are errors.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Reporting server name.
    pub server: String,
    /// Procedure the message originated in, if any.
    pub procedure: String,
    /// Line number within the batch or procedure.
    pub line: u32,
}

impl ServerMessage {
    /// Parse an INFO/ERROR body (after its u16 length prefix).
    pub fn decode(
        is_error: bool,
        src: &mut impl Buf,
        version: TdsVersion,
    ) -> Result<Self, ProtocolError> {
        if src.remaining() < 6 {
            return Err(ProtocolError::UnexpectedEof("server message header"));
        }
        let number = src.get_i32_le();
        let state = src.get_u8();
        let class = src.get_u8();
        let message = read_us_varchar(src)?;
        let server = read_b_varchar(src)?;
        let procedure = read_b_varchar(src)?;
        let line = if version.is_72_plus() {
            if src.remaining() < 4 {
                return Err(ProtocolError::UnexpectedEof("message line"));
            }
            src.get_u32_le()
        } else {
            if src.remaining() < 2 {
                return Err(ProtocolError::UnexpectedEof("message line"));
            }
            u32::from(src.get_u16_le())
        };
        Ok(Self {
            is_error,
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }
}

/// A LOGINACK token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Interface byte; 1 means T-SQL.
    pub interface: u8,
    /// Server-chosen TDS version, mapped through the interop table.
    pub tds_version: Option<TdsVersion>,
    /// Server product name.
    pub prog_name: String,
    /// Product version as (major, minor, build).
    pub prog_version: (u8, u8, u16),
}

impl LoginAck {
    /// Parse a LOGINACK body (after its u16 length prefix).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 5 {
            return Err(ProtocolError::UnexpectedEof("loginack"));
        }
        let interface = src.get_u8();
        let raw_version = src.get_u32();
        let prog_name = read_b_varchar(src)?;
        if src.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof("loginack version"));
        }
        let major = src.get_u8();
        let minor = src.get_u8();
        let build = src.get_u16();
        Ok(Self {
            interface,
            tds_version: TdsVersion::from_login_ack(raw_version),
            prog_name,
            prog_version: (major, minor, build),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn done_rowcount_width_depends_on_version() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(DoneStatus::COUNT.bits());
        buf.put_u16_le(0xC1);
        buf.put_u32_le(42);

        let done = Done::decode(TokenId::Done, &mut buf.freeze(), TdsVersion::V7_1).unwrap();
        assert_eq!(done.row_count, 42);
        assert!(!done.more());

        let mut buf = BytesMut::new();
        buf.put_u16_le((DoneStatus::COUNT | DoneStatus::MORE).bits());
        buf.put_u16_le(0xC1);
        buf.put_u64_le(7);

        let done = Done::decode(TokenId::Done, &mut buf.freeze(), TdsVersion::V7_2).unwrap();
        assert_eq!(done.row_count, 7);
        assert!(done.more());
    }

    #[test]
    fn cancelled_flag() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(DoneStatus::ATTENTION.bits());
        buf.put_u16_le(0);
        buf.put_u64_le(0);
        let done = Done::decode(TokenId::Done, &mut buf.freeze(), TdsVersion::V7_4).unwrap();
        assert!(done.cancelled());
    }

    #[test]
    fn envchange_database() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        crate::codec::write_b_varchar(&mut buf, "tempdb");
        crate::codec::write_b_varchar(&mut buf, "master");

        let env = EnvChange::decode(&mut buf.freeze()).unwrap();
        assert_eq!(
            env,
            EnvChange::Database {
                new: "tempdb".into(),
                old: "master".into()
            }
        );
    }

    #[test]
    fn envchange_packet_size_parses_digits() {
        let mut buf = BytesMut::new();
        buf.put_u8(4);
        crate::codec::write_b_varchar(&mut buf, "8192");
        crate::codec::write_b_varchar(&mut buf, "4096");

        let env = EnvChange::decode(&mut buf.freeze()).unwrap();
        assert_eq!(env, EnvChange::PacketSize { size: 8192 });
    }

    #[test]
    fn envchange_collation() {
        let mut buf = BytesMut::new();
        buf.put_u8(7);
        buf.put_u8(5);
        Collation::new(1033, 52).encode(&mut buf);
        buf.put_u8(0);

        let env = EnvChange::decode(&mut buf.freeze()).unwrap();
        assert_eq!(
            env,
            EnvChange::Collation {
                new: Some(Collation::new(1033, 52))
            }
        );
    }

    #[test]
    fn envchange_routing() {
        let mut buf = BytesMut::new();
        buf.put_u8(20);
        let host = "replica.example.com";
        buf.put_u16_le((1 + 2 + 2 + host.len() * 2) as u16);
        buf.put_u8(0); // tcp
        buf.put_u16_le(14330);
        crate::codec::write_us_varchar(&mut buf, host);

        let env = EnvChange::decode(&mut buf.freeze()).unwrap();
        assert_eq!(
            env,
            EnvChange::Routing(RoutingTarget {
                host: host.into(),
                port: 14330
            })
        );
    }

    #[test]
    fn envchange_begin_transaction_descriptor() {
        let mut buf = BytesMut::new();
        buf.put_u8(8);
        buf.put_u8(8);
        buf.put_u64_le(0x0102_0304_0506_0708);
        buf.put_u8(0);

        let env = EnvChange::decode(&mut buf.freeze()).unwrap();
        assert_eq!(
            env,
            EnvChange::BeginTransaction {
                descriptor: 0x0102_0304_0506_0708
            }
        );
    }

    #[test]
    fn server_message_line_width() {
        let mut body = BytesMut::new();
        body.put_i32_le(208);
        body.put_u8(1);
        body.put_u8(16);
        crate::codec::write_us_varchar(&mut body, "Invalid object name 'x'.");
        crate::codec::write_b_varchar(&mut body, "srv");
        crate::codec::write_b_varchar(&mut body, "");
        body.put_u32_le(3);

        let msg = ServerMessage::decode(true, &mut body.freeze(), TdsVersion::V7_4).unwrap();
        assert_eq!(msg.number, 208);
        assert_eq!(msg.class, 16);
        assert_eq!(msg.line, 3);
        assert!(msg.is_error);
    }

    #[test]
    fn loginack_maps_version() {
        let mut body = BytesMut::new();
        body.put_u8(1);
        body.put_u32(0x7400_0004);
        crate::codec::write_b_varchar(&mut body, "Microsoft SQL Server");
        body.put_u8(12);
        body.put_u8(0);
        body.put_u16(2000);

        let ack = LoginAck::decode(&mut body.freeze()).unwrap();
        assert_eq!(ack.tds_version, Some(TdsVersion::V7_4));
        assert_eq!(ack.prog_name, "Microsoft SQL Server");
        assert_eq!(ack.prog_version, (12, 0, 2000));
    }
}
