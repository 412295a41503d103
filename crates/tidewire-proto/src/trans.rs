//! Transaction-manager request encoding (TDS 7.2+).
//!
//! Below 7.2 transaction control travels as plain SQL; from 7.2 a TRANS
//! packet carries the request: ALL_HEADERS, a TM command code, and the
//! command-specific body.

use bytes::{BufMut, Bytes, BytesMut};

use crate::batch::write_all_headers;

/// Transaction-manager command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TmCommand {
    /// Begin a transaction.
    Begin = 5,
    /// Promote to a distributed transaction.
    Promote = 6,
    /// Commit.
    Commit = 7,
    /// Roll back.
    Rollback = 8,
    /// Create a savepoint.
    Save = 9,
}

/// Isolation levels for BEGIN TRANSACTION.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum IsolationLevel {
    /// Server default (read committed).
    #[default]
    Default = 0x00,
    /// READ UNCOMMITTED.
    ReadUncommitted = 0x01,
    /// READ COMMITTED.
    ReadCommitted = 0x02,
    /// REPEATABLE READ.
    RepeatableRead = 0x03,
    /// SERIALIZABLE.
    Serializable = 0x04,
    /// SNAPSHOT.
    Snapshot = 0x05,
}

/// Encode a BEGIN transaction request.
#[must_use]
pub fn encode_begin(transaction_descriptor: u64, isolation: IsolationLevel) -> Bytes {
    let mut buf = BytesMut::new();
    write_all_headers(&mut buf, transaction_descriptor, 1);
    buf.put_u16_le(TmCommand::Begin as u16);
    buf.put_u8(isolation as u8);
    buf.put_u8(0); // no transaction name
    buf.freeze()
}

/// Encode a COMMIT request.
#[must_use]
pub fn encode_commit(transaction_descriptor: u64) -> Bytes {
    let mut buf = BytesMut::new();
    write_all_headers(&mut buf, transaction_descriptor, 1);
    buf.put_u16_le(TmCommand::Commit as u16);
    buf.put_u8(0); // no transaction name
    buf.put_u8(0); // no begin piggybacked on the commit
    buf.freeze()
}

/// Encode a ROLLBACK request.
#[must_use]
pub fn encode_rollback(transaction_descriptor: u64) -> Bytes {
    let mut buf = BytesMut::new();
    write_all_headers(&mut buf, transaction_descriptor, 1);
    buf.put_u16_le(TmCommand::Rollback as u16);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.freeze()
}

/// Encode a SAVE TRANSACTION request.
#[must_use]
pub fn encode_savepoint(transaction_descriptor: u64, name: &str) -> Bytes {
    let mut buf = BytesMut::new();
    write_all_headers(&mut buf, transaction_descriptor, 1);
    buf.put_u16_le(TmCommand::Save as u16);
    crate::codec::write_b_varchar(&mut buf, name);
    buf.freeze()
}
