//! RPC request encoding.
//!
//! An RPC request names either a textual procedure or one of the
//! pre-registered internal procedure ids, followed by option flags and the
//! parameter list. Each parameter is (name, status flags, TYPE_INFO, value).

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::batch::write_all_headers;
use crate::codec::{write_b_varchar, write_us_varchar};
use crate::encode::encode_value;
use crate::error::ProtocolError;
use crate::typeinfo::TypeInfo;
use crate::value::Value;
use crate::version::TdsVersion;

/// Well-known internal procedure ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// sp_cursor
    Cursor = 1,
    /// sp_cursoropen
    CursorOpen = 2,
    /// sp_cursorprepare
    CursorPrepare = 3,
    /// sp_cursorexecute
    CursorExecute = 4,
    /// sp_cursorprepexec
    CursorPrepExec = 5,
    /// sp_cursorunprepare
    CursorUnprepare = 6,
    /// sp_cursorfetch
    CursorFetch = 7,
    /// sp_cursoroption
    CursorOption = 8,
    /// sp_cursorclose
    CursorClose = 9,
    /// sp_executesql
    ExecuteSql = 10,
    /// sp_prepare
    Prepare = 11,
    /// sp_execute
    Execute = 12,
    /// sp_prepexec
    PrepExec = 13,
    /// sp_prepexecrpc
    PrepExecRpc = 14,
    /// sp_unprepare
    Unprepare = 15,
}

/// The procedure an RPC request addresses.
#[derive(Debug, Clone)]
pub enum Procedure {
    /// Procedure by name.
    Name(String),
    /// Pre-registered internal procedure.
    Id(ProcId),
}

bitflags! {
    /// RPC option flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RpcOptions: u16 {
        /// Recompile the plan before running.
        const WITH_RECOMPILE = 0x01;
        /// Suppress metadata in the response.
        const NO_METADATA = 0x02;
        /// Reuse cached metadata.
        const REUSE_METADATA = 0x04;
    }
}

bitflags! {
    /// Per-parameter status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParamFlags: u8 {
        /// Parameter is by-ref: the server returns it in RETURNVALUE.
        const BY_REF = 0x01;
        /// Use the declared default instead of the value.
        const DEFAULT_VALUE = 0x02;
        /// Value is encrypted (unused here).
        const ENCRYPTED = 0x08;
    }
}

/// One RPC parameter.
#[derive(Debug, Clone)]
pub struct RpcParam {
    /// Parameter name including the `@`, or empty for positional.
    pub name: String,
    /// Status flags; `BY_REF` marks output parameters.
    pub flags: ParamFlags,
    /// Declared wire type.
    pub info: TypeInfo,
    /// The value; ignored by the server when `DEFAULT_VALUE` is set.
    pub value: Value,
}

impl RpcParam {
    /// An input parameter with an inferred type.
    #[must_use]
    pub fn input(name: impl Into<String>, value: Value, version: TdsVersion) -> Self {
        let info = value.infer_type(version);
        Self {
            name: name.into(),
            flags: ParamFlags::empty(),
            info,
            value,
        }
    }

    /// An output parameter carrying an initial value.
    #[must_use]
    pub fn output(name: impl Into<String>, value: Value, version: TdsVersion) -> Self {
        let info = value.infer_type(version);
        Self {
            name: name.into(),
            flags: ParamFlags::BY_REF,
            info,
            value,
        }
    }

    /// Whether the server will echo this parameter back.
    #[must_use]
    pub fn is_output(&self) -> bool {
        self.flags.contains(ParamFlags::BY_REF)
    }
}

/// RPC request payload builder.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// Target procedure.
    pub procedure: Procedure,
    /// Option flags.
    pub options: RpcOptions,
    /// Parameters in wire order.
    pub params: Vec<RpcParam>,
}

impl RpcRequest {
    /// Request against a named procedure.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            procedure: Procedure::Name(name.into()),
            options: RpcOptions::empty(),
            params: Vec::new(),
        }
    }

    /// Request against an internal procedure id.
    #[must_use]
    pub fn internal(id: ProcId) -> Self {
        Self {
            procedure: Procedure::Id(id),
            options: RpcOptions::empty(),
            params: Vec::new(),
        }
    }

    /// Append a parameter.
    #[must_use]
    pub fn with_param(mut self, param: RpcParam) -> Self {
        self.params.push(param);
        self
    }

    /// Encode into an RPC packet payload.
    pub fn encode(
        &self,
        version: TdsVersion,
        transaction_descriptor: u64,
    ) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        if version.is_72_plus() {
            write_all_headers(&mut buf, transaction_descriptor, 1);
        }

        match &self.procedure {
            Procedure::Name(name) => write_us_varchar(&mut buf, name),
            Procedure::Id(id) => {
                buf.put_u16_le(0xFFFF);
                buf.put_u16_le(*id as u16);
            }
        }
        buf.put_u16_le(self.options.bits());

        for param in &self.params {
            write_b_varchar(&mut buf, &param.name);
            buf.put_u8(param.flags.bits());
            param.info.encode(&mut buf);
            encode_value(&mut buf, &param.info, &param.value)?;
        }

        Ok(buf.freeze())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn internal_proc_uses_id_marker() {
        let req = RpcRequest::internal(ProcId::ExecuteSql);
        let payload = req.encode(TdsVersion::V7_1, 0).unwrap();
        // No ALL_HEADERS before 7.2; the 0xFFFF marker leads.
        assert_eq!(&payload[0..2], &0xFFFFu16.to_le_bytes());
        assert_eq!(&payload[2..4], &10u16.to_le_bytes());
        assert_eq!(&payload[4..6], &0u16.to_le_bytes());
    }

    #[test]
    fn named_proc_with_params() {
        let req = RpcRequest::named("P").with_param(RpcParam::output(
            "@A",
            Value::I32(1),
            TdsVersion::V7_4,
        ));
        let payload = req.encode(TdsVersion::V7_4, 0).unwrap();

        // ALL_HEADERS (22) + name length (2) + 'P' (2) + options (2)
        assert_eq!(&payload[22..24], &1u16.to_le_bytes());
        assert_eq!(payload[24], b'P');

        // Param name, 2 chars "@A".
        assert_eq!(payload[28], 2);
        // Status flags: BY_REF.
        assert_eq!(payload[33], 0x01);
    }

    #[test]
    fn input_param_infers_type() {
        let p = RpcParam::input("@P1", Value::I64(7), TdsVersion::V7_4);
        assert!(!p.is_output());
        assert_eq!(p.info.declaration(), "int");
    }
}
