//! Table-valued parameter encoding (TDS 7.3+).
//!
//! A TVP travels as an RPC parameter: the type name as three length-prefixed
//! UCS-2 strings (database, schema, type), the column metadata list closed
//! by an end token, then a row stream where each row is a 0x01 marker byte
//! followed by the cell values, closed by a 0x00 end token. A null TVP
//! replaces the column count with 0xFFFF.

use bytes::{BufMut, BytesMut};

use crate::codec::write_b_varchar;
use crate::encode::encode_value;
use crate::error::ProtocolError;
use crate::typeinfo::{TypeId, TypeInfo};
use crate::value::Value;

/// TVP row marker byte.
const TVP_ROW: u8 = 0x01;

/// Terminates the column metadata list and the row stream.
const TVP_END: u8 = 0x00;

/// Null marker in place of the column count.
const TVP_NULL: u16 = 0xFFFF;

/// One column of a table type.
#[derive(Debug, Clone)]
pub struct TvpColumn {
    /// Column name; empty names are accepted by the server for TVPs.
    pub name: String,
    /// Declared wire type of the column.
    pub info: TypeInfo,
}

/// A table-valued parameter value.
#[derive(Debug, Clone)]
pub struct Tvp {
    /// Database part of the type name, usually empty.
    pub db_name: String,
    /// Schema part of the type name.
    pub schema_name: String,
    /// The table type's name.
    pub type_name: String,
    /// Column declarations.
    pub columns: Vec<TvpColumn>,
    /// Rows; `None` encodes a NULL TVP.
    pub rows: Option<Vec<Vec<Value>>>,
}

impl Tvp {
    /// Create a TVP for a table type.
    #[must_use]
    pub fn new(schema_name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            db_name: String::new(),
            schema_name: schema_name.into(),
            type_name: type_name.into(),
            columns: Vec::new(),
            rows: Some(Vec::new()),
        }
    }

    /// Append a column declaration.
    #[must_use]
    pub fn with_column(mut self, name: impl Into<String>, info: TypeInfo) -> Self {
        self.columns.push(TvpColumn {
            name: name.into(),
            info,
        });
        self
    }

    /// Append a row. The cell count must match the column count.
    pub fn push_row(&mut self, row: Vec<Value>) {
        if let Some(rows) = &mut self.rows {
            rows.push(row);
        }
    }

    /// Encode the full parameter: TVP type info plus the value.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.put_u8(TypeId::Tvp as u8);
        write_b_varchar(dst, &self.db_name);
        write_b_varchar(dst, &self.schema_name);
        write_b_varchar(dst, &self.type_name);

        let Some(rows) = &self.rows else {
            dst.put_u16_le(TVP_NULL);
            dst.put_u8(TVP_END);
            dst.put_u8(TVP_END);
            return Ok(());
        };

        dst.put_u16_le(self.columns.len() as u16);
        for column in &self.columns {
            dst.put_u32_le(0); // user type
            dst.put_u16_le(0x0001); // flags: nullable
            column.info.encode(dst);
            write_b_varchar(dst, &column.name);
        }
        dst.put_u8(TVP_END);

        for row in rows {
            if row.len() != self.columns.len() {
                return Err(ProtocolError::ValueOutOfRange("tvp row width"));
            }
            dst.put_u8(TVP_ROW);
            for (column, cell) in self.columns.iter().zip(row) {
                encode_value(dst, &column.info, cell)?;
            }
        }
        dst.put_u8(TVP_END);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn int_column() -> TypeInfo {
        TypeInfo::ByteLen {
            id: TypeId::IntN,
            size: 4,
        }
    }

    #[test]
    fn null_tvp_uses_ffff_marker() {
        let mut tvp = Tvp::new("dbo", "IntList").with_column("n", int_column());
        tvp.rows = None;

        let mut buf = BytesMut::new();
        tvp.encode(&mut buf).unwrap();

        assert_eq!(buf[0], TypeId::Tvp as u8);
        // db (empty), schema "dbo", type "IntList" precede the marker.
        let name_section = 1 + 1 + (1 + 6) + (1 + 14);
        assert_eq!(
            &buf[name_section..name_section + 2],
            &TVP_NULL.to_le_bytes()
        );
    }

    #[test]
    fn rows_are_marked_and_terminated() {
        let mut tvp = Tvp::new("dbo", "IntList").with_column("n", int_column());
        tvp.push_row(vec![Value::I32(1)]);
        tvp.push_row(vec![Value::I32(2)]);

        let mut buf = BytesMut::new();
        tvp.encode(&mut buf).unwrap();

        // Stream ends with the end token; two row markers inside.
        assert_eq!(buf[buf.len() - 1], TVP_END);
        let markers = buf.iter().filter(|&&b| b == TVP_ROW).count();
        assert!(markers >= 2);
    }

    #[test]
    fn ragged_row_is_rejected() {
        let mut tvp = Tvp::new("dbo", "IntList").with_column("n", int_column());
        tvp.push_row(vec![Value::I32(1), Value::I32(2)]);

        let mut buf = BytesMut::new();
        assert!(tvp.encode(&mut buf).is_err());
    }
}
