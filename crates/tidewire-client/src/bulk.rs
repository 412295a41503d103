//! Bulk insert.
//!
//! A bulk load is an `INSERT BULK` statement followed by a BULK packet
//! whose payload is a raw token stream: one COLMETADATA describing the
//! columns, a ROW token per row, and a closing DONE. MAX-typed cells are
//! written in the PLP unknown-length chunked form even when their length
//! is known; some server versions end the message prematurely otherwise.

use bytes::{BufMut, BytesMut};
use tidewire_proto::codec::write_b_varchar;
use tidewire_proto::encode::{encode_plp_value, encode_value};
use tidewire_proto::packet::PacketKind;
use tidewire_proto::token::TokenId;
use tidewire_proto::typeinfo::TypeInfo;
use tidewire_proto::value::Value;
use tidewire_stream::Transport;

use crate::error::{Error, Result};
use crate::session::Session;

/// One column of a bulk load.
#[derive(Debug, Clone)]
pub struct BulkColumn {
    /// Destination column name.
    pub name: String,
    /// Declared wire type.
    pub info: TypeInfo,
}

impl BulkColumn {
    /// Declare a bulk column.
    #[must_use]
    pub fn new(name: impl Into<String>, info: TypeInfo) -> Self {
        Self {
            name: name.into(),
            info,
        }
    }
}

impl<T: Transport> Session<T> {
    /// Bulk-insert rows into `table`. Returns the server's row count.
    pub async fn submit_bulk(
        &mut self,
        table: &str,
        columns: &[BulkColumn],
        rows: &[Vec<Value>],
    ) -> Result<u64> {
        // The INSERT BULK statement opens the bulk context.
        let column_list = columns
            .iter()
            .map(|c| format!("[{}] {}", c.name, c.info.declaration()))
            .collect::<Vec<_>>()
            .join(", ");
        self.submit_plain_query(&format!("INSERT BULK {table} ({column_list})"))
            .await?;
        self.drain_response().await?;

        self.require_idle()?;
        self.start_request();
        let payload = encode_bulk_payload(columns, rows, self.version.is_72_plus())
            .map_err(|e| Error::Data(e.to_string()))?;
        self.send_request(PacketKind::Bulk, &payload).await?;
        self.drain_response().await?;
        Ok(self.rows_affected)
    }
}

fn encode_bulk_payload(
    columns: &[BulkColumn],
    rows: &[Vec<Value>],
    wide_counts: bool,
) -> std::result::Result<BytesMut, tidewire_proto::ProtocolError> {
    let mut buf = BytesMut::new();

    buf.put_u8(TokenId::ColMetaData as u8);
    buf.put_u16_le(columns.len() as u16);
    for column in columns {
        buf.put_u32_le(0); // user type
        buf.put_u16_le(0x0009); // nullable, writable
        column.info.encode(&mut buf);
        write_b_varchar(&mut buf, &column.name);
    }

    for row in rows {
        if row.len() != columns.len() {
            return Err(tidewire_proto::ProtocolError::ValueOutOfRange("bulk row width"));
        }
        buf.put_u8(TokenId::Row as u8);
        for (column, cell) in columns.iter().zip(row) {
            match &column.info {
                TypeInfo::Plp { id, collation } => {
                    // Unknown-length PLP even for known lengths.
                    encode_plp_value(&mut buf, *id, *collation, cell, true)?;
                }
                info => encode_value(&mut buf, info, cell)?,
            }
        }
    }

    buf.put_u8(TokenId::Done as u8);
    buf.put_u16_le(0); // status: final
    buf.put_u16_le(0); // cur_cmd
    if wide_counts {
        buf.put_u64_le(0);
    } else {
        buf.put_u32_le(0);
    }
    Ok(buf)
}
