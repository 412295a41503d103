//! Streaming token readers.
//!
//! The small self-contained tokens are read as a length-prefixed body and
//! handed to `tidewire_proto::token` for parsing; COLMETADATA, ROW, NBCROW
//! and RETURNVALUE embed column values and type info that may span packet
//! boundaries, so they are read incrementally here.

use bytes::Bytes;
use tidewire_proto::collation::Collation;
use tidewire_proto::token::{Done, EnvChange, LoginAck, ServerMessage, TokenId};
use tidewire_proto::typeinfo::{CharWidth, TypeId, TypeInfo};
use tidewire_proto::value::Value;
use tidewire_proto::version::TdsVersion;
use tidewire_proto::ProtocolError;

use crate::decode::decode_value;
use crate::error::StreamError;
use crate::framer::TdsLink;
use crate::transport::Transport;

/// One column of a result-set descriptor.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    /// Column name.
    pub name: String,
    /// User type id from the metadata.
    pub user_type: u32,
    /// Column flags (nullable, identity, ...).
    pub flags: u16,
    /// Parsed type info; fixed for the lifetime of the result set.
    pub info: TypeInfo,
}

/// Read the next token id. Unknown ids are stream corruption.
pub async fn read_token_id<T: Transport>(link: &mut TdsLink<T>) -> Result<TokenId, StreamError> {
    let raw = link.read_u8().await?;
    Ok(TokenId::from_u8(raw)?)
}

/// Read a TYPE_INFO from the response stream.
///
/// This is the streaming mirror of `TypeInfo::decode`; the registry and
/// version gates are identical.
pub async fn read_type_info<T: Transport>(
    link: &mut TdsLink<T>,
    version: TdsVersion,
) -> Result<TypeInfo, StreamError> {
    let code = link.read_u8().await?;
    let id = TypeId::from_u8(code)
        .ok_or(StreamError::Protocol(ProtocolError::UnknownType { code, version }))?;
    if version < id.introduced_in() {
        return Err(StreamError::Protocol(ProtocolError::UnknownType {
            code,
            version,
        }));
    }

    let info = match id {
        TypeId::Null
        | TypeId::Int1
        | TypeId::Bit
        | TypeId::Int2
        | TypeId::Int4
        | TypeId::DateTime4
        | TypeId::Float4
        | TypeId::Money8
        | TypeId::DateTime
        | TypeId::Float8
        | TypeId::Money4
        | TypeId::Int8 => TypeInfo::FixedLen(id),

        TypeId::Guid
        | TypeId::IntN
        | TypeId::BitN
        | TypeId::FloatN
        | TypeId::MoneyN
        | TypeId::DateTimeN
        | TypeId::VarBinaryLegacy
        | TypeId::BinaryLegacy => {
            let size = link.read_u8().await?;
            TypeInfo::ByteLen { id, size }
        }

        TypeId::DecimalN | TypeId::NumericN => {
            let size = link.read_u8().await?;
            let precision = link.read_u8().await?;
            let scale = link.read_u8().await?;
            TypeInfo::Decimal {
                id,
                size,
                precision,
                scale,
            }
        }

        TypeId::DateN => TypeInfo::Date,

        TypeId::TimeN | TypeId::DateTime2N | TypeId::DateTimeOffsetN => {
            let scale = link.read_u8().await?;
            TypeInfo::Scaled { id, scale }
        }

        TypeId::VarCharLegacy | TypeId::CharLegacy => {
            let size = link.read_u8().await?;
            TypeInfo::ByteLenString {
                id,
                size,
                collation: Collation::RAW,
            }
        }

        TypeId::BigVarChar | TypeId::BigChar | TypeId::NVarChar | TypeId::NChar => {
            let size = link.read_u16().await?;
            let collation = if version.is_71_plus() {
                read_collation(link).await?
            } else {
                Collation::RAW
            };
            let width = match id {
                TypeId::NVarChar | TypeId::NChar => CharWidth::Wide,
                _ => CharWidth::Narrow,
            };
            if size == 0xFFFF {
                if !version.is_72_plus() {
                    return Err(StreamError::Protocol(ProtocolError::UnknownType {
                        code,
                        version,
                    }));
                }
                TypeInfo::Plp { id, collation }
            } else {
                TypeInfo::UShortString {
                    id,
                    size,
                    collation,
                    width,
                }
            }
        }

        TypeId::BigVarBinary | TypeId::BigBinary => {
            let size = link.read_u16().await?;
            if size == 0xFFFF {
                if !version.is_72_plus() {
                    return Err(StreamError::Protocol(ProtocolError::UnknownType {
                        code,
                        version,
                    }));
                }
                TypeInfo::Plp {
                    id,
                    collation: Collation::RAW,
                }
            } else {
                TypeInfo::UShortBinary { id, size }
            }
        }

        TypeId::Text | TypeId::NText | TypeId::Image => {
            let size = link.read_u32().await?;
            let collation = if id != TypeId::Image && version.is_71_plus() {
                read_collation(link).await?
            } else {
                Collation::RAW
            };
            TypeInfo::LongLen {
                id,
                size,
                collation,
            }
        }

        TypeId::Variant => {
            let size = link.read_u32().await?;
            TypeInfo::Variant { size }
        }

        TypeId::Xml => {
            let schema_present = link.read_u8().await?;
            if schema_present != 0 {
                let db_chars = link.read_u8().await? as usize;
                link.read_ucs2(db_chars).await?;
                let owner_chars = link.read_u8().await? as usize;
                link.read_ucs2(owner_chars).await?;
                let collection_chars = link.read_u16().await? as usize;
                link.read_ucs2(collection_chars).await?;
            }
            TypeInfo::Xml
        }

        TypeId::Udt => {
            let size = link.read_u16().await?;
            let db_name = read_b_varchar(link).await?;
            let schema_name = read_b_varchar(link).await?;
            let type_name = read_b_varchar(link).await?;
            let assembly_name = read_us_varchar(link).await?;
            TypeInfo::Udt {
                size,
                db_name,
                schema_name,
                type_name,
                assembly_name,
            }
        }

        TypeId::Tvp => {
            return Err(StreamError::Protocol(ProtocolError::UnknownType {
                code,
                version,
            }));
        }
    };
    Ok(info)
}

async fn read_collation<T: Transport>(link: &mut TdsLink<T>) -> Result<Collation, StreamError> {
    let raw = link.read_bytes(5).await?;
    Ok(Collation::decode(&mut &raw[..])?)
}

async fn read_b_varchar<T: Transport>(link: &mut TdsLink<T>) -> Result<String, StreamError> {
    let chars = link.read_u8().await? as usize;
    link.read_ucs2(chars).await
}

async fn read_us_varchar<T: Transport>(link: &mut TdsLink<T>) -> Result<String, StreamError> {
    let chars = link.read_u16().await? as usize;
    link.read_ucs2(chars).await
}

/// Read a COLMETADATA token body into a column list.
///
/// An 0xFFFF count means "no metadata" and yields an empty list.
pub async fn read_colmetadata<T: Transport>(
    link: &mut TdsLink<T>,
    version: TdsVersion,
) -> Result<Vec<ColumnMeta>, StreamError> {
    let count = link.read_u16().await?;
    if count == 0xFFFF {
        return Ok(Vec::new());
    }

    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let user_type = if version.is_72_plus() {
            link.read_u32().await?
        } else {
            u32::from(link.read_u16().await?)
        };
        let flags = link.read_u16().await?;
        let info = read_type_info(link, version).await?;

        // TEXT/NTEXT/IMAGE columns carry their source table name here.
        if matches!(
            info,
            TypeInfo::LongLen { .. }
        ) {
            if version.is_72_plus() {
                let parts = link.read_u8().await?;
                for _ in 0..parts {
                    read_us_varchar(link).await?;
                }
            } else {
                read_us_varchar(link).await?;
            }
        }

        let name = read_b_varchar(link).await?;
        columns.push(ColumnMeta {
            name,
            user_type,
            flags,
            info,
        });
    }
    Ok(columns)
}

/// Read a ROW token body: one value per column.
pub async fn read_row<T: Transport>(
    link: &mut TdsLink<T>,
    columns: &[ColumnMeta],
) -> Result<Vec<Value>, StreamError> {
    let mut row = Vec::with_capacity(columns.len());
    for column in columns {
        row.push(decode_value(link, &column.info).await?);
    }
    Ok(row)
}

/// Read an NBCROW token body: null bitmap, then the non-null values.
pub async fn read_nbcrow<T: Transport>(
    link: &mut TdsLink<T>,
    columns: &[ColumnMeta],
) -> Result<Vec<Value>, StreamError> {
    let bitmap = link.read_bytes(columns.len().div_ceil(8)).await?;
    let mut row = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let is_null = bitmap[i / 8] & (1 << (i % 8)) != 0;
        if is_null {
            row.push(Value::Null);
        } else {
            row.push(decode_value(link, &column.info).await?);
        }
    }
    Ok(row)
}

/// A decoded RETURNVALUE token.
#[derive(Debug, Clone)]
pub struct ReturnValue {
    /// Parameter ordinal; unreliable before TDS 7.2.
    pub ordinal: u16,
    /// Parameter name including the `@`.
    pub name: String,
    /// Status byte.
    pub status: u8,
    /// Type info of the returned value.
    pub info: TypeInfo,
    /// The value itself.
    pub value: Value,
}

/// Read a RETURNVALUE token body.
pub async fn read_return_value<T: Transport>(
    link: &mut TdsLink<T>,
    version: TdsVersion,
) -> Result<ReturnValue, StreamError> {
    let ordinal = link.read_u16().await?;
    let name = read_b_varchar(link).await?;
    let status = link.read_u8().await?;
    let _user_type = if version.is_72_plus() {
        link.read_u32().await?
    } else {
        u32::from(link.read_u16().await?)
    };
    let _flags = link.read_u16().await?;
    let info = read_type_info(link, version).await?;
    let value = decode_value(link, &info).await?;
    Ok(ReturnValue {
        ordinal,
        name,
        status,
        info,
        value,
    })
}

/// Read a DONE/DONEPROC/DONEINPROC body.
pub async fn read_done<T: Transport>(
    link: &mut TdsLink<T>,
    id: TokenId,
    version: TdsVersion,
) -> Result<Done, StreamError> {
    let len = if version.is_72_plus() { 12 } else { 8 };
    let body = link.read_bytes(len).await?;
    Ok(Done::decode(id, &mut &body[..], version)?)
}

/// Read an ENVCHANGE token.
pub async fn read_env_change<T: Transport>(
    link: &mut TdsLink<T>,
) -> Result<EnvChange, StreamError> {
    let body = read_length_prefixed(link).await?;
    Ok(EnvChange::decode(&mut &body[..])?)
}

/// Read an INFO or ERROR token.
pub async fn read_server_message<T: Transport>(
    link: &mut TdsLink<T>,
    is_error: bool,
    version: TdsVersion,
) -> Result<ServerMessage, StreamError> {
    let body = read_length_prefixed(link).await?;
    Ok(ServerMessage::decode(is_error, &mut &body[..], version)?)
}

/// Read a LOGINACK token.
pub async fn read_login_ack<T: Transport>(link: &mut TdsLink<T>) -> Result<LoginAck, StreamError> {
    let body = read_length_prefixed(link).await?;
    Ok(LoginAck::decode(&mut &body[..])?)
}

/// Read an SSPI challenge token.
pub async fn read_sspi<T: Transport>(link: &mut TdsLink<T>) -> Result<Bytes, StreamError> {
    read_length_prefixed(link).await
}

/// Skip a token whose body is a u16 byte count (ORDER, TABNAME, COLINFO).
pub async fn skip_length_prefixed<T: Transport>(link: &mut TdsLink<T>) -> Result<(), StreamError> {
    let len = link.read_u16().await? as usize;
    link.read_bytes(len).await?;
    Ok(())
}

async fn read_length_prefixed<T: Transport>(link: &mut TdsLink<T>) -> Result<Bytes, StreamError> {
    let len = link.read_u16().await? as usize;
    link.read_bytes(len).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::IoTransport;
    use bytes::{BufMut, BytesMut};
    use tidewire_proto::packet::PacketKind;
    use tokio::io::AsyncWriteExt;

    async fn link_over(payload: &[u8]) -> TdsLink<IoTransport<tokio::io::DuplexStream>> {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let mut out = Vec::new();
        out.push(PacketKind::Reply as u8);
        out.push(1);
        out.extend_from_slice(&((payload.len() + 8) as u16).to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.push(1);
        out.push(0);
        out.extend_from_slice(payload);
        server.write_all(&out).await.unwrap();

        let mut link = TdsLink::new(IoTransport(client));
        link.begin_response().await.unwrap();
        link
    }

    fn int_col(name: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0); // user type
        buf.put_u16_le(0x0009); // flags: nullable
        buf.put_u8(TypeId::IntN as u8);
        buf.put_u8(4);
        tidewire_proto::codec::write_b_varchar(&mut buf, name);
        buf
    }

    #[tokio::test]
    async fn colmetadata_three_int_columns() {
        let mut payload = BytesMut::new();
        payload.put_u16_le(3);
        for name in ["a", "b", "c"] {
            payload.extend_from_slice(&int_col(name));
        }

        let mut link = link_over(&payload).await;
        let columns = read_colmetadata(&mut link, TdsVersion::V7_4).await.unwrap();
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].name, "a");
        assert_eq!(
            columns[1].info,
            TypeInfo::ByteLen {
                id: TypeId::IntN,
                size: 4
            }
        );
    }

    #[tokio::test]
    async fn nbcrow_with_second_column_null() {
        // Three int columns, bitmap 0b010 nulls the second.
        let mut payload = BytesMut::new();
        payload.put_u8(0b010);
        payload.put_u8(4);
        payload.put_i32_le(10);
        payload.put_u8(4);
        payload.put_i32_le(30);

        let columns: Vec<ColumnMeta> = (0..3)
            .map(|i| ColumnMeta {
                name: format!("c{i}"),
                user_type: 0,
                flags: 0,
                info: TypeInfo::ByteLen {
                    id: TypeId::IntN,
                    size: 4,
                },
            })
            .collect();

        let mut link = link_over(&payload).await;
        let row = read_nbcrow(&mut link, &columns).await.unwrap();
        assert_eq!(row, vec![Value::I32(10), Value::Null, Value::I32(30)]);
    }

    #[tokio::test]
    async fn return_value_roundtrip() {
        let mut payload = BytesMut::new();
        payload.put_u16_le(1); // ordinal
        tidewire_proto::codec::write_b_varchar(&mut payload, "@A");
        payload.put_u8(0x01); // status
        payload.put_u32_le(0); // user type
        payload.put_u16_le(0); // flags
        payload.put_u8(TypeId::IntN as u8);
        payload.put_u8(4);
        payload.put_u8(4);
        payload.put_i32_le(3);

        let mut link = link_over(&payload).await;
        let rv = read_return_value(&mut link, TdsVersion::V7_4).await.unwrap();
        assert_eq!(rv.ordinal, 1);
        assert_eq!(rv.name, "@A");
        assert_eq!(rv.value, Value::I32(3));
    }

    #[tokio::test]
    async fn unknown_token_id_is_corruption() {
        let mut link = link_over(&[0x42]).await;
        assert!(read_token_id(&mut link).await.is_err());
    }
}
