//! Streaming value decode against a [`TypeInfo`].
//!
//! Column values may span packet boundaries, so the decode half of the
//! serializer registry reads from the framed link rather than a buffer.
//! The encodings mirror `tidewire_proto::encode` exactly.

use bytes::Bytes;
use chrono::{Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone};
use rust_decimal::Decimal;
use tidewire_proto::collation::Collation;
use tidewire_proto::encode::{time_width, DAYS_EPOCH_1900, PLP_NULL, PLP_UNKNOWN};
use tidewire_proto::typeinfo::{CharWidth, TypeId, TypeInfo};
use tidewire_proto::value::Value;
use tidewire_proto::ProtocolError;

use crate::error::StreamError;
use crate::framer::TdsLink;
use crate::transport::Transport;

/// Decode one column value described by `info`.
pub async fn decode_value<T: Transport>(
    link: &mut TdsLink<T>,
    info: &TypeInfo,
) -> Result<Value, StreamError> {
    match info {
        TypeInfo::FixedLen(id) => decode_fixed(link, *id).await,
        TypeInfo::ByteLen { id, .. } => decode_byte_len(link, *id).await,
        TypeInfo::Decimal { scale, .. } => decode_decimal(link, *scale).await,
        TypeInfo::Date => decode_date(link).await,
        TypeInfo::Scaled { id, scale } => decode_scaled(link, *id, *scale).await,
        TypeInfo::ByteLenString { collation, .. } => {
            let len = link.read_u8().await? as usize;
            if len == 0 {
                return Ok(Value::Null);
            }
            Ok(Value::String(link.read_str(len, collation.codec()).await?))
        }
        TypeInfo::UShortString {
            collation, width, ..
        } => {
            let len = link.read_u16().await?;
            if len == 0xFFFF {
                return Ok(Value::Null);
            }
            let len = len as usize;
            match width {
                CharWidth::Wide => Ok(Value::String(link.read_ucs2(len / 2).await?)),
                CharWidth::Narrow => {
                    Ok(Value::String(link.read_str(len, collation.codec()).await?))
                }
            }
        }
        TypeInfo::UShortBinary { .. } => {
            let len = link.read_u16().await?;
            if len == 0xFFFF {
                return Ok(Value::Null);
            }
            Ok(Value::Binary(link.read_bytes(len as usize).await?))
        }
        TypeInfo::Plp { id, collation } => {
            let Some(raw) = read_plp(link).await? else {
                return Ok(Value::Null);
            };
            match id {
                TypeId::NVarChar | TypeId::NChar => Ok(Value::String(ucs2_to_string(&raw)?)),
                TypeId::BigVarChar => {
                    let (text, _, _) = collation.codec().decode(&raw);
                    Ok(Value::String(text.into_owned()))
                }
                _ => Ok(Value::Binary(raw)),
            }
        }
        TypeInfo::LongLen { id, collation, .. } => decode_long_len(link, *id, *collation).await,
        TypeInfo::Variant { .. } => decode_variant(link).await,
        TypeInfo::Xml => {
            let Some(raw) = read_plp(link).await? else {
                return Ok(Value::Null);
            };
            Ok(Value::String(ucs2_to_string(&raw)?))
        }
        TypeInfo::Udt { .. } => {
            let Some(raw) = read_plp(link).await? else {
                return Ok(Value::Null);
            };
            Ok(Value::Binary(raw))
        }
    }
}

/// Read a PLP stream: the u64 header, then length-prefixed chunks until a
/// zero-length chunk. Returns `None` for the NULL sentinel.
pub async fn read_plp<T: Transport>(link: &mut TdsLink<T>) -> Result<Option<Bytes>, StreamError> {
    let header = link.read_u64().await?;
    if header == PLP_NULL {
        return Ok(None);
    }
    let mut out = if header == PLP_UNKNOWN {
        Vec::new()
    } else {
        Vec::with_capacity(usize::try_from(header).unwrap_or(0))
    };
    loop {
        let chunk_len = link.read_u32().await? as usize;
        if chunk_len == 0 {
            break;
        }
        let chunk = link.read_bytes(chunk_len).await?;
        out.extend_from_slice(&chunk);
    }
    Ok(Some(Bytes::from(out)))
}

async fn decode_fixed<T: Transport>(
    link: &mut TdsLink<T>,
    id: TypeId,
) -> Result<Value, StreamError> {
    match id {
        TypeId::Null => Ok(Value::Null),
        TypeId::Int1 => Ok(Value::U8(link.read_u8().await?)),
        TypeId::Bit => Ok(Value::Bool(link.read_u8().await? != 0)),
        TypeId::Int2 => Ok(Value::I16(link.read_i16().await?)),
        TypeId::Int4 => Ok(Value::I32(link.read_i32().await?)),
        TypeId::Int8 => Ok(Value::I64(link.read_i64().await?)),
        TypeId::Float4 => {
            let raw = link.read_u32().await?;
            Ok(Value::F32(f32::from_bits(raw)))
        }
        TypeId::Float8 => {
            let raw = link.read_u64().await?;
            Ok(Value::F64(f64::from_bits(raw)))
        }
        TypeId::Money4 => {
            let raw = link.read_i32().await?;
            Ok(Value::Decimal(Decimal::new(i64::from(raw), 4)))
        }
        TypeId::Money8 => {
            let hi = link.read_i32().await?;
            let lo = link.read_u32().await?;
            let raw = (i64::from(hi) << 32) | i64::from(lo);
            Ok(Value::Decimal(Decimal::new(raw, 4)))
        }
        TypeId::DateTime => {
            let days = link.read_i32().await?;
            let ticks = link.read_i32().await?;
            Ok(Value::DateTime(datetime_from_parts(days, ticks)?))
        }
        TypeId::DateTime4 => {
            let days = link.read_u16().await?;
            let minutes = link.read_u16().await?;
            let date = date_from_1900(i32::from(days))?;
            let time = NaiveTime::from_num_seconds_from_midnight_opt(
                u32::from(minutes) * 60,
                0,
            )
            .ok_or(StreamError::Protocol(ProtocolError::ValueOutOfRange(
                "smalldatetime minutes",
            )))?;
            Ok(Value::DateTime(date.and_time(time)))
        }
        _ => Err(StreamError::Protocol(ProtocolError::ValueOutOfRange(
            "fixed type",
        ))),
    }
}

async fn decode_byte_len<T: Transport>(
    link: &mut TdsLink<T>,
    id: TypeId,
) -> Result<Value, StreamError> {
    let size = link.read_u8().await?;
    if size == 0 {
        return Ok(Value::Null);
    }
    match id {
        TypeId::IntN => match size {
            1 => Ok(Value::U8(link.read_u8().await?)),
            2 => Ok(Value::I16(link.read_i16().await?)),
            4 => Ok(Value::I32(link.read_i32().await?)),
            8 => Ok(Value::I64(link.read_i64().await?)),
            _ => Err(StreamError::Protocol(ProtocolError::ValueOutOfRange(
                "intn width",
            ))),
        },
        TypeId::BitN => Ok(Value::Bool(link.read_u8().await? != 0)),
        TypeId::FloatN => match size {
            4 => {
                let raw = link.read_u32().await?;
                Ok(Value::F32(f32::from_bits(raw)))
            }
            8 => {
                let raw = link.read_u64().await?;
                Ok(Value::F64(f64::from_bits(raw)))
            }
            _ => Err(StreamError::Protocol(ProtocolError::ValueOutOfRange(
                "fltn width",
            ))),
        },
        TypeId::MoneyN => match size {
            4 => {
                let raw = link.read_i32().await?;
                Ok(Value::Decimal(Decimal::new(i64::from(raw), 4)))
            }
            8 => {
                let hi = link.read_i32().await?;
                let lo = link.read_u32().await?;
                let raw = (i64::from(hi) << 32) | i64::from(lo);
                Ok(Value::Decimal(Decimal::new(raw, 4)))
            }
            _ => Err(StreamError::Protocol(ProtocolError::ValueOutOfRange(
                "money width",
            ))),
        },
        TypeId::DateTimeN => match size {
            4 => {
                let days = link.read_u16().await?;
                let minutes = link.read_u16().await?;
                let date = date_from_1900(i32::from(days))?;
                let time =
                    NaiveTime::from_num_seconds_from_midnight_opt(u32::from(minutes) * 60, 0)
                        .ok_or(StreamError::Protocol(ProtocolError::ValueOutOfRange(
                            "smalldatetime minutes",
                        )))?;
                Ok(Value::DateTime(date.and_time(time)))
            }
            8 => {
                let days = link.read_i32().await?;
                let ticks = link.read_i32().await?;
                Ok(Value::DateTime(datetime_from_parts(days, ticks)?))
            }
            _ => Err(StreamError::Protocol(ProtocolError::ValueOutOfRange(
                "datetime width",
            ))),
        },
        TypeId::Guid => {
            let raw = link.read_bytes(16).await?;
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&raw);
            Ok(Value::Uuid(uuid::Uuid::from_bytes_le(bytes)))
        }
        TypeId::VarBinaryLegacy | TypeId::BinaryLegacy => {
            Ok(Value::Binary(link.read_bytes(size as usize).await?))
        }
        _ => Err(StreamError::Protocol(ProtocolError::ValueOutOfRange(
            "byte-len type",
        ))),
    }
}

async fn decode_decimal<T: Transport>(
    link: &mut TdsLink<T>,
    scale: u8,
) -> Result<Value, StreamError> {
    let size = link.read_u8().await?;
    if size == 0 {
        return Ok(Value::Null);
    }
    let positive = link.read_u8().await? == 1;
    let magnitude_len = (size - 1) as usize;
    if magnitude_len > 16 {
        return Err(StreamError::Protocol(ProtocolError::ValueOutOfRange(
            "decimal width",
        )));
    }
    let raw = link.read_bytes(magnitude_len).await?;
    let mut le = [0u8; 16];
    le[..magnitude_len].copy_from_slice(&raw);
    let magnitude = u128::from_le_bytes(le);

    let mantissa = i128::try_from(magnitude)
        .map_err(|_| StreamError::Protocol(ProtocolError::ValueOutOfRange("decimal magnitude")))?;
    let mantissa = if positive { mantissa } else { -mantissa };
    let value = Decimal::try_from_i128_with_scale(mantissa, u32::from(scale))
        .map_err(|_| StreamError::Protocol(ProtocolError::ValueOutOfRange("decimal overflow")))?;
    Ok(Value::Decimal(value))
}

async fn decode_date<T: Transport>(link: &mut TdsLink<T>) -> Result<Value, StreamError> {
    let size = link.read_u8().await?;
    if size == 0 {
        return Ok(Value::Null);
    }
    Ok(Value::Date(read_date_core(link).await?))
}

async fn decode_scaled<T: Transport>(
    link: &mut TdsLink<T>,
    id: TypeId,
    scale: u8,
) -> Result<Value, StreamError> {
    let size = link.read_u8().await?;
    if size == 0 {
        return Ok(Value::Null);
    }
    match id {
        TypeId::TimeN => Ok(Value::Time(read_time_core(link, scale).await?)),
        TypeId::DateTime2N => {
            let time = read_time_core(link, scale).await?;
            let date = read_date_core(link).await?;
            Ok(Value::DateTime(date.and_time(time)))
        }
        TypeId::DateTimeOffsetN => {
            let time = read_time_core(link, scale).await?;
            let date = read_date_core(link).await?;
            let offset_minutes = link.read_i16().await?;
            let offset = FixedOffset::east_opt(i32::from(offset_minutes) * 60).ok_or(
                StreamError::Protocol(ProtocolError::ValueOutOfRange("offset minutes")),
            )?;
            let utc = date.and_time(time);
            let with_offset = offset
                .from_utc_datetime(&utc);
            Ok(Value::DateTimeOffset(with_offset.fixed_offset()))
        }
        _ => Err(StreamError::Protocol(ProtocolError::ValueOutOfRange(
            "scaled type",
        ))),
    }
}

async fn decode_long_len<T: Transport>(
    link: &mut TdsLink<T>,
    id: TypeId,
    collation: Collation,
) -> Result<Value, StreamError> {
    // Rows carry a text pointer first; a zero-length pointer is NULL.
    let ptr_len = link.read_u8().await? as usize;
    if ptr_len == 0 {
        return Ok(Value::Null);
    }
    let _pointer = link.read_bytes(ptr_len).await?;
    let _timestamp = link.read_bytes(8).await?;
    let data_len = link.read_i32().await?;
    if data_len < 0 {
        return Ok(Value::Null);
    }
    let data_len = data_len as usize;
    match id {
        TypeId::NText => Ok(Value::String(link.read_ucs2(data_len / 2).await?)),
        TypeId::Text => Ok(Value::String(
            link.read_str(data_len, collation.codec()).await?,
        )),
        _ => Ok(Value::Binary(link.read_bytes(data_len).await?)),
    }
}

async fn decode_variant<T: Transport>(link: &mut TdsLink<T>) -> Result<Value, StreamError> {
    let total = link.read_i32().await?;
    if total <= 0 {
        return Ok(Value::Null);
    }
    let total = total as usize;
    let code = link.read_u8().await?;
    let prop_bytes = link.read_u8().await? as usize;
    let inner = TypeId::from_u8(code)
        .ok_or(StreamError::Protocol(ProtocolError::UnsupportedVariantType(code)))?;
    let data_len = total - 2 - prop_bytes;

    match inner {
        TypeId::Int1 => Ok(Value::U8(link.read_u8().await?)),
        TypeId::Bit => Ok(Value::Bool(link.read_u8().await? != 0)),
        TypeId::Int2 => Ok(Value::I16(link.read_i16().await?)),
        TypeId::Int4 => Ok(Value::I32(link.read_i32().await?)),
        TypeId::Int8 => Ok(Value::I64(link.read_i64().await?)),
        TypeId::Float4 => {
            let raw = link.read_u32().await?;
            Ok(Value::F32(f32::from_bits(raw)))
        }
        TypeId::Float8 => {
            let raw = link.read_u64().await?;
            Ok(Value::F64(f64::from_bits(raw)))
        }
        TypeId::Money4 => {
            let raw = link.read_i32().await?;
            Ok(Value::Decimal(Decimal::new(i64::from(raw), 4)))
        }
        TypeId::Money8 => {
            let hi = link.read_i32().await?;
            let lo = link.read_u32().await?;
            Ok(Value::Decimal(Decimal::new(
                (i64::from(hi) << 32) | i64::from(lo),
                4,
            )))
        }
        TypeId::DateTime => {
            let days = link.read_i32().await?;
            let ticks = link.read_i32().await?;
            Ok(Value::DateTime(datetime_from_parts(days, ticks)?))
        }
        TypeId::DateTime4 => {
            let days = link.read_u16().await?;
            let minutes = link.read_u16().await?;
            let date = date_from_1900(i32::from(days))?;
            let time = NaiveTime::from_num_seconds_from_midnight_opt(u32::from(minutes) * 60, 0)
                .ok_or(StreamError::Protocol(ProtocolError::ValueOutOfRange(
                    "smalldatetime minutes",
                )))?;
            Ok(Value::DateTime(date.and_time(time)))
        }
        TypeId::Guid => {
            let raw = link.read_bytes(16).await?;
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&raw);
            Ok(Value::Uuid(uuid::Uuid::from_bytes_le(bytes)))
        }
        TypeId::DecimalN | TypeId::NumericN => {
            let _precision = link.read_u8().await?;
            let scale = link.read_u8().await?;
            let positive = link.read_u8().await? == 1;
            let magnitude_len = data_len - 1;
            if magnitude_len > 16 {
                return Err(StreamError::Protocol(ProtocolError::ValueOutOfRange(
                    "variant decimal width",
                )));
            }
            let raw = link.read_bytes(magnitude_len).await?;
            let mut le = [0u8; 16];
            le[..magnitude_len].copy_from_slice(&raw);
            let mantissa = i128::try_from(u128::from_le_bytes(le)).map_err(|_| {
                StreamError::Protocol(ProtocolError::ValueOutOfRange("variant decimal"))
            })?;
            let mantissa = if positive { mantissa } else { -mantissa };
            let value = Decimal::try_from_i128_with_scale(mantissa, u32::from(scale)).map_err(
                |_| StreamError::Protocol(ProtocolError::ValueOutOfRange("variant decimal")),
            )?;
            Ok(Value::Decimal(value))
        }
        TypeId::BigVarChar | TypeId::BigChar => {
            let collation = read_collation(link).await?;
            let _max_len = link.read_u16().await?;
            Ok(Value::String(
                link.read_str(data_len, collation.codec()).await?,
            ))
        }
        TypeId::NVarChar | TypeId::NChar => {
            let _collation = read_collation(link).await?;
            let _max_len = link.read_u16().await?;
            Ok(Value::String(link.read_ucs2(data_len / 2).await?))
        }
        TypeId::BigVarBinary | TypeId::BigBinary => {
            let _max_len = link.read_u16().await?;
            Ok(Value::Binary(link.read_bytes(data_len).await?))
        }
        TypeId::DateN => Ok(Value::Date(read_date_core(link).await?)),
        TypeId::TimeN => {
            let scale = link.read_u8().await?;
            Ok(Value::Time(read_time_core(link, scale).await?))
        }
        TypeId::DateTime2N => {
            let scale = link.read_u8().await?;
            let time = read_time_core(link, scale).await?;
            let date = read_date_core(link).await?;
            Ok(Value::DateTime(date.and_time(time)))
        }
        _ => Err(StreamError::Protocol(ProtocolError::UnsupportedVariantType(
            code,
        ))),
    }
}

async fn read_collation<T: Transport>(link: &mut TdsLink<T>) -> Result<Collation, StreamError> {
    let raw = link.read_bytes(5).await?;
    Ok(Collation::decode(&mut &raw[..])?)
}

/// 3-byte day count since 0001-01-01.
async fn read_date_core<T: Transport>(link: &mut TdsLink<T>) -> Result<NaiveDate, StreamError> {
    let raw = link.read_bytes(3).await?;
    let days = u32::from_le_bytes([raw[0], raw[1], raw[2], 0]);
    NaiveDate::from_num_days_from_ce_opt(days as i32 + 1).ok_or(StreamError::Protocol(
        ProtocolError::ValueOutOfRange("date days"),
    ))
}

/// Scaled time integer in 3/4/5 bytes.
async fn read_time_core<T: Transport>(
    link: &mut TdsLink<T>,
    scale: u8,
) -> Result<NaiveTime, StreamError> {
    let width = time_width(scale);
    let raw = link.read_bytes(width).await?;
    let mut le = [0u8; 8];
    le[..width].copy_from_slice(&raw);
    let units = u64::from_le_bytes(le);
    let nanos = units * 10u64.pow(9 - u32::from(scale.min(7)));
    let secs = (nanos / 1_000_000_000) as u32;
    let subsec = (nanos % 1_000_000_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, subsec).ok_or(StreamError::Protocol(
        ProtocolError::ValueOutOfRange("time units"),
    ))
}

fn date_from_1900(days: i32) -> Result<NaiveDate, StreamError> {
    NaiveDate::from_num_days_from_ce_opt(days + DAYS_EPOCH_1900 + 1).ok_or(
        StreamError::Protocol(ProtocolError::ValueOutOfRange("datetime days")),
    )
}

fn datetime_from_parts(days: i32, ticks: i32) -> Result<chrono::NaiveDateTime, StreamError> {
    let date = date_from_1900(days)?;
    let nanos = i64::from(ticks) * 10_000_000 / 3;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(0, 0).ok_or(
        StreamError::Protocol(ProtocolError::ValueOutOfRange("datetime ticks")),
    )?;
    Ok(date.and_time(time) + Duration::nanoseconds(nanos))
}

fn ucs2_to_string(raw: &[u8]) -> Result<String, StreamError> {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| StreamError::Protocol(ProtocolError::InvalidUcs2))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::IoTransport;
    use bytes::BytesMut;
    use std::str::FromStr;
    use tidewire_proto::encode::encode_value;
    use tidewire_proto::packet::PacketKind;
    use tokio::io::AsyncWriteExt;

    /// Frame `payload` as a single REPLY packet and hand back a link that
    /// has already begun the response.
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

    async fn roundtrip(info: &TypeInfo, value: &Value) -> Value {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, info, value).unwrap();
        let mut link = link_over(&buf).await;
        decode_value(&mut link, info).await.unwrap()
    }

    #[tokio::test]
    async fn intn_roundtrip() {
        let info = TypeInfo::ByteLen {
            id: TypeId::IntN,
            size: 8,
        };
        assert_eq!(
            roundtrip(&info, &Value::I64(-77)).await,
            Value::I64(-77)
        );
        assert_eq!(roundtrip(&info, &Value::Null).await, Value::Null);
    }

    #[tokio::test]
    async fn decimal_roundtrip_preserves_scale() {
        let info = TypeInfo::Decimal {
            id: TypeId::DecimalN,
            size: 13,
            precision: 20,
            scale: 5,
        };
        let v = Value::Decimal(Decimal::from_str("123456.12345").unwrap());
        assert_eq!(roundtrip(&info, &v).await, v);
    }

    #[tokio::test]
    async fn money_roundtrip() {
        let info = TypeInfo::ByteLen {
            id: TypeId::MoneyN,
            size: 8,
        };
        let v = Value::Decimal(Decimal::from_str("-922337.2036").unwrap());
        assert_eq!(roundtrip(&info, &v).await, v);
    }

    #[tokio::test]
    async fn datetime2_roundtrip() {
        let info = TypeInfo::Scaled {
            id: TypeId::DateTime2N,
            scale: 7,
        };
        let ts = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_micro_opt(23, 59, 59, 123_456)
            .unwrap();
        assert_eq!(roundtrip(&info, &Value::DateTime(ts)).await, Value::DateTime(ts));
    }

    #[tokio::test]
    async fn datetimeoffset_reconstructs_offset() {
        let info = TypeInfo::Scaled {
            id: TypeId::DateTimeOffsetN,
            scale: 7,
        };
        let offset = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let ts = offset
            .with_ymd_and_hms(2021, 7, 1, 12, 30, 45)
            .unwrap()
            .fixed_offset();
        assert_eq!(
            roundtrip(&info, &Value::DateTimeOffset(ts)).await,
            Value::DateTimeOffset(ts)
        );
    }

    #[tokio::test]
    async fn legacy_datetime_quantizes_to_ticks() {
        let info = TypeInfo::ByteLen {
            id: TypeId::DateTimeN,
            size: 8,
        };
        let ts = NaiveDate::from_ymd_opt(1999, 12, 31)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(roundtrip(&info, &Value::DateTime(ts)).await, Value::DateTime(ts));
    }

    #[tokio::test]
    async fn nvarchar_and_null() {
        let info = TypeInfo::UShortString {
            id: TypeId::NVarChar,
            size: 100,
            collation: Collation::RAW,
            width: CharWidth::Wide,
        };
        let v = Value::String("tidewire — проба".into());
        assert_eq!(roundtrip(&info, &v).await, v);
        assert_eq!(roundtrip(&info, &Value::Null).await, Value::Null);
    }

    #[tokio::test]
    async fn plp_roundtrip_long_value() {
        let info = TypeInfo::Plp {
            id: TypeId::NVarChar,
            collation: Collation::RAW,
        };
        let v = Value::String("x".repeat(9000));
        assert_eq!(roundtrip(&info, &v).await, v);
        assert_eq!(roundtrip(&info, &Value::Null).await, Value::Null);
    }

    #[tokio::test]
    async fn guid_roundtrip() {
        let info = TypeInfo::ByteLen {
            id: TypeId::Guid,
            size: 16,
        };
        let v = Value::Uuid(uuid::Uuid::from_str("6F9619FF-8B86-D011-B42D-00C04FC964FF").unwrap());
        assert_eq!(roundtrip(&info, &v).await, v);
    }

    #[tokio::test]
    async fn variant_int_payload() {
        // total size 6: type byte + prop byte + 4-byte int
        let mut payload = Vec::new();
        payload.extend_from_slice(&6i32.to_le_bytes());
        payload.push(TypeId::Int4 as u8);
        payload.push(0);
        payload.extend_from_slice(&42i32.to_le_bytes());

        let mut link = link_over(&payload).await;
        let v = decode_value(&mut link, &TypeInfo::Variant { size: 8009 })
            .await
            .unwrap();
        assert_eq!(v, Value::I32(42));
    }

    #[tokio::test]
    async fn variant_unknown_inner_type_is_fatal() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3i32.to_le_bytes());
        payload.push(0x99);
        payload.push(0);
        payload.push(0);

        let mut link = link_over(&payload).await;
        assert!(decode_value(&mut link, &TypeInfo::Variant { size: 8009 })
            .await
            .is_err());
    }
}
