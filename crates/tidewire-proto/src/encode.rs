//! Value encoding against a [`TypeInfo`].
//!
//! This is the request-side half of the serializer registry. Decoding is
//! streaming and lives in `tidewire-stream`; the encodings here write into
//! in-memory buffers, which the writer then splits across packets.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::collation::Collation;
use crate::error::ProtocolError;
use crate::typeinfo::{CharWidth, TypeId, TypeInfo};
use crate::value::Value;

/// PLP sentinel for NULL.
pub const PLP_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// PLP sentinel for "total length unknown up front".
pub const PLP_UNKNOWN: u64 = 0xFFFF_FFFF_FFFF_FFFE;

/// Legacy NULL marker for 2-byte length prefixes.
pub const USHORT_NULL: u16 = 0xFFFF;

/// Chunk size for PLP streams written in unknown-length mode.
pub const PLP_CHUNK: usize = 0x2000;

/// Days between 0001-01-01 and 1900-01-01, the two date epochs.
pub const DAYS_EPOCH_1900: i32 = 693_595;

/// Width of the scaled time integer for a fractional-second scale.
#[must_use]
pub const fn time_width(scale: u8) -> usize {
    match scale {
        0..=2 => 3,
        3..=4 => 4,
        _ => 5,
    }
}

/// Encode `value` as declared by `info`.
pub fn encode_value(
    dst: &mut BytesMut,
    info: &TypeInfo,
    value: &Value,
) -> Result<(), ProtocolError> {
    match info {
        TypeInfo::FixedLen(id) => encode_fixed(dst, *id, value),
        TypeInfo::ByteLen { id, size } => encode_byte_len(dst, *id, *size, value),
        TypeInfo::Decimal { size, scale, .. } => encode_decimal(dst, *size, *scale, value),
        TypeInfo::Date => encode_date(dst, value),
        TypeInfo::Scaled { id, scale } => encode_scaled(dst, *id, *scale, value),
        TypeInfo::ByteLenString { collation, .. } => {
            encode_legacy_string(dst, *collation, value)
        }
        TypeInfo::UShortString {
            collation, width, ..
        } => encode_ushort_string(dst, *collation, *width, value),
        TypeInfo::UShortBinary { .. } => encode_ushort_binary(dst, value),
        TypeInfo::Plp { id, collation } => encode_plp_value(dst, *id, *collation, value, false),
        TypeInfo::LongLen { id, collation, .. } => encode_long_len(dst, *id, *collation, value),
        TypeInfo::Xml => encode_plp_value(dst, TypeId::NVarChar, Collation::RAW, value, false),
        TypeInfo::Udt { .. } => match value {
            Value::Null => {
                dst.put_u64_le(PLP_NULL);
                Ok(())
            }
            Value::Binary(b) => {
                write_plp_known(dst, b);
                Ok(())
            }
            _ => Err(ProtocolError::ValueOutOfRange("udt")),
        },
        TypeInfo::Variant { .. } => Err(ProtocolError::ValueOutOfRange("sql_variant")),
    }
}

/// Encode a PLP value, forcing the UNKNOWN-length chunked form when
/// `force_unknown` is set (the bulk-insert path does this even for known
/// lengths; some server versions end the message early otherwise).
pub fn encode_plp_value(
    dst: &mut BytesMut,
    id: TypeId,
    collation: Collation,
    value: &Value,
    force_unknown: bool,
) -> Result<(), ProtocolError> {
    let bytes: Bytes = match value {
        Value::Null => {
            dst.put_u64_le(PLP_NULL);
            return Ok(());
        }
        Value::String(s) => match id {
            TypeId::NVarChar | TypeId::NChar => {
                let mut b = BytesMut::with_capacity(s.len() * 2);
                crate::codec::write_ucs2(&mut b, s);
                b.freeze()
            }
            _ => {
                let (encoded, _, _) = collation.codec().encode(s);
                Bytes::copy_from_slice(&encoded)
            }
        },
        Value::Binary(b) => b.clone(),
        _ => return Err(ProtocolError::ValueOutOfRange("plp value")),
    };

    if force_unknown {
        write_plp_unknown(dst, &bytes);
    } else {
        write_plp_known(dst, &bytes);
    }
    Ok(())
}

/// PLP stream with a known total length: header, one chunk, terminator.
pub fn write_plp_known(dst: &mut BytesMut, bytes: &[u8]) {
    dst.put_u64_le(bytes.len() as u64);
    if !bytes.is_empty() {
        dst.put_u32_le(bytes.len() as u32);
        dst.put_slice(bytes);
    }
    dst.put_u32_le(0);
}

/// PLP stream in unknown-length mode: chunked, zero-length chunk terminates.
pub fn write_plp_unknown(dst: &mut BytesMut, bytes: &[u8]) {
    dst.put_u64_le(PLP_UNKNOWN);
    for chunk in bytes.chunks(PLP_CHUNK) {
        dst.put_u32_le(chunk.len() as u32);
        dst.put_slice(chunk);
    }
    dst.put_u32_le(0);
}

fn encode_fixed(dst: &mut BytesMut, id: TypeId, value: &Value) -> Result<(), ProtocolError> {
    match (id, value) {
        (TypeId::Int1, Value::U8(v)) => dst.put_u8(*v),
        (TypeId::Bit, Value::Bool(v)) => dst.put_u8(u8::from(*v)),
        (TypeId::Int2, Value::I16(v)) => dst.put_i16_le(*v),
        (TypeId::Int4, Value::I32(v)) => dst.put_i32_le(*v),
        (TypeId::Int8, Value::I64(v)) => dst.put_i64_le(*v),
        (TypeId::Float4, Value::F32(v)) => dst.put_f32_le(*v),
        (TypeId::Float8, Value::F64(v)) => dst.put_f64_le(*v),
        (TypeId::DateTime, Value::DateTime(v)) => put_datetime8(dst, v)?,
        (TypeId::DateTime4, Value::DateTime(v)) => put_datetime4(dst, v)?,
        (TypeId::Money8, Value::Decimal(v)) => put_money8(dst, v)?,
        (TypeId::Money4, Value::Decimal(v)) => put_money4(dst, v)?,
        _ => return Err(ProtocolError::ValueOutOfRange("fixed type")),
    }
    Ok(())
}

fn encode_byte_len(
    dst: &mut BytesMut,
    id: TypeId,
    size: u8,
    value: &Value,
) -> Result<(), ProtocolError> {
    if value.is_null() {
        dst.put_u8(0);
        return Ok(());
    }

    match id {
        TypeId::IntN => {
            let v = match value {
                Value::U8(v) => i64::from(*v),
                Value::I16(v) => i64::from(*v),
                Value::I32(v) => i64::from(*v),
                Value::I64(v) => *v,
                _ => return Err(ProtocolError::ValueOutOfRange("intn")),
            };
            dst.put_u8(size);
            match size {
                1 => dst.put_u8(u8::try_from(v).map_err(|_| ProtocolError::ValueOutOfRange("tinyint"))?),
                2 => dst.put_i16_le(
                    i16::try_from(v).map_err(|_| ProtocolError::ValueOutOfRange("smallint"))?,
                ),
                4 => dst.put_i32_le(
                    i32::try_from(v).map_err(|_| ProtocolError::ValueOutOfRange("int"))?,
                ),
                8 => dst.put_i64_le(v),
                _ => return Err(ProtocolError::ValueOutOfRange("intn width")),
            }
        }
        TypeId::BitN => {
            let Value::Bool(v) = value else {
                return Err(ProtocolError::ValueOutOfRange("bit"));
            };
            dst.put_u8(1);
            dst.put_u8(u8::from(*v));
        }
        TypeId::FloatN => {
            dst.put_u8(size);
            match (size, value) {
                (4, Value::F32(v)) => dst.put_f32_le(*v),
                (4, Value::F64(v)) => dst.put_f32_le(*v as f32),
                (8, Value::F64(v)) => dst.put_f64_le(*v),
                (8, Value::F32(v)) => dst.put_f64_le(f64::from(*v)),
                _ => return Err(ProtocolError::ValueOutOfRange("fltn")),
            }
        }
        TypeId::MoneyN => {
            let Value::Decimal(v) = value else {
                return Err(ProtocolError::ValueOutOfRange("money"));
            };
            dst.put_u8(size);
            match size {
                4 => put_money4(dst, v)?,
                8 => put_money8(dst, v)?,
                _ => return Err(ProtocolError::ValueOutOfRange("money width")),
            }
        }
        TypeId::DateTimeN => {
            let Value::DateTime(v) = value else {
                return Err(ProtocolError::ValueOutOfRange("datetime"));
            };
            dst.put_u8(size);
            match size {
                4 => put_datetime4(dst, v)?,
                8 => put_datetime8(dst, v)?,
                _ => return Err(ProtocolError::ValueOutOfRange("datetime width")),
            }
        }
        TypeId::Guid => {
            let Value::Uuid(v) = value else {
                return Err(ProtocolError::ValueOutOfRange("uniqueidentifier"));
            };
            dst.put_u8(16);
            dst.put_slice(&v.to_bytes_le());
        }
        TypeId::VarBinaryLegacy | TypeId::BinaryLegacy => {
            let Value::Binary(b) = value else {
                return Err(ProtocolError::ValueOutOfRange("binary"));
            };
            if b.len() > 255 {
                return Err(ProtocolError::ValueOutOfRange("binary length"));
            }
            dst.put_u8(b.len() as u8);
            dst.put_slice(b);
        }
        _ => return Err(ProtocolError::ValueOutOfRange("byte-len type")),
    }
    Ok(())
}

fn encode_decimal(
    dst: &mut BytesMut,
    size: u8,
    scale: u8,
    value: &Value,
) -> Result<(), ProtocolError> {
    let (mantissa, positive) = match value {
        Value::Null => {
            dst.put_u8(0);
            return Ok(());
        }
        Value::Decimal(d) => {
            let rescaled = rescale_mantissa(d.mantissa(), d.scale(), u32::from(scale))?;
            (rescaled.unsigned_abs(), rescaled >= 0)
        }
        Value::I128(v) => {
            if scale != 0 {
                return Err(ProtocolError::ValueOutOfRange("decimal scale"));
            }
            (v.unsigned_abs(), *v >= 0)
        }
        Value::I64(v) => {
            let rescaled = rescale_mantissa(i128::from(*v), 0, u32::from(scale))?;
            (rescaled.unsigned_abs(), *v >= 0)
        }
        _ => return Err(ProtocolError::ValueOutOfRange("decimal")),
    };

    let magnitude_len = (size - 1) as usize;
    let le = mantissa.to_le_bytes();
    if le[magnitude_len..].iter().any(|&b| b != 0) {
        return Err(ProtocolError::ValueOutOfRange("decimal magnitude"));
    }
    dst.put_u8(size);
    dst.put_u8(u8::from(positive));
    dst.put_slice(&le[..magnitude_len]);
    Ok(())
}

fn rescale_mantissa(mantissa: i128, from: u32, to: u32) -> Result<i128, ProtocolError> {
    if from == to {
        return Ok(mantissa);
    }
    if from < to {
        mantissa
            .checked_mul(10i128.pow(to - from))
            .ok_or(ProtocolError::ValueOutOfRange("decimal rescale"))
    } else {
        // Quantize toward zero; trailing digits beyond the declared scale
        // are not representable.
        Ok(mantissa / 10i128.pow(from - to))
    }
}

fn encode_date(dst: &mut BytesMut, value: &Value) -> Result<(), ProtocolError> {
    match value {
        Value::Null => {
            dst.put_u8(0);
            Ok(())
        }
        Value::Date(d) => {
            dst.put_u8(3);
            put_date_core(dst, d);
            Ok(())
        }
        _ => Err(ProtocolError::ValueOutOfRange("date")),
    }
}

fn encode_scaled(
    dst: &mut BytesMut,
    id: TypeId,
    scale: u8,
    value: &Value,
) -> Result<(), ProtocolError> {
    if value.is_null() {
        dst.put_u8(0);
        return Ok(());
    }
    let width = time_width(scale);
    match (id, value) {
        (TypeId::TimeN, Value::Time(t)) => {
            dst.put_u8(width as u8);
            put_time_core(dst, t, scale);
        }
        (TypeId::DateTime2N, Value::DateTime(ts)) => {
            dst.put_u8((width + 3) as u8);
            put_time_core(dst, &ts.time(), scale);
            put_date_core(dst, &ts.date());
        }
        (TypeId::DateTimeOffsetN, Value::DateTimeOffset(ts)) => {
            dst.put_u8((width + 5) as u8);
            let utc = ts.naive_utc();
            put_time_core(dst, &utc.time(), scale);
            put_date_core(dst, &utc.date());
            dst.put_i16_le((ts.offset().local_minus_utc() / 60) as i16);
        }
        _ => return Err(ProtocolError::ValueOutOfRange("scaled date type")),
    }
    Ok(())
}

fn encode_legacy_string(
    dst: &mut BytesMut,
    collation: Collation,
    value: &Value,
) -> Result<(), ProtocolError> {
    match value {
        Value::Null => {
            dst.put_u8(0);
            Ok(())
        }
        Value::String(s) => {
            let (encoded, _, _) = collation.codec().encode(s);
            if encoded.len() > 255 {
                return Err(ProtocolError::ValueOutOfRange("varchar length"));
            }
            dst.put_u8(encoded.len() as u8);
            dst.put_slice(&encoded);
            Ok(())
        }
        _ => Err(ProtocolError::ValueOutOfRange("varchar")),
    }
}

fn encode_ushort_string(
    dst: &mut BytesMut,
    collation: Collation,
    width: CharWidth,
    value: &Value,
) -> Result<(), ProtocolError> {
    match value {
        Value::Null => {
            dst.put_u16_le(USHORT_NULL);
            Ok(())
        }
        Value::String(s) => {
            let encoded: Bytes = match width {
                CharWidth::Wide => {
                    let mut b = BytesMut::with_capacity(s.len() * 2);
                    crate::codec::write_ucs2(&mut b, s);
                    b.freeze()
                }
                CharWidth::Narrow => {
                    let (e, _, _) = collation.codec().encode(s);
                    Bytes::copy_from_slice(&e)
                }
            };
            if encoded.len() >= usize::from(USHORT_NULL) {
                return Err(ProtocolError::ValueOutOfRange("string length"));
            }
            dst.put_u16_le(encoded.len() as u16);
            dst.put_slice(&encoded);
            Ok(())
        }
        _ => Err(ProtocolError::ValueOutOfRange("string")),
    }
}

fn encode_ushort_binary(dst: &mut BytesMut, value: &Value) -> Result<(), ProtocolError> {
    match value {
        Value::Null => {
            dst.put_u16_le(USHORT_NULL);
            Ok(())
        }
        Value::Binary(b) => {
            if b.len() >= usize::from(USHORT_NULL) {
                return Err(ProtocolError::ValueOutOfRange("binary length"));
            }
            dst.put_u16_le(b.len() as u16);
            dst.put_slice(b);
            Ok(())
        }
        _ => Err(ProtocolError::ValueOutOfRange("binary")),
    }
}

fn encode_long_len(
    dst: &mut BytesMut,
    id: TypeId,
    collation: Collation,
    value: &Value,
) -> Result<(), ProtocolError> {
    match value {
        Value::Null => {
            dst.put_i32_le(-1);
            Ok(())
        }
        Value::String(s) => {
            let encoded: Bytes = if id == TypeId::NText {
                let mut b = BytesMut::with_capacity(s.len() * 2);
                crate::codec::write_ucs2(&mut b, s);
                b.freeze()
            } else {
                let (e, _, _) = collation.codec().encode(s);
                Bytes::copy_from_slice(&e)
            };
            dst.put_i32_le(encoded.len() as i32);
            dst.put_slice(&encoded);
            Ok(())
        }
        Value::Binary(b) => {
            dst.put_i32_le(b.len() as i32);
            dst.put_slice(b);
            Ok(())
        }
        _ => Err(ProtocolError::ValueOutOfRange("lob")),
    }
}

/// 3-byte day count since 0001-01-01.
fn put_date_core(dst: &mut BytesMut, d: &NaiveDate) {
    let days = d.num_days_from_ce() - 1;
    let le = days.to_le_bytes();
    dst.put_slice(&le[..3]);
}

/// Scaled time integer in 3/4/5 bytes.
fn put_time_core(dst: &mut BytesMut, t: &NaiveTime, scale: u8) {
    let nanos =
        u64::from(t.num_seconds_from_midnight()) * 1_000_000_000 + u64::from(t.nanosecond());
    let units = nanos / 10u64.pow(9 - u32::from(scale.min(7)));
    let le = units.to_le_bytes();
    dst.put_slice(&le[..time_width(scale)]);
}

/// Legacy 8-byte datetime: days since 1900-01-01 and 1/300s ticks.
fn put_datetime8(dst: &mut BytesMut, ts: &NaiveDateTime) -> Result<(), ProtocolError> {
    let days = ts.date().num_days_from_ce() - 1 - DAYS_EPOCH_1900;
    let seconds = ts.time().num_seconds_from_midnight();
    let nanos = ts.time().nanosecond();
    let ticks = u64::from(seconds) * 300 + u64::from(nanos) * 3 / 10_000_000;
    dst.put_i32_le(days);
    dst.put_i32_le(
        i32::try_from(ticks).map_err(|_| ProtocolError::ValueOutOfRange("datetime ticks"))?,
    );
    Ok(())
}

/// Legacy 4-byte smalldatetime: days since 1900-01-01 and minutes.
fn put_datetime4(dst: &mut BytesMut, ts: &NaiveDateTime) -> Result<(), ProtocolError> {
    let days = ts.date().num_days_from_ce() - 1 - DAYS_EPOCH_1900;
    let minutes = ts.time().num_seconds_from_midnight() / 60;
    dst.put_u16_le(
        u16::try_from(days).map_err(|_| ProtocolError::ValueOutOfRange("smalldatetime days"))?,
    );
    dst.put_u16_le(minutes as u16);
    Ok(())
}

/// 8-byte money: the value times 10000 split as (high i32, low u32).
fn put_money8(dst: &mut BytesMut, d: &rust_decimal::Decimal) -> Result<(), ProtocolError> {
    let scaled = rescale_mantissa(d.mantissa(), d.scale(), 4)?;
    let raw =
        i64::try_from(scaled).map_err(|_| ProtocolError::ValueOutOfRange("money magnitude"))?;
    dst.put_i32_le((raw >> 32) as i32);
    dst.put_u32_le(raw as u32);
    Ok(())
}

/// 4-byte money: the value times 10000 as i32.
fn put_money4(dst: &mut BytesMut, d: &rust_decimal::Decimal) -> Result<(), ProtocolError> {
    let scaled = rescale_mantissa(d.mantissa(), d.scale(), 4)?;
    let raw =
        i32::try_from(scaled).map_err(|_| ProtocolError::ValueOutOfRange("smallmoney magnitude"))?;
    dst.put_i32_le(raw);
    Ok(())
}
