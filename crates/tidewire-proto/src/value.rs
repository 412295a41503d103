//! Host values and inference of their wire types.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::typeinfo::{CharWidth, TypeId, TypeInfo};
use crate::version::TdsVersion;

/// A value crossing the client/server boundary.
///
/// Integers narrower than 64 bits travel as `I64` on the way in; the decode
/// side produces the variant matching the column type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// BIT.
    Bool(bool),
    /// TINYINT.
    U8(u8),
    /// SMALLINT.
    I16(i16),
    /// INT.
    I32(i32),
    /// BIGINT.
    I64(i64),
    /// Integers beyond BIGINT range, carried as DECIMAL(38,0).
    I128(i128),
    /// REAL.
    F32(f32),
    /// FLOAT.
    F64(f64),
    /// DECIMAL / NUMERIC / MONEY / SMALLMONEY.
    Decimal(Decimal),
    /// Character data of any width.
    String(String),
    /// Binary data.
    Binary(Bytes),
    /// UNIQUEIDENTIFIER.
    Uuid(Uuid),
    /// DATE.
    Date(NaiveDate),
    /// TIME.
    Time(NaiveTime),
    /// DATETIME / SMALLDATETIME / DATETIME2.
    DateTime(NaiveDateTime),
    /// DATETIMEOFFSET.
    DateTimeOffset(DateTime<FixedOffset>),
}

impl Value {
    /// True for SQL NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Infer the narrowest correct wire type for this value.
    ///
    /// The choice is version-aware: MAX types need 7.2, the new date/time
    /// family needs 7.3 and degrades to DATETIMN below it.
    #[must_use]
    pub fn infer_type(&self, version: TdsVersion) -> TypeInfo {
        match self {
            // NULL with no declared type: an empty NVARCHAR carries it.
            Self::Null => TypeInfo::UShortString {
                id: TypeId::NVarChar,
                size: 2,
                collation: crate::collation::Collation::RAW,
                width: CharWidth::Wide,
            },
            Self::Bool(_) => TypeInfo::ByteLen {
                id: TypeId::BitN,
                size: 1,
            },
            Self::U8(_) | Self::I16(_) | Self::I32(_) => TypeInfo::ByteLen {
                id: TypeId::IntN,
                size: 4,
            },
            Self::I64(v) => {
                if i32::try_from(*v).is_ok() {
                    TypeInfo::ByteLen {
                        id: TypeId::IntN,
                        size: 4,
                    }
                } else {
                    TypeInfo::ByteLen {
                        id: TypeId::IntN,
                        size: 8,
                    }
                }
            }
            Self::I128(_) => TypeInfo::Decimal {
                id: TypeId::DecimalN,
                size: 17,
                precision: 38,
                scale: 0,
            },
            Self::F32(_) => TypeInfo::ByteLen {
                id: TypeId::FloatN,
                size: 4,
            },
            Self::F64(_) => TypeInfo::ByteLen {
                id: TypeId::FloatN,
                size: 8,
            },
            Self::Decimal(d) => {
                let scale = d.scale().min(38) as u8;
                let digits = decimal_digits(d).max(u32::from(scale)).clamp(1, 38) as u8;
                TypeInfo::Decimal {
                    id: TypeId::DecimalN,
                    size: decimal_size_for_precision(digits.max(scale)),
                    precision: digits.max(scale),
                    scale,
                }
            }
            Self::String(s) => {
                let byte_len = crate::codec::ucs2_len(s);
                if byte_len > 8000 && version.is_72_plus() {
                    TypeInfo::Plp {
                        id: TypeId::NVarChar,
                        collation: crate::collation::Collation::RAW,
                    }
                } else {
                    TypeInfo::UShortString {
                        id: TypeId::NVarChar,
                        size: byte_len.clamp(2, 8000) as u16,
                        collation: crate::collation::Collation::RAW,
                        width: CharWidth::Wide,
                    }
                }
            }
            Self::Binary(b) => {
                if b.len() > 8000 && version.is_72_plus() {
                    TypeInfo::Plp {
                        id: TypeId::BigVarBinary,
                        collation: crate::collation::Collation::RAW,
                    }
                } else {
                    TypeInfo::UShortBinary {
                        id: TypeId::BigVarBinary,
                        size: b.len().clamp(1, 8000) as u16,
                    }
                }
            }
            Self::Uuid(_) => TypeInfo::ByteLen {
                id: TypeId::Guid,
                size: 16,
            },
            Self::Date(_) => {
                if version.is_73_plus() {
                    TypeInfo::Date
                } else {
                    TypeInfo::ByteLen {
                        id: TypeId::DateTimeN,
                        size: 8,
                    }
                }
            }
            Self::Time(_) => {
                if version.is_73_plus() {
                    TypeInfo::Scaled {
                        id: TypeId::TimeN,
                        scale: 7,
                    }
                } else {
                    TypeInfo::ByteLen {
                        id: TypeId::DateTimeN,
                        size: 8,
                    }
                }
            }
            Self::DateTime(_) => {
                if version.is_73_plus() {
                    TypeInfo::Scaled {
                        id: TypeId::DateTime2N,
                        scale: 7,
                    }
                } else {
                    TypeInfo::ByteLen {
                        id: TypeId::DateTimeN,
                        size: 8,
                    }
                }
            }
            Self::DateTimeOffset(_) => {
                if version.is_73_plus() {
                    TypeInfo::Scaled {
                        id: TypeId::DateTimeOffsetN,
                        scale: 7,
                    }
                } else {
                    TypeInfo::ByteLen {
                        id: TypeId::DateTimeN,
                        size: 8,
                    }
                }
            }
        }
    }
}

/// Number of significant decimal digits in a normalized decimal.
fn decimal_digits(d: &Decimal) -> u32 {
    let normalized = d.normalize();
    let mantissa = normalized.mantissa().unsigned_abs();
    if mantissa == 0 {
        1
    } else {
        mantissa.ilog10() + 1
    }
}

/// Wire size (including sign byte) for a given decimal precision.
#[must_use]
pub fn decimal_size_for_precision(precision: u8) -> u8 {
    match precision {
        0..=9 => 5,
        10..=19 => 9,
        20..=28 => 13,
        _ => 17,
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Self::Binary(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn integers_pick_narrowest_int() {
        assert_eq!(
            Value::I64(5).infer_type(TdsVersion::V7_4),
            TypeInfo::ByteLen {
                id: TypeId::IntN,
                size: 4
            }
        );
        assert_eq!(
            Value::I64(i64::from(i32::MAX) + 1).infer_type(TdsVersion::V7_4),
            TypeInfo::ByteLen {
                id: TypeId::IntN,
                size: 8
            }
        );
    }

    #[test]
    fn wide_integers_become_decimal_38() {
        let info = Value::I128(i128::from(i64::MAX) * 10).infer_type(TdsVersion::V7_4);
        assert_eq!(
            info,
            TypeInfo::Decimal {
                id: TypeId::DecimalN,
                size: 17,
                precision: 38,
                scale: 0
            }
        );
    }

    #[test]
    fn decimal_precision_follows_digits() {
        let d = Decimal::from_str("123456.12345").unwrap();
        let info = Value::Decimal(d).infer_type(TdsVersion::V7_4);
        match info {
            TypeInfo::Decimal {
                precision, scale, ..
            } => {
                assert!(precision >= 11);
                assert_eq!(scale, 5);
            }
            other => panic!("unexpected inference: {other:?}"),
        }
    }

    #[test]
    fn long_text_uses_plp_only_after_72() {
        let long = "x".repeat(5000);
        assert!(matches!(
            Value::String(long.clone()).infer_type(TdsVersion::V7_4),
            TypeInfo::Plp {
                id: TypeId::NVarChar,
                ..
            }
        ));
        assert!(matches!(
            Value::String(long).infer_type(TdsVersion::V7_1),
            TypeInfo::UShortString { .. }
        ));
    }

    #[test]
    fn datetime_degrades_below_73() {
        let ts = NaiveDate::from_ymd_opt(2020, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(
            Value::DateTime(ts).infer_type(TdsVersion::V7_2),
            TypeInfo::ByteLen {
                id: TypeId::DateTimeN,
                size: 8
            }
        );
        assert_eq!(
            Value::DateTime(ts).infer_type(TdsVersion::V7_3A),
            TypeInfo::Scaled {
                id: TypeId::DateTime2N,
                scale: 7
            }
        );
    }

    #[test]
    fn decimal_size_table() {
        assert_eq!(decimal_size_for_precision(9), 5);
        assert_eq!(decimal_size_for_precision(19), 9);
        assert_eq!(decimal_size_for_precision(28), 13);
        assert_eq!(decimal_size_for_precision(38), 17);
    }
}
