//! Column type descriptors and the version-gated type registry.
//!
//! Every column and every RPC parameter carries a TYPE_INFO: the wire type
//! code plus the per-type parameters (sizes, precision, scale, collation).
//! This module models TYPE_INFO as a tagged union, with one static
//! dispatch table from type code to constructor, gated by the negotiated
//! TDS version:
//!
//! - base registry (7.0),
//! - 7.1 adds collations on the character types,
//! - 7.2 adds the PLP MAX variants, XML and UDT,
//! - 7.3 adds DATE/TIME/DATETIME2/DATETIMEOFFSET and table-valued
//!   parameters.
//!
//! Value encoding against a `TypeInfo` lives in [`crate::encode`]; the
//! streaming decode half lives in `tidewire-stream`, because values can
//! span packet boundaries.

use bytes::{Buf, BufMut};

use crate::collation::Collation;
use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// Raw TDS type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)] // names mirror the wire constants
pub enum TypeId {
    Null = 0x1F,
    Int1 = 0x30,
    Bit = 0x32,
    Int2 = 0x34,
    Int4 = 0x38,
    DateTime4 = 0x3A,
    Float4 = 0x3B,
    Money8 = 0x3C,
    DateTime = 0x3D,
    Float8 = 0x3E,
    Money4 = 0x7A,
    Int8 = 0x7F,
    Guid = 0x24,
    IntN = 0x26,
    BitN = 0x68,
    DecimalN = 0x6A,
    NumericN = 0x6C,
    FloatN = 0x6D,
    MoneyN = 0x6E,
    DateTimeN = 0x6F,
    DateN = 0x28,
    TimeN = 0x29,
    DateTime2N = 0x2A,
    DateTimeOffsetN = 0x2B,
    VarBinaryLegacy = 0x25,
    VarCharLegacy = 0x27,
    BinaryLegacy = 0x2D,
    CharLegacy = 0x2F,
    BigVarBinary = 0xA5,
    BigVarChar = 0xA7,
    BigBinary = 0xAD,
    BigChar = 0xAF,
    NVarChar = 0xE7,
    NChar = 0xEF,
    Text = 0x23,
    Image = 0x22,
    NText = 0x63,
    Variant = 0x62,
    Xml = 0xF1,
    Udt = 0xF0,
    Tvp = 0xF3,
}

impl TypeId {
    /// Decode a raw type code, without version gating.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x1F => Self::Null,
            0x30 => Self::Int1,
            0x32 => Self::Bit,
            0x34 => Self::Int2,
            0x38 => Self::Int4,
            0x3A => Self::DateTime4,
            0x3B => Self::Float4,
            0x3C => Self::Money8,
            0x3D => Self::DateTime,
            0x3E => Self::Float8,
            0x7A => Self::Money4,
            0x7F => Self::Int8,
            0x24 => Self::Guid,
            0x26 => Self::IntN,
            0x68 => Self::BitN,
            0x6A => Self::DecimalN,
            0x6C => Self::NumericN,
            0x6D => Self::FloatN,
            0x6E => Self::MoneyN,
            0x6F => Self::DateTimeN,
            0x28 => Self::DateN,
            0x29 => Self::TimeN,
            0x2A => Self::DateTime2N,
            0x2B => Self::DateTimeOffsetN,
            0x25 => Self::VarBinaryLegacy,
            0x27 => Self::VarCharLegacy,
            0x2D => Self::BinaryLegacy,
            0x2F => Self::CharLegacy,
            0xA5 => Self::BigVarBinary,
            0xA7 => Self::BigVarChar,
            0xAD => Self::BigBinary,
            0xAF => Self::BigChar,
            0xE7 => Self::NVarChar,
            0xEF => Self::NChar,
            0x23 => Self::Text,
            0x22 => Self::Image,
            0x63 => Self::NText,
            0x62 => Self::Variant,
            0xF1 => Self::Xml,
            0xF0 => Self::Udt,
            0xF3 => Self::Tvp,
            _ => return None,
        })
    }

    /// Width of the non-nullable fixed types, in bytes.
    #[must_use]
    pub const fn fixed_width(self) -> Option<usize> {
        Some(match self {
            Self::Null => 0,
            Self::Int1 | Self::Bit => 1,
            Self::Int2 => 2,
            Self::Int4 | Self::Float4 | Self::Money4 | Self::DateTime4 => 4,
            Self::Int8 | Self::Float8 | Self::Money8 | Self::DateTime => 8,
            _ => return None,
        })
    }

    /// Smallest TDS version whose registry contains this code.
    #[must_use]
    pub const fn introduced_in(self) -> TdsVersion {
        match self {
            Self::Variant => TdsVersion::V7_1,
            Self::Xml | Self::Udt => TdsVersion::V7_2,
            Self::DateN | Self::TimeN | Self::DateTime2N | Self::DateTimeOffsetN | Self::Tvp => {
                TdsVersion::V7_3A
            }
            _ => TdsVersion::V7_0,
        }
    }
}

/// Marker for the UCS-2 versus collation-codec split of character types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharWidth {
    /// Single-byte, decoded with the column collation.
    Narrow,
    /// UCS-2 little-endian.
    Wide,
}

/// A parsed TYPE_INFO.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeInfo {
    /// Non-nullable fixed-width scalar, width implied by the code.
    FixedLen(TypeId),
    /// Nullable scalar family with a 1-byte size in info and on values
    /// (INTN, BITN, FLTN, MONEYN, DATETIMN, GUID).
    ByteLen {
        /// Family code.
        id: TypeId,
        /// Declared width; selects the subtype (e.g. INTN 1/2/4/8).
        size: u8,
    },
    /// DECIMAL/NUMERIC: size, precision, scale.
    Decimal {
        /// DECIMALN or NUMERICN.
        id: TypeId,
        /// Payload width in bytes including the sign byte.
        size: u8,
        /// Total digits, 1..=38.
        precision: u8,
        /// Fractional digits.
        scale: u8,
    },
    /// DATE: 3-byte day count, no parameters.
    Date,
    /// TIME/DATETIME2/DATETIMEOFFSET with fractional-second scale 0..=7.
    Scaled {
        /// TIMEN, DATETIME2N or DATETIMEOFFSETN.
        id: TypeId,
        /// Fractional-second precision.
        scale: u8,
    },
    /// Legacy 1-byte-length character/binary (CHAR/VARCHAR/BINARY/VARBINARY
    /// before the BIG variants).
    ByteLenString {
        /// Legacy code.
        id: TypeId,
        /// Maximum width.
        size: u8,
        /// Collation; RAW before the server announces one.
        collation: Collation,
    },
    /// 2-byte-length character types (BIGCHAR/BIGVARCHAR/NCHAR/NVARCHAR).
    UShortString {
        /// Character code.
        id: TypeId,
        /// Maximum byte width; never 0xFFFF here.
        size: u16,
        /// Collation (ignored for the N types).
        collation: Collation,
        /// Narrow or wide characters.
        width: CharWidth,
    },
    /// 2-byte-length binary (BIGBINARY/BIGVARBINARY).
    UShortBinary {
        /// Binary code.
        id: TypeId,
        /// Maximum byte width; never 0xFFFF here.
        size: u16,
    },
    /// MAX-typed variants carried with PLP framing (TDS 7.2+).
    Plp {
        /// BIGVARCHAR, NVARCHAR or BIGVARBINARY.
        id: TypeId,
        /// Collation for the character variants.
        collation: Collation,
    },
    /// Legacy LOB types with a 4-byte length (TEXT/NTEXT/IMAGE).
    LongLen {
        /// LOB code.
        id: TypeId,
        /// Declared maximum size.
        size: u32,
        /// Collation for TEXT/NTEXT.
        collation: Collation,
    },
    /// SQL_VARIANT with its maximum size.
    Variant {
        /// Declared maximum size.
        size: u32,
    },
    /// XML, wide text over PLP.
    Xml,
    /// CLR user-defined type; decoded as raw PLP bytes.
    Udt {
        /// Maximum size as declared.
        size: u16,
        /// Database the type lives in.
        db_name: String,
        /// Schema of the type.
        schema_name: String,
        /// Type name.
        type_name: String,
        /// Assembly-qualified CLR name.
        assembly_name: String,
    },
}

impl TypeInfo {
    /// The wire type code.
    #[must_use]
    pub fn id(&self) -> TypeId {
        match self {
            Self::FixedLen(id) => *id,
            Self::ByteLen { id, .. }
            | Self::Decimal { id, .. }
            | Self::Scaled { id, .. }
            | Self::ByteLenString { id, .. }
            | Self::UShortString { id, .. }
            | Self::UShortBinary { id, .. }
            | Self::Plp { id, .. }
            | Self::LongLen { id, .. } => *id,
            Self::Date => TypeId::DateN,
            Self::Variant { .. } => TypeId::Variant,
            Self::Xml => TypeId::Xml,
            Self::Udt { .. } => TypeId::Udt,
        }
    }

    /// Parse a TYPE_INFO from a buffer under the given registry version.
    ///
    /// Text/ntext/image table names and column names are *not* consumed
    /// here; they are COLMETADATA concerns handled by the caller.
    pub fn decode(src: &mut impl Buf, version: TdsVersion) -> Result<Self, ProtocolError> {
        if src.remaining() < 1 {
            return Err(ProtocolError::UnexpectedEof("type code"));
        }
        let code = src.get_u8();
        let id = TypeId::from_u8(code).ok_or(ProtocolError::UnknownType { code, version })?;
        if version < id.introduced_in() {
            return Err(ProtocolError::UnknownType { code, version });
        }

        match id {
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
            | TypeId::Int8 => Ok(Self::FixedLen(id)),

            TypeId::Guid
            | TypeId::IntN
            | TypeId::BitN
            | TypeId::FloatN
            | TypeId::MoneyN
            | TypeId::DateTimeN => {
                let size = read_u8(src)?;
                Ok(Self::ByteLen { id, size })
            }

            TypeId::DecimalN | TypeId::NumericN => {
                let size = read_u8(src)?;
                let precision = read_u8(src)?;
                let scale = read_u8(src)?;
                Ok(Self::Decimal {
                    id,
                    size,
                    precision,
                    scale,
                })
            }

            TypeId::DateN => Ok(Self::Date),

            TypeId::TimeN | TypeId::DateTime2N | TypeId::DateTimeOffsetN => {
                let scale = read_u8(src)?;
                Ok(Self::Scaled { id, scale })
            }

            TypeId::VarBinaryLegacy | TypeId::BinaryLegacy => {
                let size = read_u8(src)?;
                Ok(Self::ByteLen { id, size })
            }

            TypeId::VarCharLegacy | TypeId::CharLegacy => {
                let size = read_u8(src)?;
                Ok(Self::ByteLenString {
                    id,
                    size,
                    collation: Collation::RAW,
                })
            }

            TypeId::BigVarChar | TypeId::BigChar | TypeId::NVarChar | TypeId::NChar => {
                let size = read_u16_le(src)?;
                let collation = if version.is_71_plus() {
                    Collation::decode(src)?
                } else {
                    Collation::RAW
                };
                let width = match id {
                    TypeId::NVarChar | TypeId::NChar => CharWidth::Wide,
                    _ => CharWidth::Narrow,
                };
                if size == 0xFFFF {
                    if !version.is_72_plus() {
                        return Err(ProtocolError::UnknownType { code, version });
                    }
                    Ok(Self::Plp { id, collation })
                } else {
                    Ok(Self::UShortString {
                        id,
                        size,
                        collation,
                        width,
                    })
                }
            }

            TypeId::BigVarBinary | TypeId::BigBinary => {
                let size = read_u16_le(src)?;
                if size == 0xFFFF {
                    if !version.is_72_plus() {
                        return Err(ProtocolError::UnknownType { code, version });
                    }
                    Ok(Self::Plp {
                        id,
                        collation: Collation::RAW,
                    })
                } else {
                    Ok(Self::UShortBinary { id, size })
                }
            }

            TypeId::Text | TypeId::NText | TypeId::Image => {
                let size = read_u32_le(src)?;
                let collation = if id != TypeId::Image && version.is_71_plus() {
                    Collation::decode(src)?
                } else {
                    Collation::RAW
                };
                Ok(Self::LongLen {
                    id,
                    size,
                    collation,
                })
            }

            TypeId::Variant => {
                let size = read_u32_le(src)?;
                Ok(Self::Variant { size })
            }

            TypeId::Xml => {
                // SCHEMA_PRESENT byte plus optional schema triple.
                let schema_present = read_u8(src)?;
                if schema_present != 0 {
                    let _db = crate::codec::read_b_varchar(src)?;
                    let _owner = crate::codec::read_b_varchar(src)?;
                    let _collection = crate::codec::read_us_varchar(src)?;
                }
                Ok(Self::Xml)
            }

            TypeId::Udt => {
                let size = read_u16_le(src)?;
                let db_name = crate::codec::read_b_varchar(src)?;
                let schema_name = crate::codec::read_b_varchar(src)?;
                let type_name = crate::codec::read_b_varchar(src)?;
                let assembly_name = crate::codec::read_us_varchar(src)?;
                Ok(Self::Udt {
                    size,
                    db_name,
                    schema_name,
                    type_name,
                    assembly_name,
                })
            }

            TypeId::Tvp => Err(ProtocolError::UnknownType { code, version }),
        }
    }

    /// Write this TYPE_INFO (the request-side half, used for RPC params).
    pub fn encode(&self, dst: &mut impl BufMut) {
        match self {
            Self::FixedLen(id) => dst.put_u8(*id as u8),
            Self::ByteLen { id, size } => {
                dst.put_u8(*id as u8);
                dst.put_u8(*size);
            }
            Self::Decimal {
                id,
                size,
                precision,
                scale,
            } => {
                dst.put_u8(*id as u8);
                dst.put_u8(*size);
                dst.put_u8(*precision);
                dst.put_u8(*scale);
            }
            Self::Date => dst.put_u8(TypeId::DateN as u8),
            Self::Scaled { id, scale } => {
                dst.put_u8(*id as u8);
                dst.put_u8(*scale);
            }
            Self::ByteLenString { id, size, .. } => {
                dst.put_u8(*id as u8);
                dst.put_u8(*size);
            }
            Self::UShortString {
                id,
                size,
                collation,
                ..
            } => {
                dst.put_u8(*id as u8);
                dst.put_u16_le(*size);
                collation.encode(dst);
            }
            Self::UShortBinary { id, size } => {
                dst.put_u8(*id as u8);
                dst.put_u16_le(*size);
            }
            Self::Plp { id, collation } => {
                dst.put_u8(*id as u8);
                dst.put_u16_le(0xFFFF);
                if matches!(id, TypeId::BigVarChar | TypeId::NVarChar) {
                    collation.encode(dst);
                }
            }
            Self::LongLen {
                id,
                size,
                collation,
            } => {
                dst.put_u8(*id as u8);
                dst.put_u32_le(*size);
                if *id != TypeId::Image {
                    collation.encode(dst);
                }
            }
            Self::Variant { size } => {
                dst.put_u8(TypeId::Variant as u8);
                dst.put_u32_le(*size);
            }
            Self::Xml => {
                dst.put_u8(TypeId::Xml as u8);
                dst.put_u8(0); // no schema
            }
            Self::Udt {
                size,
                db_name,
                schema_name,
                type_name,
                assembly_name,
            } => {
                dst.put_u8(TypeId::Udt as u8);
                dst.put_u16_le(*size);
                crate::codec::write_b_varchar(dst, db_name);
                crate::codec::write_b_varchar(dst, schema_name);
                crate::codec::write_b_varchar(dst, type_name);
                crate::codec::write_us_varchar(dst, assembly_name);
            }
        }
    }

    /// SQL declaration for sp_executesql parameter definitions.
    #[must_use]
    pub fn declaration(&self) -> String {
        match self {
            Self::FixedLen(id) => fixed_declaration(*id).to_owned(),
            Self::ByteLen { id, size } => match id {
                TypeId::IntN => match size {
                    1 => "tinyint".to_owned(),
                    2 => "smallint".to_owned(),
                    8 => "bigint".to_owned(),
                    _ => "int".to_owned(),
                },
                TypeId::BitN => "bit".to_owned(),
                TypeId::FloatN => {
                    if *size == 4 {
                        "real".to_owned()
                    } else {
                        "float".to_owned()
                    }
                }
                TypeId::MoneyN => {
                    if *size == 4 {
                        "smallmoney".to_owned()
                    } else {
                        "money".to_owned()
                    }
                }
                TypeId::DateTimeN => {
                    if *size == 4 {
                        "smalldatetime".to_owned()
                    } else {
                        "datetime".to_owned()
                    }
                }
                TypeId::Guid => "uniqueidentifier".to_owned(),
                TypeId::VarBinaryLegacy | TypeId::BinaryLegacy => {
                    format!("varbinary({size})")
                }
                _ => format!("varbinary({size})"),
            },
            Self::Decimal {
                precision, scale, ..
            } => format!("decimal({precision},{scale})"),
            Self::Date => "date".to_owned(),
            Self::Scaled { id, scale } => match id {
                TypeId::TimeN => format!("time({scale})"),
                TypeId::DateTime2N => format!("datetime2({scale})"),
                _ => format!("datetimeoffset({scale})"),
            },
            Self::ByteLenString { size, .. } => format!("varchar({size})"),
            Self::UShortString { id, size, .. } => match id {
                TypeId::NVarChar => format!("nvarchar({})", size / 2),
                TypeId::NChar => format!("nchar({})", size / 2),
                TypeId::BigChar => format!("char({size})"),
                _ => format!("varchar({size})"),
            },
            Self::UShortBinary { id, size } => match id {
                TypeId::BigBinary => format!("binary({size})"),
                _ => format!("varbinary({size})"),
            },
            Self::Plp { id, .. } => match id {
                TypeId::NVarChar => "nvarchar(max)".to_owned(),
                TypeId::BigVarChar => "varchar(max)".to_owned(),
                _ => "varbinary(max)".to_owned(),
            },
            Self::LongLen { id, .. } => match id {
                TypeId::Text => "text".to_owned(),
                TypeId::NText => "ntext".to_owned(),
                _ => "image".to_owned(),
            },
            Self::Variant { .. } => "sql_variant".to_owned(),
            Self::Xml => "xml".to_owned(),
            Self::Udt { type_name, .. } => type_name.clone(),
        }
    }
}

fn fixed_declaration(id: TypeId) -> &'static str {
    match id {
        TypeId::Int1 => "tinyint",
        TypeId::Bit => "bit",
        TypeId::Int2 => "smallint",
        TypeId::Int4 => "int",
        TypeId::Int8 => "bigint",
        TypeId::Float4 => "real",
        TypeId::Float8 => "float",
        TypeId::Money4 => "smallmoney",
        TypeId::Money8 => "money",
        TypeId::DateTime4 => "smalldatetime",
        TypeId::DateTime => "datetime",
        _ => "sql_variant",
    }
}

fn read_u8(src: &mut impl Buf) -> Result<u8, ProtocolError> {
    if src.remaining() < 1 {
        return Err(ProtocolError::UnexpectedEof("type info"));
    }
    Ok(src.get_u8())
}

fn read_u16_le(src: &mut impl Buf) -> Result<u16, ProtocolError> {
    if src.remaining() < 2 {
        return Err(ProtocolError::UnexpectedEof("type info"));
    }
    Ok(src.get_u16_le())
}

fn read_u32_le(src: &mut impl Buf) -> Result<u32, ProtocolError> {
    if src.remaining() < 4 {
        return Err(ProtocolError::UnexpectedEof("type info"));
    }
    Ok(src.get_u32_le())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(info: &TypeInfo, version: TdsVersion) -> TypeInfo {
        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        TypeInfo::decode(&mut buf.freeze(), version).unwrap()
    }

    #[test]
    fn fixed_types_have_no_parameters() {
        let info = TypeInfo::FixedLen(TypeId::Int4);
        assert_eq!(roundtrip(&info, TdsVersion::V7_0), info);
    }

    #[test]
    fn intn_roundtrip() {
        let info = TypeInfo::ByteLen {
            id: TypeId::IntN,
            size: 8,
        };
        assert_eq!(roundtrip(&info, TdsVersion::V7_0), info);
        assert_eq!(info.declaration(), "bigint");
    }

    #[test]
    fn decimal_carries_precision_and_scale() {
        let info = TypeInfo::Decimal {
            id: TypeId::DecimalN,
            size: 9,
            precision: 20,
            scale: 5,
        };
        assert_eq!(roundtrip(&info, TdsVersion::V7_0), info);
        assert_eq!(info.declaration(), "decimal(20,5)");
    }

    #[test]
    fn nvarchar_collation_gated_by_version() {
        let info = TypeInfo::UShortString {
            id: TypeId::NVarChar,
            size: 80,
            collation: Collation::new(1033, 52),
            width: CharWidth::Wide,
        };
        assert_eq!(roundtrip(&info, TdsVersion::V7_1), info);
        assert_eq!(info.declaration(), "nvarchar(40)");

        // On 7.0 the collation bytes are absent from the wire.
        let mut buf = BytesMut::new();
        buf.put_u8(TypeId::NVarChar as u8);
        buf.put_u16_le(80);
        let decoded = TypeInfo::decode(&mut buf.freeze(), TdsVersion::V7_0).unwrap();
        assert_eq!(
            decoded,
            TypeInfo::UShortString {
                id: TypeId::NVarChar,
                size: 80,
                collation: Collation::RAW,
                width: CharWidth::Wide,
            }
        );
    }

    #[test]
    fn max_sentinel_requires_72() {
        let mut buf = BytesMut::new();
        buf.put_u8(TypeId::NVarChar as u8);
        buf.put_u16_le(0xFFFF);
        Collation::RAW.encode(&mut buf);

        let frozen = buf.freeze();
        assert!(TypeInfo::decode(&mut frozen.clone(), TdsVersion::V7_1).is_err());
        let decoded = TypeInfo::decode(&mut frozen.clone(), TdsVersion::V7_2).unwrap();
        assert!(matches!(decoded, TypeInfo::Plp { id: TypeId::NVarChar, .. }));
        assert_eq!(decoded.declaration(), "nvarchar(max)");
    }

    #[test]
    fn new_date_types_require_73() {
        let mut buf = BytesMut::new();
        buf.put_u8(TypeId::DateTime2N as u8);
        buf.put_u8(7);

        let frozen = buf.freeze();
        assert!(TypeInfo::decode(&mut frozen.clone(), TdsVersion::V7_2).is_err());
        let decoded = TypeInfo::decode(&mut frozen.clone(), TdsVersion::V7_3A).unwrap();
        assert_eq!(
            decoded,
            TypeInfo::Scaled {
                id: TypeId::DateTime2N,
                scale: 7
            }
        );
        assert_eq!(decoded.declaration(), "datetime2(7)");
    }

    #[test]
    fn udt_names_roundtrip() {
        let info = TypeInfo::Udt {
            size: 0xFFFF,
            db_name: "db".into(),
            schema_name: "dbo".into(),
            type_name: "Point".into(),
            assembly_name: "Geo, Version=1.0.0.0".into(),
        };
        assert_eq!(roundtrip(&info, TdsVersion::V7_2), info);
    }

    #[test]
    fn unknown_code_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x99);
        assert!(TypeInfo::decode(&mut buf.freeze(), TdsVersion::V7_4).is_err());
    }
}
