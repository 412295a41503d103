//! SQL Server collations and their character encodings.
//!
//! A collation travels as 5 wire bytes: a 32-bit LCID-plus-flags field and a
//! one-byte sort id. For `CHAR`/`VARCHAR`/`TEXT` columns the collation picks
//! the single-byte code page used on the wire; the sort id takes precedence
//! over the LCID when it is non-zero. N-typed strings are always UCS-2 LE
//! and never consult the collation.
//!
//! Until the server announces a collation via ENVCHANGE the session uses
//! [`Collation::RAW`], which decodes through the Windows-1252 fallback.

use bytes::{Buf, BufMut};
use encoding_rs::Encoding;

use crate::error::ProtocolError;

/// Wire size of a collation.
pub const COLLATION_LEN: usize = 5;

/// A 5-byte collation descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Collation {
    /// LCID and comparison flags, little-endian on the wire.
    pub lcid: u32,
    /// Sort id; non-zero selects a legacy SQL sort order.
    pub sort_id: u8,
}

impl Collation {
    /// The pseudo-collation in effect before the server announces one.
    pub const RAW: Self = Self { lcid: 0, sort_id: 0 };

    /// Create a collation from its parts.
    #[must_use]
    pub const fn new(lcid: u32, sort_id: u8) -> Self {
        Self { lcid, sort_id }
    }

    /// Decode the 5 wire bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < COLLATION_LEN {
            return Err(ProtocolError::UnexpectedEof("collation"));
        }
        let lcid = src.get_u32_le();
        let sort_id = src.get_u8();
        Ok(Self { lcid, sort_id })
    }

    /// Encode the 5 wire bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.lcid);
        dst.put_u8(self.sort_id);
    }

    /// The code page for non-Unicode text under this collation.
    ///
    /// Sort id first, then the LCID's primary language; anything unknown
    /// falls back to Windows-1252, which is also the behavior of the RAW
    /// pseudo-collation.
    #[must_use]
    pub fn codec(&self) -> &'static Encoding {
        if self.sort_id != 0 {
            if let Some(enc) = encoding_for_sort_id(self.sort_id) {
                return enc;
            }
        }
        encoding_for_lcid(self.lcid).unwrap_or(encoding_rs::WINDOWS_1252)
    }
}

/// Map a legacy SQL sort id to its code page.
///
/// Only the Windows code pages survive here; the DOS OEM sort orders
/// (CP437/CP850 families) have no lossless counterpart and resolve through
/// the 1252 fallback.
#[must_use]
pub fn encoding_for_sort_id(sort_id: u8) -> Option<&'static Encoding> {
    match sort_id {
        // Windows-1250, Central European
        80..=96 | 112..=120 => Some(encoding_rs::WINDOWS_1250),
        // Windows-1251, Cyrillic
        104..=108 => Some(encoding_rs::WINDOWS_1251),
        // Windows-1252, Western European dictionary orders
        51..=54 | 57..=61 | 71..=74 | 183..=186 => Some(encoding_rs::WINDOWS_1252),
        // Windows-1253, Greek
        124..=128 => Some(encoding_rs::WINDOWS_1253),
        // Windows-1254, Turkish
        130 => Some(encoding_rs::WINDOWS_1254),
        // Windows-1255, Hebrew
        136..=138 => Some(encoding_rs::WINDOWS_1255),
        // Windows-1256, Arabic
        144..=146 => Some(encoding_rs::WINDOWS_1256),
        // Windows-1257, Baltic
        152..=160 => Some(encoding_rs::WINDOWS_1257),
        _ => None,
    }
}

/// Map an LCID to the code page of its primary language.
#[must_use]
pub fn encoding_for_lcid(lcid: u32) -> Option<&'static Encoding> {
    match lcid & 0xFFFF {
        // Japanese, Shift_JIS (932)
        0x0411 | 0x10411 => Some(encoding_rs::SHIFT_JIS),

        // Simplified Chinese, GBK (936)
        0x0804 | 0x1004 | 0x20804 => Some(encoding_rs::GB18030),

        // Traditional Chinese, Big5 (950)
        0x0404 | 0x0C04 | 0x1404 | 0x30404 => Some(encoding_rs::BIG5),

        // Korean, EUC-KR (949)
        0x0412 | 0x10412 => Some(encoding_rs::EUC_KR),

        // Thai (874)
        0x041E => Some(encoding_rs::WINDOWS_874),

        // Vietnamese (1258)
        0x042A => Some(encoding_rs::WINDOWS_1258),

        // Central European (1250)
        0x0405 | 0x040E | 0x0415 | 0x0418 | 0x041A | 0x041B | 0x041C | 0x0424 | 0x081A
        | 0x101A | 0x141A => Some(encoding_rs::WINDOWS_1250),

        // Cyrillic (1251)
        0x0402 | 0x0419 | 0x0422 | 0x0423 | 0x042F | 0x0440 | 0x0444 | 0x0450 | 0x0C1A
        | 0x201A | 0x0843 => Some(encoding_rs::WINDOWS_1251),

        // Greek (1253)
        0x0408 => Some(encoding_rs::WINDOWS_1253),

        // Turkish and Azerbaijani Latin (1254)
        0x041F | 0x042C => Some(encoding_rs::WINDOWS_1254),

        // Hebrew (1255)
        0x040D => Some(encoding_rs::WINDOWS_1255),

        // Arabic, Farsi, Urdu (1256)
        0x0401 | 0x0420 | 0x0429 | 0x0801 | 0x0C01 | 0x1001 | 0x1401 | 0x1801 | 0x1C01
        | 0x2001 | 0x2401 | 0x2801 | 0x2C01 | 0x3001 | 0x3401 | 0x3801 | 0x3C01 | 0x4001 => {
            Some(encoding_rs::WINDOWS_1256)
        }

        // Baltic (1257)
        0x0425 | 0x0426 | 0x0427 => Some(encoding_rs::WINDOWS_1257),

        // Western European and everything sharing 1252
        0x0409 | 0x0809 | 0x0C09 | 0x1009 | 0x1409 | 0x0407 | 0x0807 | 0x0C07 | 0x040C
        | 0x080C | 0x0C0C | 0x100C | 0x0410 | 0x0810 | 0x040A | 0x080A | 0x0C0A | 0x0413
        | 0x0813 | 0x0414 | 0x0814 | 0x0416 | 0x0816 | 0x041D | 0x040B | 0x0406 | 0x040F
        | 0x0421 | 0x0438 | 0x043E => Some(encoding_rs::WINDOWS_1252),

        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn wire_roundtrip() {
        let collation = Collation::new(0x0409, 52);
        let mut buf = BytesMut::new();
        collation.encode(&mut buf);
        assert_eq!(buf.len(), COLLATION_LEN);
        assert_eq!(Collation::decode(&mut buf.freeze()).unwrap(), collation);
    }

    #[test]
    fn english_maps_to_1252() {
        let collation = Collation::new(1033, 0);
        assert_eq!(collation.codec(), encoding_rs::WINDOWS_1252);
    }

    #[test]
    fn russian_maps_to_1251() {
        let collation = Collation::new(1049, 0);
        assert_eq!(collation.codec(), encoding_rs::WINDOWS_1251);
    }

    #[test]
    fn sort_id_takes_precedence() {
        // Russian LCID but a 1252 sort order.
        let collation = Collation::new(1049, 52);
        assert_eq!(collation.codec(), encoding_rs::WINDOWS_1252);
    }

    #[test]
    fn raw_collation_falls_back() {
        assert_eq!(Collation::RAW.codec(), encoding_rs::WINDOWS_1252);
    }

    #[test]
    fn cjk_pages() {
        assert_eq!(Collation::new(0x0411, 0).codec(), encoding_rs::SHIFT_JIS);
        assert_eq!(Collation::new(0x0804, 0).codec(), encoding_rs::GB18030);
        assert_eq!(Collation::new(0x0404, 0).codec(), encoding_rs::BIG5);
    }
}
