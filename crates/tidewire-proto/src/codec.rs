//! Low-level string codec helpers shared across the protocol structures.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Read a B_VARCHAR: 1-byte character count followed by UCS-2 LE data.
pub fn read_b_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    if src.remaining() < 1 {
        return Err(ProtocolError::UnexpectedEof("b_varchar length"));
    }
    let chars = src.get_u8() as usize;
    read_ucs2(src, chars)
}

/// Read a US_VARCHAR: 2-byte character count followed by UCS-2 LE data.
pub fn read_us_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    if src.remaining() < 2 {
        return Err(ProtocolError::UnexpectedEof("us_varchar length"));
    }
    let chars = src.get_u16_le() as usize;
    read_ucs2(src, chars)
}

/// Read `char_count` UCS-2 LE code units as a string.
pub fn read_ucs2(src: &mut impl Buf, char_count: usize) -> Result<String, ProtocolError> {
    if src.remaining() < char_count * 2 {
        return Err(ProtocolError::UnexpectedEof("ucs2 string"));
    }
    let mut units = Vec::with_capacity(char_count);
    for _ in 0..char_count {
        units.push(src.get_u16_le());
    }
    String::from_utf16(&units).map_err(|_| ProtocolError::InvalidUcs2)
}

/// Write a B_VARCHAR (1-byte character count prefix).
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = units.len().min(255);
    dst.put_u8(len as u8);
    for &u in &units[..len] {
        dst.put_u16_le(u);
    }
}

/// Write a US_VARCHAR (2-byte character count prefix).
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = units.len().min(65535);
    dst.put_u16_le(len as u16);
    for &u in &units[..len] {
        dst.put_u16_le(u);
    }
}

/// Write a string as raw UCS-2 LE without a length prefix.
pub fn write_ucs2(dst: &mut impl BufMut, s: &str) {
    for u in s.encode_utf16() {
        dst.put_u16_le(u);
    }
}

/// Byte length of a string once encoded as UCS-2 LE.
#[must_use]
pub fn ucs2_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn b_varchar_roundtrip() {
        let mut buf = BytesMut::new();
        write_b_varchar(&mut buf, "sp_executesql");
        let decoded = read_b_varchar(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, "sp_executesql");
    }

    #[test]
    fn us_varchar_roundtrip_non_ascii() {
        let mut buf = BytesMut::new();
        write_us_varchar(&mut buf, "naïve — 日本語");
        let decoded = read_us_varchar(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, "naïve — 日本語");
    }

    #[test]
    fn ucs2_len_counts_units() {
        assert_eq!(ucs2_len("abc"), 6);
        // Surrogate pair: two UTF-16 units.
        assert_eq!(ucs2_len("𝄞"), 4);
    }

    #[test]
    fn short_buffer_is_an_error() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[5, b'a', 0]); // claims 5 chars, has 1
        assert!(read_b_varchar(&mut buf.freeze()).is_err());
    }
}
