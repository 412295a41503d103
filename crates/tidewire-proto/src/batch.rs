//! SQL batch request encoding.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_ucs2;
use crate::version::TdsVersion;

/// Write the ALL_HEADERS section that prefixes QUERY, RPC and TRANS
/// requests on TDS 7.2 and later.
///
/// Only the transaction-descriptor header is carried: its length (18), its
/// type (0x0002), the descriptor from the BEGINXACT ENVCHANGE (0 in
/// auto-commit), and the outstanding request count.
pub fn write_all_headers(dst: &mut BytesMut, transaction_descriptor: u64, outstanding: u32) {
    dst.put_u32_le(22);
    dst.put_u32_le(18);
    dst.put_u16_le(0x0002);
    dst.put_u64_le(transaction_descriptor);
    dst.put_u32_le(outstanding);
}

/// Encode a QUERY packet payload: ALL_HEADERS (7.2+) and the UCS-2 text.
#[must_use]
pub fn encode_batch(sql: &str, version: TdsVersion, transaction_descriptor: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(22 + sql.len() * 2);
    if version.is_72_plus() {
        write_all_headers(&mut buf, transaction_descriptor, 1);
    }
    write_ucs2(&mut buf, sql);
    buf.freeze()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn headers_present_from_72() {
        let payload = encode_batch("SELECT 1", TdsVersion::V7_2, 0);
        assert_eq!(&payload[0..4], &22u32.to_le_bytes());
        assert_eq!(&payload[8..10], &0x0002u16.to_le_bytes());
        // SQL starts after the 22-byte header section.
        assert_eq!(payload[22], b'S');
        assert_eq!(payload[23], 0);
    }

    #[test]
    fn headers_absent_before_72() {
        let payload = encode_batch("SELECT 1", TdsVersion::V7_1, 0);
        assert_eq!(payload[0], b'S');
        assert_eq!(payload.len(), 16);
    }

    #[test]
    fn transaction_descriptor_is_carried() {
        let payload = encode_batch("x", TdsVersion::V7_4, 0xDEAD_BEEF);
        assert_eq!(&payload[10..18], &0xDEAD_BEEFu64.to_le_bytes());
    }
}
