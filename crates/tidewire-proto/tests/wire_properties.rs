//! Property tests for the pure wire structures.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::{Buf, BytesMut};
use proptest::prelude::*;
use tidewire_proto::codec::{read_us_varchar, write_us_varchar};
use tidewire_proto::collation::Collation;
use tidewire_proto::packet::{PacketHeader, PacketKind, PacketStatus, PACKET_HEADER_LEN};
use tidewire_proto::prelogin::{EncryptionLevel, PreLogin};
use tidewire_proto::smp::{SmpFlags, SmpHeader};
use tidewire_proto::version::TdsVersion;

fn packet_kind() -> impl Strategy<Value = PacketKind> {
    prop_oneof![
        Just(PacketKind::Query),
        Just(PacketKind::Rpc),
        Just(PacketKind::Reply),
        Just(PacketKind::Cancel),
        Just(PacketKind::Bulk),
        Just(PacketKind::Trans),
        Just(PacketKind::Login),
        Just(PacketKind::Auth),
        Just(PacketKind::PreLogin),
    ]
}

proptest! {
    #[test]
    fn packet_header_roundtrips(
        kind in packet_kind(),
        last in any::<bool>(),
        length in (PACKET_HEADER_LEN as u16)..=u16::MAX,
        spid in any::<u16>(),
        packet_id in any::<u8>(),
    ) {
        let header = PacketHeader {
            kind,
            status: if last { PacketStatus::END_OF_MESSAGE } else { PacketStatus::empty() },
            length,
            spid,
            packet_id,
            window: 0,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        prop_assert_eq!(buf.len(), PACKET_HEADER_LEN);
        let decoded = PacketHeader::decode(&mut buf.freeze()).unwrap();
        prop_assert_eq!(decoded, header);
    }

    #[test]
    fn us_varchar_roundtrips(s in "\\PC{0,120}") {
        let mut buf = BytesMut::new();
        write_us_varchar(&mut buf, &s);
        let decoded = read_us_varchar(&mut buf.freeze()).unwrap();
        prop_assert_eq!(decoded, s);
    }

    #[test]
    fn collation_roundtrips(lcid in any::<u32>(), sort_id in any::<u8>()) {
        let collation = Collation::new(lcid, sort_id);
        let mut buf = BytesMut::new();
        collation.encode(&mut buf);
        let decoded = Collation::decode(&mut buf.freeze()).unwrap();
        prop_assert_eq!(decoded, collation);
        // Every collation resolves to some codec.
        let _ = collation.codec();
    }

    #[test]
    fn smp_header_roundtrips(
        session_id in any::<u16>(),
        payload_len in 0usize..100_000,
        seqnum in any::<u32>(),
        window in any::<u32>(),
    ) {
        let header = SmpHeader::new(SmpFlags::DATA, session_id, payload_len, seqnum, window);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let decoded = SmpHeader::decode(&mut buf.freeze()).unwrap();
        prop_assert_eq!(decoded, header);
        prop_assert_eq!(decoded.payload_len(), payload_len);
    }

    #[test]
    fn prelogin_roundtrips(
        encrypt in 0u8..4,
        mars in any::<bool>(),
        fed_auth in any::<bool>(),
        instance in proptest::option::of("[A-Za-z][A-Za-z0-9]{0,15}"),
    ) {
        let mut msg = PreLogin::client(TdsVersion::V7_4, EncryptionLevel::from_u8(encrypt))
            .with_mars(mars)
            .with_fed_auth(fed_auth);
        if let Some(ref name) = instance {
            msg = msg.with_instance(name.clone());
        }

        let decoded = PreLogin::decode(&msg.encode()).unwrap();
        prop_assert_eq!(decoded.encryption, msg.encryption);
        prop_assert_eq!(decoded.mars, mars);
        prop_assert_eq!(decoded.fed_auth_required, fed_auth);
        prop_assert_eq!(decoded.instance, instance.filter(|s| !s.is_empty()));
    }
}
