//! Property-based tests using proptest
//!
//! These tests validate wire-format and transport invariants across a wide
//! range of randomly generated inputs, rather than hand-picked byte
//! sequences.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

use devbridge::config::BridgeConfig;
use devbridge::core::packet::{checksum, Packet, ProtocolVersion, HEADER_LEN};
use devbridge::event_loop::EventLoop;
use devbridge::protocol::NoAuth;
use devbridge::service::ServiceDispatcher;
use devbridge::socket::SocketRegistry;
use devbridge::transport::{Transport, TransportContext, TransportKind};
use devbridge::PacketCodec;

/// Receive limit used throughout; generated payloads stay below it.
const RECV_LIMIT: usize = 64 * 1024;

const BOTH_VERSIONS: [ProtocolVersion; 2] = [ProtocolVersion::V1, ProtocolVersion::V2];

fn transport(kind: TransportKind, serial: &str) -> Arc<Transport> {
    let (_event_loop, handle) = EventLoop::new();
    let ctx = TransportContext {
        registry: Arc::new(SocketRegistry::new()),
        services: Arc::new(ServiceDispatcher::new(handle.clone())),
        event_loop: handle,
        config: Arc::new(BridgeConfig::default()),
        auth: Arc::new(NoAuth),
    };
    Transport::new(1, kind, serial.to_string(), None, ctx)
}

// Property: Any packet can be serialized and parsed back under either revision
proptest! {
    #[test]
    fn prop_packet_roundtrip(
        payload in prop::collection::vec(any::<u8>(), 0..10000),
        arg0 in any::<u32>(),
        arg1 in any::<u32>()
    ) {
        for version in BOTH_VERSIONS {
            let packet = Packet::wrte(arg0, arg1, Bytes::from(payload.clone()));
            let serialized = packet.to_bytes(version);
            let parsed = Packet::from_bytes(&serialized, version, RECV_LIMIT)
                .expect("Parsing our own bytes should not fail");
            prop_assert_eq!(&parsed, &packet);
        }
    }
}

// Property: Serialization is deterministic
proptest! {
    #[test]
    fn prop_packet_serialization_deterministic(
        payload in prop::collection::vec(any::<u8>(), 0..1000)
    ) {
        let packet = Packet::wrte(1, 2, Bytes::from(payload));
        let bytes1 = packet.to_bytes(ProtocolVersion::V2);
        let bytes2 = packet.to_bytes(ProtocolVersion::V2);
        prop_assert_eq!(bytes1, bytes2);
    }
}

// Property: Header fields always reflect the packet that produced them
proptest! {
    #[test]
    fn prop_header_fields_correct(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let packet = Packet::wrte(3, 4, Bytes::from(payload.clone()));

        for version in BOTH_VERSIONS {
            let serialized = packet.to_bytes(version);
            prop_assert_eq!(serialized.len(), HEADER_LEN + payload.len());

            let length_bytes = [serialized[12], serialized[13], serialized[14], serialized[15]];
            prop_assert_eq!(u32::from_le_bytes(length_bytes) as usize, payload.len());

            let checksum_bytes = [serialized[16], serialized[17], serialized[18], serialized[19]];
            let expected = match version {
                ProtocolVersion::V1 => checksum(&payload),
                ProtocolVersion::V2 => 0,
            };
            prop_assert_eq!(u32::from_le_bytes(checksum_bytes), expected);

            let command_bytes = [serialized[0], serialized[1], serialized[2], serialized[3]];
            let magic_bytes = [serialized[20], serialized[21], serialized[22], serialized[23]];
            prop_assert_eq!(
                u32::from_le_bytes(magic_bytes),
                u32::from_le_bytes(command_bytes) ^ 0xffff_ffff
            );
        }
    }
}

// Property: Parsing arbitrary untrusted bytes never panics
proptest! {
    #[test]
    fn prop_from_bytes_never_panics(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        for version in BOTH_VERSIONS {
            let _ = Packet::from_bytes(&data, version, RECV_LIMIT);
        }
    }
}

// Property: Draining the codec over arbitrary bytes never panics
proptest! {
    #[test]
    fn prop_codec_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        for version in BOTH_VERSIONS {
            let mut codec = PacketCodec::with_version(RECV_LIMIT, version);
            let mut buf = BytesMut::from(&data[..]);
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }
}

// Property: A partial frame is never consumed, at any split point
proptest! {
    #[test]
    fn prop_codec_partial_input_consumes_nothing(
        payload in prop::collection::vec(any::<u8>(), 1..1024),
        split_seed in any::<usize>()
    ) {
        let packet = Packet::wrte(1, 2, Bytes::from(payload));
        let full = packet.to_bytes(ProtocolVersion::V2);
        let split = split_seed % full.len(); // strictly short of a whole frame

        let mut codec = PacketCodec::with_version(RECV_LIMIT, ProtocolVersion::V2);
        let mut buf = BytesMut::from(&full[..split]);
        let result = codec.decode(&mut buf).expect("Partial frames are not errors");

        prop_assert!(result.is_none());
        prop_assert_eq!(buf.len(), split);
    }
}

// Property: A stream of packets decodes back in order
proptest! {
    #[test]
    fn prop_codec_stream_roundtrip(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 0..8)
    ) {
        for version in BOTH_VERSIONS {
            let mut codec = PacketCodec::with_version(RECV_LIMIT, version);
            let mut buf = BytesMut::new();
            for (i, payload) in payloads.iter().enumerate() {
                codec
                    .encode(Packet::wrte(i as u32, 0, Bytes::from(payload.clone())), &mut buf)
                    .expect("Encoding should not fail");
            }

            for (i, payload) in payloads.iter().enumerate() {
                let packet = codec
                    .decode(&mut buf)
                    .expect("Decoding should not fail")
                    .expect("A whole frame is buffered");
                prop_assert_eq!(packet.arg0 as usize, i);
                prop_assert_eq!(&packet.payload[..], &payload[..]);
            }
            prop_assert!(buf.is_empty());
        }
    }
}

// Property: Corrupting the magic word is always detected
proptest! {
    #[test]
    fn prop_rejects_corrupted_magic(
        payload in prop::collection::vec(any::<u8>(), 0..256),
        byte_index in 20usize..24,
        bit in 0u8..8
    ) {
        let packet = Packet::wrte(1, 2, Bytes::from(payload));
        let mut bytes = packet.to_bytes(ProtocolVersion::V2).to_vec();
        bytes[byte_index] ^= 1u8 << bit;

        prop_assert!(Packet::from_bytes(&bytes, ProtocolVersion::V2, RECV_LIMIT).is_err());
    }
}

// Property: v1 detects a payload bit flip; v2 ignores the stale checksum
proptest! {
    #[test]
    fn prop_v1_detects_payload_corruption(
        payload in prop::collection::vec(any::<u8>(), 1..1024),
        index_seed in any::<usize>(),
        bit in 0u8..8
    ) {
        let index = HEADER_LEN + index_seed % payload.len();
        let packet = Packet::wrte(1, 2, Bytes::from(payload));
        let mut bytes = packet.to_bytes(ProtocolVersion::V1).to_vec();
        bytes[index] ^= 1u8 << bit;

        prop_assert!(Packet::from_bytes(&bytes, ProtocolVersion::V1, RECV_LIMIT).is_err());
        prop_assert!(Packet::from_bytes(&bytes, ProtocolVersion::V2, RECV_LIMIT).is_ok());
    }
}

// Property: OPEN payloads are the service name plus a single trailing NUL
proptest! {
    #[test]
    fn prop_open_payload_is_nul_terminated(name in "[a-z0-9:,./_-]{0,64}") {
        let packet = Packet::open(9, &name);
        prop_assert_eq!(packet.payload.len(), name.len() + 1);
        prop_assert_eq!(&packet.payload[..name.len()], name.as_bytes());
        prop_assert_eq!(packet.payload[name.len()], 0);
    }
}

// Property: The feature set always equals the most recent set_features input
proptest! {
    #[test]
    fn prop_set_features_last_wins(
        lists in prop::collection::vec(prop::collection::vec("[a-z]{1,8}", 0..6), 1..8)
    ) {
        let t = transport(TransportKind::Local, "test");
        for list in &lists {
            t.set_features(&list.join(","));
        }

        let expected: std::collections::BTreeSet<&String> =
            lists.last().unwrap().iter().collect();
        prop_assert_eq!(t.features().len(), expected.len());
        for feature in expected {
            prop_assert!(t.has_feature(feature));
        }
    }
}

// Property: Target matching is stable under repetition, for any query
proptest! {
    #[test]
    fn prop_matches_target_stable(query in ".{0,40}", local in any::<bool>()) {
        let kind = if local { TransportKind::Local } else { TransportKind::Usb };
        let t = transport(kind, "100.100.100.100:5555");

        let first = t.matches_target(&query);
        for _ in 0..3 {
            prop_assert_eq!(first, t.matches_target(&query));
        }
    }
}
