#![no_main]

use bytes::BytesMut;
use devbridge::core::packet::ProtocolVersion;
use devbridge::PacketCodec;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Fuzz the streaming decoder: drain arbitrary bytes through it under
    // both checksum regimes and make sure it only ever stops cleanly.
    for version in [ProtocolVersion::V1, ProtocolVersion::V2] {
        let mut codec = PacketCodec::with_version(64 * 1024, version);
        let mut buf = BytesMut::from(data);
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    }
});
