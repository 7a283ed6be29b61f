use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use devbridge::core::packet::{Packet, ProtocolVersion};
use devbridge::PacketCodec;
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_packet_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encode_decode");
    let payload_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_v1_{size}b"), |b| {
            b.iter_batched(
                || Bytes::from(vec![0u8; size]),
                |payload| {
                    let mut codec = PacketCodec::with_version(2 * 1024 * 1024, ProtocolVersion::V1);
                    let mut buf = BytesMut::with_capacity(size + 32);
                    codec.encode(Packet::wrte(1, 2, payload), &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });
        group.bench_function(format!("decode_v1_{size}b"), |b| {
            let packet = Packet::wrte(1, 2, Bytes::from(vec![0u8; size]));
            let bytes = packet.to_bytes(ProtocolVersion::V1);
            b.iter_batched(
                || BytesMut::from(&bytes[..]),
                |mut buf| {
                    let mut codec = PacketCodec::with_version(2 * 1024 * 1024, ProtocolVersion::V1);
                    let decoded = codec.decode(&mut buf).unwrap();
                    assert!(decoded.is_some());
                },
                BatchSize::SmallInput,
            )
        });
        group.bench_function(format!("decode_v2_{size}b"), |b| {
            let packet = Packet::wrte(1, 2, Bytes::from(vec![0u8; size]));
            let bytes = packet.to_bytes(ProtocolVersion::V2);
            b.iter_batched(
                || BytesMut::from(&bytes[..]),
                |mut buf| {
                    let mut codec = PacketCodec::with_version(2 * 1024 * 1024, ProtocolVersion::V2);
                    let decoded = codec.decode(&mut buf).unwrap();
                    assert!(decoded.is_some());
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_packet_encode_decode);
criterion_main!(benches);
