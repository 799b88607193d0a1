//! Frame encode/decode throughput benchmarks.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use couchbase_core::protocol::{Opcode, OperationFrame};

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for value_size in [16usize, 512, 16 * 1024] {
        let frame = OperationFrame::request(Opcode::Set, 1023)
            .with_extras(vec![0u8; 8])
            .with_key(&b"bench-key"[..])
            .with_value(vec![0x5Au8; value_size]);

        group.throughput(Throughput::Bytes(frame.wire_size() as u64));
        group.bench_function(format!("value_{}", value_size), |b| {
            b.iter(|| {
                let mut buf = BytesMut::with_capacity(frame.wire_size());
                black_box(&frame).write_to(&mut buf);
                black_box(buf)
            })
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for value_size in [16usize, 512, 16 * 1024] {
        let frame = OperationFrame::request(Opcode::Set, 1023)
            .with_extras(vec![0u8; 8])
            .with_key(&b"bench-key"[..])
            .with_value(vec![0x5Au8; value_size]);
        let mut encoded = BytesMut::new();
        frame.write_to(&mut encoded);
        let encoded = encoded.freeze();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_function(format!("value_{}", value_size), |b| {
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                black_box(OperationFrame::read_from(&mut buf).unwrap().unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_frame_encode, bench_frame_decode);
criterion_main!(benches);
