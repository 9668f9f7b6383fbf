//! # Frame Codec Benchmarks
//!
//! | Path | Target |
//! |------|--------|
//! | Encode 1 KiB message, JSON envelope | < 10µs |
//! | Encode with buffer pool vs without | pooled not slower |
//! | Split frames out of a 64-frame stream buffer | < 1µs per frame |

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use message_bus::codec::encoder_for;
use message_bus::{BufferPool, BusId, CorrelationId, EncoderKind, FrameCodec, Message};
use std::sync::Arc;

fn sample_message(body_len: usize) -> Message {
    Message::new("OrderPlaced", Bytes::from(vec![b'x'; body_len]))
        .with_header("RoutingKey", "orders.placed")
        .with_correlation_id(CorrelationId::new())
        .with_reply_to("amq.gen-reply")
        .with_origin(&BusId::new("bench"))
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame-encode");

    for kind in [EncoderKind::Json, EncoderKind::Bincode] {
        for body_len in [64usize, 1024, 16 * 1024] {
            let message = sample_message(body_len);
            let plain = FrameCodec::new(encoder_for(kind));
            let pooled = FrameCodec::new(encoder_for(kind))
                .with_pool(Some(Arc::new(BufferPool::new(32 * 1024, 8))));

            group.throughput(Throughput::Bytes(body_len as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{kind:?}/owned"), body_len),
                &message,
                |b, message| b.iter(|| black_box(plain.encode(message).unwrap().len())),
            );
            group.bench_with_input(
                BenchmarkId::new(format!("{kind:?}/pooled"), body_len),
                &message,
                |b, message| b.iter(|| black_box(pooled.encode(message).unwrap().len())),
            );
        }
    }
    group.finish();
}

fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame-split");
    let codec = FrameCodec::default();

    let mut stream = BytesMut::new();
    for _ in 0..64 {
        stream.extend_from_slice(&codec.encode(&sample_message(256)).unwrap());
    }
    let stream = stream.freeze();

    group.throughput(Throughput::Elements(64));
    group.bench_function("split_64_frames", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&stream[..]);
            let mut frames = 0;
            while let Some(frame) = codec.split_frame(&mut buf).unwrap() {
                frames += black_box(frame.len()).min(1);
            }
            frames
        })
    });
    group.bench_function("decode_buffered_64_frames", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&stream[..]);
            black_box(codec.decode_buffered(&mut buf).unwrap().len())
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_split);
criterion_main!(benches);
