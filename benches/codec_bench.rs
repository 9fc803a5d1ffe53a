//! Criterion micro-benchmarks for the message codec.
//!
//! These measure the hot path of the apply loop: encoding a message into a
//! frame, and decoding a segment-shaped stream of concatenated frames.
//!
//! Run with: `cargo bench --bench codec_bench`

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use streambus::{Message, MessageDecoder, MessageType, TopicId};

fn message_with_payload(len: usize) -> Message {
    Message {
        kind: MessageType::new(0x0001),
        topic_id: TopicId::new(42),
        index: 1_000_000,
        data: Bytes::from(vec![0xAB; len]),
    }
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for payload_len in [64usize, 1024, 16 * 1024] {
        let message = message_with_payload(payload_len);
        group.throughput(Throughput::Bytes(message.encoded_len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_len),
            &message,
            |b, message| {
                b.iter(|| black_box(message.encode()));
            },
        );
    }
    group.finish();
}

fn bench_decode_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_stream");
    for payload_len in [64usize, 1024] {
        // A segment-shaped buffer of 256 concatenated frames.
        let mut stream = BytesMut::new();
        for i in 0..256u64 {
            let mut message = message_with_payload(payload_len);
            message.index = i + 1;
            message.encode_into(&mut stream);
        }
        let stream = stream.freeze();

        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_len),
            &stream,
            |b, stream| {
                b.iter(|| {
                    let mut decoder = MessageDecoder::new(&stream[..]);
                    let mut count = 0u64;
                    while let Some(message) = decoder.decode().unwrap() {
                        count += black_box(message.index > 0) as u64;
                    }
                    assert_eq!(count, 256);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode_stream);
criterion_main!(benches);
