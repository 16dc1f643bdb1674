//! Benchmarks for the relay hot path
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use ws_adapter::broker::{InMemoryBroker, MessageHandler, PubSub};
use ws_adapter::channel::{subject_matches, Channel};
use ws_adapter::envelope::{CodecLimits, Envelope, EnvelopeCodec};
use ws_adapter::websocket::OutboundQueue;

fn create_envelope(size: usize) -> Envelope {
    Envelope::new(
        Channel::parse("temperature/room1").unwrap(),
        "thing-bench",
        "application/senml+json",
        vec![b'x'; size],
    )
}

fn bench_codec(c: &mut Criterion) {
    let codec = EnvelopeCodec::new(CodecLimits::default());
    let mut group = c.benchmark_group("codec");

    for size in [64, 1024, 65536] {
        let envelope = create_envelope(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("encode_{}", size), |b| {
            b.iter(|| codec.encode(black_box(&envelope)).unwrap())
        });

        let bytes = codec.encode(&envelope).unwrap();
        group.bench_function(format!("decode_{}", size), |b| {
            b.iter(|| codec.decode(black_box(&bytes)).unwrap())
        });
    }

    group.finish();
}

fn bench_channel(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel");

    group.bench_function("parse_subtopic", |b| {
        b.iter(|| Channel::parse(black_box("temperature/building-a/floor3/room1")).unwrap())
    });

    group.bench_function("subject_match_wildcard", |b| {
        b.iter(|| {
            subject_matches(
                black_box("channel.temperature.>"),
                black_box("channel.temperature.building-a.floor3.room1"),
            )
        })
    });

    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("outbound_queue");

    group.bench_function("push_pop", |b| {
        let queue = OutboundQueue::new(256);
        b.iter(|| {
            queue.push(black_box(1u64));
            queue.try_pop()
        })
    });

    group.bench_function("push_full", |b| {
        let queue = OutboundQueue::new(16);
        for i in 0..16u64 {
            queue.push(i);
        }
        b.iter(|| queue.push(black_box(99u64)))
    });

    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("broker");

    for subscribers in [1, 10, 100] {
        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_function(format!("publish_to_{}", subscribers), |b| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let broker = InMemoryBroker::default();
                    let channel = Channel::parse("temperature/room1").unwrap();
                    let mut handles = Vec::with_capacity(subscribers);
                    for _ in 0..subscribers {
                        let handler: MessageHandler = Box::new(|_event| {});
                        handles.push(broker.subscribe(&channel, handler).await.unwrap());
                    }

                    let envelope = create_envelope(256);
                    let start = std::time::Instant::now();

                    for _ in 0..iters {
                        broker.publish(black_box(&envelope)).await.unwrap();
                    }

                    start.elapsed()
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec, bench_channel, bench_queue, bench_fan_out);
criterion_main!(benches);
