use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rc_link::metrics::Metrics;
use rc_link::queue::MessageQueue;
use rc_link::receiver::{Receiver, NETWORK_TYPES, RADIO_TYPES};
use rc_link::transmitter::RetryPolicy;
use rc_link::{Message, NodeAddress, Payload};

fn sample_message() -> Message {
    let from = NodeAddress::new([0x24, 0x6F, 0x28, 0x01, 0x02, 0x03]);
    let payload = Payload::new([1, 2, 3, 4], [0.5, -0.5, 1.0, 0.0, 2.5], 0x05);
    Message::data(from, &payload)
}

fn benchmark_encode(c: &mut Criterion) {
    let msg = sample_message();

    c.bench_function("encode_message", |b| {
        b.iter(|| black_box(&msg).to_bytes());
    });
}

fn benchmark_parse(c: &mut Criterion) {
    let bytes = sample_message().to_bytes();
    let short = [0u8; 20];

    c.bench_function("parse_radio_frame", |b| {
        b.iter(|| Receiver::parse_frame(black_box(&bytes), RADIO_TYPES));
    });

    c.bench_function("parse_and_read_payload", |b| {
        b.iter(|| {
            Receiver::parse_or_discard(black_box(&bytes), NETWORK_TYPES)
                .and_then(|msg| msg.payload())
        });
    });

    c.bench_function("reject_short_frame", |b| {
        b.iter(|| Receiver::parse_frame(black_box(&short), RADIO_TYPES));
    });
}

fn benchmark_queue(c: &mut Criterion) {
    let msg = sample_message();
    let queue = MessageQueue::new(10);

    c.bench_function("queue_push_pop", |b| {
        b.iter(|| {
            black_box(queue.try_push(black_box(msg)));
            queue.try_pop()
        });
    });

    c.bench_function("queue_evict_oldest_when_full", |b| {
        while queue.try_push(msg) {}
        b.iter(|| queue.push_evict_oldest(black_box(msg)));
    });
}

fn benchmark_metrics(c: &mut Criterion) {
    let metrics = Metrics::new();

    c.bench_function("metrics_record", |b| {
        b.iter(|| {
            metrics.add_success();
            metrics.add_failure();
        });
    });

    c.bench_function("metrics_snapshot", |b| {
        b.iter(|| black_box(&metrics).snapshot());
    });

    c.bench_function("retry_backoff_delay", |b| {
        let policy = RetryPolicy::new(10, 100).with_backoff(2, 10_000);
        b.iter(|| {
            for attempt in 0..10 {
                black_box(policy.delay_for(attempt));
            }
        });
    });
}

criterion_group!(
    benches,
    benchmark_encode,
    benchmark_parse,
    benchmark_queue,
    benchmark_metrics
);
criterion_main!(benches);
