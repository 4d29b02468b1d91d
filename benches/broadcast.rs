use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use roomcast_relay::audio::{apply_pan, frame_bytes, Broadcaster};

fn bench_publish(c: &mut Criterion) {
    let frame = Bytes::from(vec![0x5au8; frame_bytes(48000)]);
    let mut group = c.benchmark_group("publish");

    for subscribers in [1usize, 8, 64] {
        let broadcaster = Broadcaster::new(50);
        let _queues: Vec<_> = (0..subscribers).map(|_| broadcaster.subscribe()).collect();

        // Queues are never drained, so this measures the overflow path
        group.bench_with_input(BenchmarkId::from_parameter(subscribers), &frame, |b, frame| {
            b.iter(|| broadcaster.publish(black_box(frame.clone())));
        });
    }
    group.finish();
}

fn bench_pan(c: &mut Criterion) {
    let frame = Bytes::from(vec![0x5au8; frame_bytes(48000)]);
    c.bench_function("pan_frame", |b| {
        b.iter(|| apply_pan(black_box(frame.clone()), black_box(0.35)));
    });
}

criterion_group!(benches, bench_publish, bench_pan);
criterion_main!(benches);
