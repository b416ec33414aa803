//! # Handoff Benchmark
//!
//! Measures:
//! 1. Publish + consume + release on one thread (the uncontended handoff cost)
//! 2. Slot refill from simulation arrays at realistic sizes
//! 3. Cross-thread throughput with a parked consumer

#![allow(missing_docs)]

use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tandem_handoff::{channel, FinishMode, Float4, HandoffConfig, OverwritePolicy, SnapshotSlot, WaitStrategy};

fn bench_publish_consume(c: &mut Criterion) {
    let mut group = c.benchmark_group("handoff_cycle");

    let (mut producer, consumer) = channel(HandoffConfig::default());
    group.bench_function("publish_consume_release", |b| {
        b.iter(|| {
            let slot = producer.acquire_slot(0);
            producer.publish(slot).unwrap();
            let drained = consumer.try_consume().unwrap();
            black_box(drained.simulation_time());
        });
    });

    group.finish();
}

fn bench_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_fill");

    for count in [1_024, 65_536, 1_048_576] {
        group.throughput(Throughput::Elements(count as u64));
        let positions = vec![Float4::new(1.0, 2.0, 3.0, 1.0); count];
        let velocities = vec![Float4::ZERO; count];
        let ids: Vec<u64> = (0..count as u64).collect();
        let mut slot = SnapshotSlot::with_capacity(count);

        group.bench_with_input(BenchmarkId::new("fill_from", count), &count, |b, _| {
            b.iter(|| {
                slot.fill_from(black_box(1.0), &positions, &velocities, &ids).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_cross_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("handoff_threads");
    const SNAPSHOTS: u64 = 1_000;
    group.throughput(Throughput::Elements(SNAPSHOTS));

    group.bench_function("block_producer_park", |b| {
        b.iter(|| {
            let (mut producer, consumer) = channel(HandoffConfig {
                policy: OverwritePolicy::BlockProducer,
                wait: WaitStrategy::Park,
                ..HandoffConfig::default()
            });
            let reader = thread::spawn(move || {
                let mut drained = 0u64;
                while consumer.consume_blocking().is_some() {
                    drained += 1;
                }
                drained
            });
            for _ in 0..SNAPSHOTS {
                let slot = producer.acquire_slot(16);
                producer.publish(slot).unwrap();
            }
            let _ = producer.finish(FinishMode::Drain);
            black_box(reader.join().unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_publish_consume, bench_fill, bench_cross_thread);
criterion_main!(benches);
