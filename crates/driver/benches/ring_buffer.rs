//! Benchmarks for the report ring
//!
//! Measures the hot paths of the inbound side:
//! - Pushing into a ring that is already full (overwrite)
//! - Draining one frame at a time
//! - Draining with wheel coalescing

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use driver::RingBuffer;
use protocol::Frame;

fn wheel(delta: i8) -> Frame {
    Frame::new([0x00, 0x01, 0x00, 0x00, 0x00, 0x00, delta as u8, 0x00])
}

fn button(mask: u32) -> Frame {
    let b = mask.to_be_bytes();
    Frame::new([0x00, 0x01, b[0], b[1], b[2], b[3], 0x00, 0x00])
}

fn benchmark_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("push");

    for capacity in [16usize, 1000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("overwrite", capacity),
            &capacity,
            |b, &capacity| {
                let mut ring = RingBuffer::with_capacity(capacity).unwrap();
                for i in 0..capacity as u32 {
                    ring.push(button(i));
                }
                b.iter(|| ring.push(black_box(button(7))))
            },
        );
    }

    group.finish();
}

fn benchmark_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain");
    let capacity = 1000usize;
    group.throughput(Throughput::Elements(capacity as u64));

    group.bench_function("pop_buttons", |b| {
        b.iter_batched(
            || {
                let mut ring = RingBuffer::with_capacity(capacity).unwrap();
                for i in 0..capacity as u32 {
                    ring.push(button(i));
                }
                ring
            },
            |mut ring| {
                while let Some(frame) = ring.pop() {
                    black_box(frame);
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.bench_function("pop_coalesced_wheel", |b| {
        b.iter_batched(
            || {
                let mut ring = RingBuffer::with_capacity(capacity).unwrap();
                for i in 0..capacity {
                    // alternate direction every 8 frames so merges stay in range
                    ring.push(wheel(if (i / 8) % 2 == 0 { 1 } else { -1 }));
                }
                ring
            },
            |mut ring| {
                while let Some(frame) = ring.pop_coalesced() {
                    black_box(frame);
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, benchmark_push, benchmark_drain);
criterion_main!(benches);
