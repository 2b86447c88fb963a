//! Benchmarks for the heap allocator
//!
//! - Sequential: every allocation lands after the last one (the fast path)
//! - Fragmented: every other chunk is freed first, so allocations fall back to the gap scan

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use dagal::device::TestDevice;
use dagal::resource::BufferUsage;
use dare_transfer::Heap;
use std::hint::black_box;
use std::sync::Arc;

fn heap(size: u64) -> Heap<TestDevice> {
    Heap::new(
        Arc::new(TestDevice::new()),
        0,
        "bench heap",
        size,
        BufferUsage::STORAGE,
    )
    .unwrap()
}

fn benchmark_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_allocate_sequential");
    for count in [100u64, 1000, 10000].iter() {
        let heap = heap(count * 256);
        group.bench_with_input(BenchmarkId::new("Heap", count), count, |b, &count| {
            b.iter(|| {
                let chunks: Vec<_> = (0..count)
                    .map(|_| heap.try_allocate(black_box(200), black_box(64)).unwrap())
                    .collect();
                black_box(chunks)
            });
        });
    }
    group.finish();
}

fn benchmark_fragmented(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_allocate_fragmented");
    for count in [100u64, 1000].iter() {
        let heap = heap(count * 256);
        group.bench_with_input(BenchmarkId::new("Heap", count), count, |b, &count| {
            b.iter(|| {
                let mut chunks: Vec<_> = (0..count)
                    .map(|_| heap.try_allocate(256, 1).unwrap())
                    .collect();
                // free every other chunk, leaving 256 byte holes
                let mut index = 0;
                chunks.retain(|_| {
                    index += 1;
                    index % 2 == 0
                });
                let refill: Vec<_> = (0..count / 2)
                    .map(|_| heap.try_allocate(black_box(128), black_box(128)).unwrap())
                    .collect();
                black_box((chunks, refill))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_sequential, benchmark_fragmented);
criterion_main!(benches);
