//! Full Collection Benchmarks
//!
//! Measures the cost of a full mark-compact cycle over heaps of different
//! shapes.
//!
//! # Benchmark Categories
//!
//! 1. **Marking**: wide and deep live graphs, with a roomy and a tiny deque
//! 2. **Sweeping**: mostly dead old space, lazy versus eager
//! 3. **Compaction**: fragmented old space evacuated by the cycle
//! 4. **Nursery**: live young objects evacuated and promoted

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use prism_mark_compact::{GcConfig, Heap, MarkCompactCollector, Pretenure, Tagged};

// =============================================================================
// Benchmark Helpers
// =============================================================================

fn heap_with(config: GcConfig) -> Heap {
    Heap::new(config).expect("heap")
}

/// A rooted array holding `width` small arrays.
fn build_wide(heap: &mut Heap, width: usize) {
    let parent = heap.allocate_fixed_array(width, Pretenure::Tenured).expect("parent");
    for index in 0..width {
        let child = heap.allocate_fixed_array(1, Pretenure::Tenured).expect("child");
        heap.fixed_array_set(parent, index, child.to_tagged());
    }
    heap.push_stack(parent.to_tagged());
}

/// A rooted linked list of `length` cells.
fn build_list(heap: &mut Heap, length: usize) {
    let mut next = Tagged::NULL;
    for _ in 0..length {
        let cell = heap.allocate_fixed_array(1, Pretenure::Tenured).expect("cell");
        heap.fixed_array_set(cell, 0, next);
        next = cell.to_tagged();
    }
    heap.push_stack(next);
}

/// `count` 512-byte tenured arrays, every `keep_every`-th one rooted.
fn build_fragmented(heap: &mut Heap, count: usize, keep_every: usize) {
    for index in 0..count {
        let array = heap.allocate_fixed_array(61, Pretenure::Tenured).expect("array");
        if index % keep_every == 0 {
            heap.push_stack(array.to_tagged());
        }
    }
}

// =============================================================================
// Marking Benchmarks
// =============================================================================

fn bench_marking(c: &mut Criterion) {
    let mut group = c.benchmark_group("marking");

    for &size in &[1_000usize, 10_000] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("wide", size), &size, |b, &size| {
            let mut heap = heap_with(GcConfig::default());
            build_wide(&mut heap, size);
            let mut collector = MarkCompactCollector::new();
            b.iter(|| collector.collect_garbage(black_box(&mut heap)));
        });

        group.bench_with_input(BenchmarkId::new("deep", size), &size, |b, &size| {
            let mut heap = heap_with(GcConfig::default());
            build_list(&mut heap, size);
            let mut collector = MarkCompactCollector::new();
            b.iter(|| collector.collect_garbage(black_box(&mut heap)));
        });

        // Every other push overflows; recovery rescans the pages.
        group.bench_with_input(BenchmarkId::new("wide_tiny_deque", size), &size, |b, &size| {
            let mut heap = heap_with(GcConfig {
                marking_deque_capacity: 16,
                ..GcConfig::default()
            });
            build_wide(&mut heap, size);
            let mut collector = MarkCompactCollector::new();
            b.iter(|| collector.collect_garbage(black_box(&mut heap)));
        });
    }

    group.finish();
}

// =============================================================================
// Sweeping Benchmarks
// =============================================================================

fn bench_sweeping(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweeping");
    group.sample_size(20);

    for (name, lazy) in [("eager", false), ("lazy", true)] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let mut heap = heap_with(GcConfig {
                        lazy_sweeping: lazy,
                        compact: false,
                        ..GcConfig::default()
                    });
                    build_fragmented(&mut heap, 2_000, 10);
                    heap
                },
                |mut heap| {
                    MarkCompactCollector::new().collect_garbage(&mut heap);
                    heap
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

// =============================================================================
// Compaction Benchmarks
// =============================================================================

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compaction");
    group.sample_size(20);

    group.bench_function("fragmented_old_space", |b| {
        b.iter_batched(
            || {
                let mut heap = heap_with(GcConfig {
                    lazy_sweeping: false,
                    ..GcConfig::default()
                });
                build_fragmented(&mut heap, 2_000, 4);
                let mut collector = MarkCompactCollector::new();
                // Pages report fragmentation only once swept.
                collector.collect_garbage(&mut heap);
                (heap, collector)
            },
            |(mut heap, mut collector)| {
                collector.collect_garbage(&mut heap);
                heap
            },
            criterion::BatchSize::LargeInput,
        );
    });

    group.finish();
}

// =============================================================================
// Nursery Benchmarks
// =============================================================================

fn bench_nursery(c: &mut Criterion) {
    let mut group = c.benchmark_group("nursery");

    group.bench_function("promote_live_young", |b| {
        b.iter_batched(
            || {
                let mut heap = heap_with(GcConfig::default());
                for _ in 0..500 {
                    let array = heap.allocate_fixed_array(4, Pretenure::NotTenured).expect("array");
                    heap.push_stack(array.to_tagged());
                }
                heap
            },
            |mut heap| {
                MarkCompactCollector::new().collect_garbage(&mut heap);
                heap
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

// =============================================================================
// Criterion Groups
// =============================================================================

criterion_group!(
    collection_benches,
    bench_marking,
    bench_sweeping,
    bench_compaction,
    bench_nursery,
);

criterion_main!(collection_benches);
