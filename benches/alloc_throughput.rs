use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use segalloc::{FixedRegion, Heap};

const OPS: u64 = 100_000;

/// segalloc allocate/release throughput over a pre-reserved arena.
fn segalloc_allocate_release(heap: &mut Heap<FixedRegion>, size: usize) {
    for _ in 0..OPS {
        let ptr = heap.allocate(size).unwrap();
        black_box(ptr);
        unsafe { heap.release(ptr) };
    }
}

/// libc alloc/free throughput, as a baseline.
#[cfg(unix)]
fn libc_malloc_free(size: usize) {
    for _ in 0..OPS {
        unsafe {
            let ptr = libc::malloc(size);
            black_box(ptr);
            libc::free(ptr);
        }
    }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_throughput");

    for size in [16, 64, 256, 1024, 4096] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("segalloc", size), &size, |b, &size| {
            let mut heap = Heap::init(FixedRegion::new(1 << 20)).unwrap();
            b.iter(|| segalloc_allocate_release(&mut heap, size))
        });

        #[cfg(unix)]
        group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
            b.iter(|| libc_malloc_free(size))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
