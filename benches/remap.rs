//! Benchmarks for the view remap path.
//!
//! Measures the cost of a full map+unmap cycle, remapping over an existing view and
//! plain typed access, since remap throughput is what bounds punch-in/punch-out heavy
//! workloads.

extern crate vmview;

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use vmview::{page_size, MemoryAllocationFlags, MemoryBlock};

fn viewer_flags() -> MemoryAllocationFlags {
    MemoryAllocationFlags::RESERVE | MemoryAllocationFlags::VIEW_COMPATIBLE
}

/// Benchmark a single-page map+unmap cycle at a fixed offset.
fn bench_map_unmap_cycle(c: &mut Criterion) {
    let page = page_size();
    let backing = MemoryBlock::new(page * 16, MemoryAllocationFlags::MIRRORABLE).unwrap();
    let viewer = MemoryBlock::new(page * 16, viewer_flags()).unwrap();

    c.bench_function("map_unmap_single_page", |b| {
        b.iter(|| {
            viewer
                .map_view(&backing, 0, black_box(page * 4), page)
                .unwrap();
            viewer.unmap_view(&backing, page * 4, page).unwrap();
        });
    });
}

/// Benchmark retargeting a range that is already mapped, the punch-in fast path.
fn bench_remap_over_existing_view(c: &mut Criterion) {
    let page = page_size();
    let backing = MemoryBlock::new(page * 16, MemoryAllocationFlags::MIRRORABLE).unwrap();
    let viewer = MemoryBlock::new(page * 16, viewer_flags()).unwrap();

    viewer.map_view(&backing, 0, 0, page * 8).unwrap();

    let mut source = 0;
    c.bench_function("remap_over_existing_view", |b| {
        b.iter(|| {
            source = (source + page) % (page * 8);
            viewer
                .map_view(&backing, black_box(source), page * 2, page)
                .unwrap();
        });
    });
}

/// Benchmark typed access through a mapped view.
fn bench_typed_access(c: &mut Criterion) {
    let page = page_size();
    let backing = MemoryBlock::new(page * 4, MemoryAllocationFlags::MIRRORABLE).unwrap();
    let viewer = MemoryBlock::new(page * 4, viewer_flags()).unwrap();

    viewer.map_view(&backing, 0, 0, page * 4).unwrap();

    c.bench_function("aliased_write_read_u64", |b| {
        b.iter(|| {
            viewer.write(black_box(0x40), 0xDEAD_BEEFu64).unwrap();
            black_box(backing.read::<u64>(0x40).unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_map_unmap_cycle,
    bench_remap_over_existing_view,
    bench_typed_access
);
criterion_main!(benches);
