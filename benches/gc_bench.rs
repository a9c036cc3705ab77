//! Allocator and collector benchmarks.
//!
//! Run with: `cargo bench --package colgc`

use colgc::config::{GcConfig, ThreadingModel};
use colgc::thread::GroupData;
use colgc::word::Word;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;

fn single_threaded_group() -> Arc<GroupData> {
    GroupData::new(GcConfig {
        threading_model: ThreadingModel::Single,
        ..Default::default()
    })
}

fn bench_config_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_validation");

    group.bench_function("default", |b| {
        b.iter(|| {
            let config = GcConfig::default();
            black_box(config.validate())
        })
    });

    group.bench_function("custom_valid", |b| {
        b.iter(|| {
            let config = GcConfig {
                gen_factor: 4,
                promote_fill_ratio: 0.75,
                ..Default::default()
            };
            black_box(config.validate())
        })
    });

    group.finish();
}

fn bench_single_cell_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_cell_allocation");

    let gc = single_threaded_group();
    let _member = gc.enter();

    group.throughput(Throughput::Elements(1));
    group.bench_function("alloc_1_cell", |b| {
        b.iter(|| black_box(gc.alloc_cells(1).unwrap()))
    });

    group.finish();
}

fn bench_multi_cell_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_cell_allocation");

    let gc = single_threaded_group();
    let _member = gc.enter();

    for &n_cells in &[1usize, 4, 16, 64] {
        group.throughput(Throughput::Elements(n_cells as u64));
        group.bench_function(format!("alloc_{n_cells}_cells"), |b| {
            b.iter(|| black_box(gc.alloc_cells(n_cells).unwrap()))
        });
    }

    group.finish();
}

fn bench_large_group_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("large_group_allocation");

    let gc = single_threaded_group();
    let _member = gc.enter();

    // Crosses AVAILABLE_CELLS_PER_PAGE, forcing a dedicated multi-page
    // cell group on every iteration.
    group.bench_function("alloc_200_cells", |b| {
        b.iter(|| black_box(gc.alloc_cells(200).unwrap()))
    });

    group.finish();
}

fn bench_preserve_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("preserve_release");

    let gc = single_threaded_group();
    let _member = gc.enter();
    let addr = gc.alloc_cells(1).unwrap();
    let word = Word::from_cell_addr(addr);

    group.bench_function("preserve", |b| {
        b.iter(|| black_box(gc.preserve(word)))
    });

    gc.preserve(word);
    group.bench_function("release", |b| {
        b.iter(|| black_box(gc.release(word)))
    });

    group.finish();
}

fn bench_forced_gc_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("forced_gc_cycle");

    group.bench_function("empty_pool_cycle", |b| {
        b.iter(|| {
            let gc = single_threaded_group();
            let _member = gc.enter();
            gc.pause_gc();
            gc.resume_gc();
        })
    });

    group.bench_function("one_eden_page_cycle", |b| {
        b.iter(|| {
            let gc = GroupData::new(GcConfig {
                threading_model: ThreadingModel::Single,
                gc_min_page_alloc: 1,
                gc_max_page_alloc: 1,
                gen_factor: 1,
                ..Default::default()
            });
            let _member = gc.enter();
            gc.alloc_cells(1).unwrap();
            gc.pause_gc();
            gc.resume_gc();
        })
    });

    group.finish();
}

fn bench_sustained_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("sustained_allocation");

    group.bench_function("1000_cells_default_threshold", |b| {
        b.iter(|| {
            let gc = single_threaded_group();
            let _member = gc.enter();
            for _ in 0..1000 {
                let _ = black_box(gc.alloc_cells(1).unwrap());
            }
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_config_validation,
    bench_single_cell_allocation,
    bench_multi_cell_allocation,
    bench_large_group_allocation,
    bench_preserve_release,
    bench_forced_gc_cycle,
    bench_sustained_allocation,
);
criterion_main!(benches);
