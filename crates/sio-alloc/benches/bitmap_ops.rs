//! Benchmark: bitmap scans on a mostly full pool.
//!
//! Compares the byte-skipping `bitmap_find_free` against
//! `RawBitmap::find_contiguous`, and measures a full allocate/free cycle
//! through `Allocator`.

use asupersync::Cx;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sio_alloc::{
    bitmap_count_free, bitmap_find_free, Allocator, AllocatorLayout, PersistentStorage, RawBitmap,
};
use sio_block::WriteTxn;

const UNITS: u32 = 32_768;

/// 4096-byte bitmap, about 5% free in 32-unit clusters.
fn make_bitmap() -> Vec<u8> {
    let mut bm = vec![0xFF_u8; (UNITS / 8) as usize];
    let mut pos = 100_usize;
    while pos + 32 < UNITS as usize {
        for i in pos..pos + 32 {
            bm[i / 8] &= !(1 << (i % 8));
        }
        pos += 650;
    }
    bm
}

fn bench_scans(c: &mut Criterion) {
    let bm = make_bitmap();
    let mut group = c.benchmark_group("scan");

    group.bench_function("count_free", |b| {
        b.iter(|| black_box(bitmap_count_free(black_box(&bm), UNITS)));
    });

    group.bench_function("find_free", |b| {
        b.iter(|| black_box(bitmap_find_free(black_box(&bm), UNITS, black_box(16_000))));
    });

    let map = RawBitmap::from_bytes(bm.clone(), UNITS).unwrap();
    group.bench_function("find_contiguous_16", |b| {
        b.iter(|| black_box(black_box(&map).find_contiguous(16)));
    });

    group.finish();
}

fn bench_allocate_free(c: &mut Criterion) {
    let cx = Cx::for_testing();
    let layout = AllocatorLayout {
        bitmap_blocks_max: 8,
        units_per_extend: UNITS,
        ..AllocatorLayout::default()
    };
    let mut storage = PersistentStorage::new(layout, 4096).unwrap();
    let mut map = RawBitmap::default();
    storage
        .format(&cx, &mut WriteTxn::new(), &mut map, UNITS)
        .unwrap();
    let mut alloc = Allocator::new(storage, map, Box::new(|_| Err(sio_error::SioError::NoSpace)))
        .unwrap();

    c.bench_function("allocate_free_cycle", |b| {
        b.iter(|| {
            let mut txn = WriteTxn::new();
            let unit = alloc.allocate(&cx, &mut txn).unwrap();
            alloc.free(&cx, &mut txn, black_box(unit)).unwrap();
            black_box(txn.len())
        });
    });
}

criterion_group!(benches, bench_scans, bench_allocate_free);
criterion_main!(benches);
