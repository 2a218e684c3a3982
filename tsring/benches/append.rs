//! Microbenchmarks for the append path.
//!
//! Measures buffered in-order appends, appends to a resident series and the
//! cost of flushing buffered appends to disk.
//!
//! Run with: `cargo bench -p tsring -- append`

#![allow(missing_docs, clippy::cast_precision_loss)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tempfile::tempdir;
use tsring::item::Item;
use tsring::store::Store;
use tsring::{SeriesHandle, StoreConfig};

/// Creates a store whose timers never fire during a measurement.
fn setup_store(series_count: u32, length: usize) -> (Store, Vec<Arc<SeriesHandle>>, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let config = StoreConfig {
        append_period: Duration::from_secs(3600),
        rewrite_period: Duration::from_secs(3600),
        ..StoreConfig::default()
    };
    let store = Store::open(temp_dir.path().join("bench_store"), config).unwrap();

    let handles = (0..series_count)
        .map(|i| store.series(&format!("metric_{i}"), "", Some(length)).unwrap())
        .collect();

    (store, handles, temp_dir)
}

fn bench_append_buffered(c: &mut Criterion) {
    let (_store, handles, _dir) = setup_store(1, 10_000);
    let series = &handles[0];
    let mut ts = 1_700_000_000_000i64;

    c.bench_function("append/buffered", |b| {
        b.iter(|| {
            ts += 1_000;
            series.append(black_box(Item::new(ts, 42.5))).unwrap();
        });
    });
}

fn bench_append_resident(c: &mut Criterion) {
    let (_store, handles, _dir) = setup_store(1, 10_000);
    let series = &handles[0];
    series.snapshot().unwrap();
    let mut ts = 1_700_000_000_000i64;

    c.bench_function("append/resident", |b| {
        b.iter(|| {
            ts += 1_000;
            series.append(black_box(Item::new(ts, 42.5))).unwrap();
        });
    });
}

fn bench_append_many_series(c: &mut Criterion) {
    let mut group = c.benchmark_group("append/series_count");

    for count in [1, 10, 100] {
        let (_store, handles, _dir) = setup_store(count, 1_000);
        let mut ts = 1_700_000_000_000i64;

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                ts += 1_000;
                for (i, series) in handles.iter().enumerate() {
                    series.append(black_box(Item::new(ts, i as f64))).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_flush_appends(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush/buffered_items");

    for batch in [1usize, 100, 1_000] {
        let (_store, handles, _dir) = setup_store(1, 10_000);
        let series = &handles[0];
        let mut ts = 1_700_000_000_000i64;

        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                for _ in 0..batch {
                    ts += 1_000;
                    series.append(Item::new(ts, 1.0)).unwrap();
                }
                series.flush().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_append_buffered,
    bench_append_resident,
    bench_append_many_series,
    bench_flush_appends,
);
criterion_main!(benches);
