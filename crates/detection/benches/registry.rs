//! Benchmarks for registry queries
//!
//! Measures snapshot cost for different registry sizes and filters:
//! - Unfiltered snapshot
//! - Vendor-only filter
//! - Exact vendor/product filter

use common::test_utils::create_mock_device_list;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use detection::{DeviceFilter, DeviceRegistry};

fn populated(count: u32) -> DeviceRegistry {
    let registry = DeviceRegistry::new();
    registry.replace_all(create_mock_device_list(count));
    registry
}

fn benchmark_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_find");

    for count in [8u32, 64, 512].iter() {
        let registry = populated(*count);
        group.throughput(Throughput::Elements(u64::from(*count)));

        group.bench_with_input(BenchmarkId::new("all", count), count, |b, _| {
            b.iter(|| registry.find(black_box(DeviceFilter::all())))
        });

        group.bench_with_input(BenchmarkId::new("vendor", count), count, |b, _| {
            b.iter(|| registry.find(black_box(DeviceFilter::new(0x1001, 0))))
        });

        group.bench_with_input(BenchmarkId::new("exact", count), count, |b, _| {
            b.iter(|| registry.find(black_box(DeviceFilter::new(0x1001, 0x2001))))
        });
    }

    group.finish();
}

fn benchmark_churn(c: &mut Criterion) {
    let registry = populated(64);
    let devices = create_mock_device_list(64);

    c.bench_function("registry_remove_add", |b| {
        b.iter(|| {
            let (key, record) = &devices[17];
            let removed = registry.remove(black_box(key));
            registry.add(key.clone(), removed.unwrap_or_else(|| record.clone()));
        })
    });
}

criterion_group!(benches, benchmark_find, benchmark_churn);
criterion_main!(benches);
