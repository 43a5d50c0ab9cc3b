//! Criterion benchmarks for partitioning and host-backed dispatch.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sgocl_common::OclConfig;
use sgocl_dispatch::{Dataset, DispatchEngine, GridLayout, GridPoint, LinearLoadBalancer, reference};
use sgocl_runtime::{DeviceManager, HostBackend};
use std::hint::black_box;

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// Full 2-d grid of levels `1..=max_level` per dimension.
fn full_grid(max_level: u32) -> Vec<GridPoint> {
    let mut points = Vec::new();
    for l0 in 1..=max_level {
        for l1 in 1..=max_level {
            for i0 in (1..1u32 << l0).step_by(2) {
                for i1 in (1..1u32 << l1).step_by(2) {
                    points.push(GridPoint::new(vec![l0, l1], vec![i0, i1]));
                }
            }
        }
    }
    points
}

fn dataset(points: usize) -> Dataset<f64> {
    let rows: Vec<f64> = (0..points * 2).map(|i| ((i * 7919) % 1000) as f64 / 1000.0).collect();
    Dataset::from_rows(2, &rows).expect("dataset")
}

// ---------------------------------------------------------------------------
// Partitioning
// ---------------------------------------------------------------------------

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_segments");
    for devices in [1usize, 4, 16] {
        let mut lb = LinearLoadBalancer::new(devices, false);
        let timings: Vec<f64> = (1..=devices).map(|d| d as f64).collect();
        lb.update(&timings).expect("update");
        group.bench_with_input(BenchmarkId::from_parameter(devices), &lb, |b, lb| {
            b.iter(|| lb.partition_segments(black_box(0), black_box(1 << 20), 64).expect("partition"));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn bench_mult(c: &mut Criterion) {
    let (grid, _) = GridLayout::<f64>::from_points(2, &full_grid(4)).expect("grid");
    let alpha: Vec<f64> = (0..grid.grid_size()).map(|g| g as f64 * 0.01).collect();

    let mut group = c.benchmark_group("host_mult");
    for devices in [1usize, 2, 4] {
        let data = dataset(4096);
        let host = HostBackend::uniform(devices).with_kernels(reference::kernels::<f64>());
        let manager = DeviceManager::new(host, OclConfig::default()).expect("manager");
        let mut engine = DispatchEngine::<f64>::new(manager, 2).expect("engine");
        let mut result = vec![0.0; data.size()];

        group.throughput(Throughput::Elements(data.size() as u64));
        group.bench_function(BenchmarkId::from_parameter(devices), |b| {
            b.iter(|| {
                engine
                    .mult(&grid, &data, &alpha, &mut result, 0..grid.num_subspaces(), 0..data.size())
                    .expect("mult")
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_partition, bench_mult);
criterion_main!(benches);
