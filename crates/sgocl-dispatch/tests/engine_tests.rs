//! End-to-end dispatch on simulated devices.

use approx::assert_relative_eq;
use sgocl_common::logging::init_tracing;
use sgocl_common::{ClStatus, OclConfig, OclError, PlatformSelector, Precision};
use sgocl_dispatch::{
    Dataset, DispatchEngine, DispatchState, GridLayout, GridPoint, Operation, SubspaceKind, reference,
};
use sgocl_runtime::{DeviceManager, HostBackend, HostCall, HostDeviceSpec, HostTraceHandle, KernelArg};

const LOCAL: usize = 64;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Regular 2-d sparse grid of level sum <= 4 plus an incomplete level (4, 1)
/// subspace so both record kinds are exercised.
fn grid_points() -> Vec<GridPoint> {
    let mut points = Vec::new();
    for l0 in 1..=3u32 {
        for l1 in 1..=3u32 {
            if l0 + l1 > 4 {
                continue;
            }
            for i0 in (1..1u32 << l0).step_by(2) {
                for i1 in (1..1u32 << l1).step_by(2) {
                    points.push(GridPoint::new(vec![l0, l1], vec![i0, i1]));
                }
            }
        }
    }
    for i0 in [1, 5, 9] {
        points.push(GridPoint::new(vec![4, 1], vec![i0, 1]));
    }
    points
}

fn phi(point: &GridPoint, x: &[f64]) -> f64 {
    point
        .level
        .iter()
        .zip(&point.index)
        .zip(x)
        .map(|((&l, &i), &xd)| (1.0 - (f64::from(1u32 << l) * xd - f64::from(i)).abs()).max(0.0))
        .product()
}

/// Deterministic points in `[0, 1)^2`, row-major.
fn rows(n: usize) -> Vec<f64> {
    let mut state = 0x2545_f491_u64;
    (0..n * 2)
        .map(|_| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
            (state >> 11) as f64 / (1u64 << 53) as f64
        })
        .collect()
}

struct Fixture {
    points: Vec<GridPoint>,
    slots: Vec<usize>,
    grid: GridLayout<f64>,
    dataset: Dataset<f64>,
}

fn fixture(n: usize) -> Fixture {
    let points = grid_points();
    let (grid, slots) = GridLayout::from_points(2, &points).unwrap();
    let dataset = Dataset::from_rows(2, &rows(n)).unwrap();
    Fixture { points, slots, grid, dataset }
}

fn alpha_for(grid: &GridLayout<f64>) -> Vec<f64> {
    (0..grid.grid_size()).map(|g| 0.25 + 0.1 * g as f64).collect()
}

fn host(specs: Vec<HostDeviceSpec>) -> HostBackend {
    HostBackend::new(specs).with_kernels(reference::kernels::<f64>())
}

fn engine_on(host: HostBackend, config: OclConfig) -> (DispatchEngine<f64>, HostTraceHandle) {
    let trace = host.trace();
    let manager = DeviceManager::new(host, config).unwrap();
    (DispatchEngine::new(manager, 2).unwrap(), trace)
}

fn uniform_engine(devices: usize) -> (DispatchEngine<f64>, HostTraceHandle) {
    let specs = (0..devices).map(|d| HostDeviceSpec::new(format!("dev{d}"))).collect();
    engine_on(host(specs), OclConfig::default())
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

#[test]
fn fixture_has_direct_and_stream_records() {
    let f = fixture(LOCAL);
    let kinds: Vec<_> = (0..f.grid.num_subspaces()).map(|s| f.grid.descriptor(s).unwrap().kind).collect();
    assert!(kinds.contains(&SubspaceKind::Direct));
    assert!(kinds.contains(&SubspaceKind::Stream));
    assert_eq!(f.grid.grid_size(), f.points.len());
}

// ---------------------------------------------------------------------------
// mult
// ---------------------------------------------------------------------------

#[test]
fn mult_matches_pointwise_evaluation() {
    let f = fixture(6 * LOCAL);
    let alpha = alpha_for(&f.grid);
    let (mut engine, trace) = uniform_engine(3);

    let mut result = vec![0.0; f.dataset.size()];
    let n = f.grid.num_subspaces();
    let elapsed = engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..n, 0..f.dataset.size()).unwrap();

    assert!(elapsed > 0.0);
    assert_eq!(engine.state(), DispatchState::ResultsGathered);
    assert_eq!(trace.launch_count(), 3);
    assert!(trace.launches().iter().all(|l| l.dims.global_size == 2 * LOCAL));
    for (j, r) in result.iter().enumerate() {
        let x = f.dataset.point(j);
        let expected: f64 = f.points.iter().zip(&f.slots).map(|(p, &slot)| alpha[slot] * phi(p, &x)).sum();
        assert_relative_eq!(*r, expected, epsilon = 1e-12);
    }
}

#[test]
fn short_range_leaves_the_last_device_idle() {
    let f = fixture(4 * LOCAL);
    let alpha = alpha_for(&f.grid);
    let (mut engine, trace) = uniform_engine(3);
    let mut result = vec![0.0; f.dataset.size()];
    let n = f.grid.num_subspaces();

    // 256 / 3 rounds up to two blocks per device, so device 2 gets nothing.
    engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..n, 0..f.dataset.size()).unwrap();
    let launches = trace.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches.iter().map(|l| l.device).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(launches[1].dims.global_offset + launches[1].dims.global_size, 4 * LOCAL);
    assert_eq!(engine.last_timings(Operation::Mult)[2], 0.0);
    let x = f.dataset.point(4 * LOCAL - 1);
    assert_relative_eq!(result[4 * LOCAL - 1], f.grid.evaluate(&alpha, 0..n, &x), epsilon = 1e-12);
}

#[test]
fn mult_writes_only_the_data_range() {
    let f = fixture(4 * LOCAL);
    let alpha = alpha_for(&f.grid);
    let (mut engine, _) = uniform_engine(2);

    let mut result = vec![-1.0; f.dataset.size()];
    engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..f.grid.num_subspaces(), LOCAL..3 * LOCAL).unwrap();

    assert!(result[..LOCAL].iter().all(|&r| r == -1.0));
    assert!(result[3 * LOCAL..].iter().all(|&r| r == -1.0));
    let x = f.dataset.point(LOCAL);
    assert_relative_eq!(result[LOCAL], f.grid.evaluate(&alpha, 0..f.grid.num_subspaces(), &x), epsilon = 1e-12);
}

#[test]
fn mult_binds_all_subspaces_as_end_grid() {
    let f = fixture(LOCAL);
    let alpha = alpha_for(&f.grid);
    let n = f.grid.num_subspaces();
    let (mut engine, trace) = uniform_engine(1);

    // A grid range ending at subspace 1 still evaluates every subspace.
    let mut result = vec![0.0; f.dataset.size()];
    engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..1, 0..LOCAL).unwrap();

    let launch = &trace.launches()[0];
    assert_eq!(launch.entry, "multOCL");
    assert_eq!(launch.args[7], KernelArg::U32(0));
    assert_eq!(launch.args[8], KernelArg::U32(n as u32));
    assert_eq!(launch.args[9], KernelArg::U32(n as u32));
    let x = f.dataset.point(5);
    assert_relative_eq!(result[5], f.grid.evaluate(&alpha, 0..n, &x), epsilon = 1e-12);

    // The start of the grid range is honoured.
    engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 2..3, 0..LOCAL).unwrap();
    assert_relative_eq!(result[5], f.grid.evaluate(&alpha, 2..n, &x), epsilon = 1e-12);
}

#[test]
fn empty_ranges_are_no_ops() {
    let f = fixture(LOCAL);
    let alpha = alpha_for(&f.grid);
    let (mut engine, trace) = uniform_engine(2);
    let mut result = vec![7.0; f.dataset.size()];

    assert_eq!(engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..3, 32..32).unwrap(), 0.0);
    assert_eq!(engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 2..2, 0..LOCAL).unwrap(), 0.0);
    let mut grid_result = vec![7.0; f.grid.grid_size()];
    let source = vec![1.0; f.dataset.size()];
    assert_eq!(engine.mult_transpose(&f.grid, &f.dataset, &source, &mut grid_result, 0..3, 0..0).unwrap(), 0.0);

    assert_eq!(trace.launch_count(), 0);
    assert_eq!(trace.programs_built(), 0);
    assert_eq!(engine.state(), DispatchState::Uninitialized);
    assert!(result.iter().chain(&grid_result).all(|&r| r == 7.0));
}

#[test]
fn unaligned_data_range_is_a_config_error() {
    let f = fixture(2 * LOCAL);
    let alpha = alpha_for(&f.grid);
    let (mut engine, trace) = uniform_engine(2);
    let mut result = vec![0.0; f.dataset.size()];

    let err = engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..1, 0..LOCAL + 3).unwrap_err();
    assert!(matches!(err, OclError::InvalidArgument(_)));
    assert!(!err.is_fatal());
    assert_eq!(trace.programs_built(), 0);
}

// ---------------------------------------------------------------------------
// Load balancing through the engine
// ---------------------------------------------------------------------------

#[test]
fn slower_device_receives_less_work_next_time() {
    init_tracing("sgocl_dispatch=debug");
    let f = fixture(16 * LOCAL);
    let alpha = alpha_for(&f.grid);
    let specs = vec![HostDeviceSpec::new("fast"), HostDeviceSpec::new("slow").with_throughput(5e8)];
    let (mut engine, trace) = engine_on(host(specs), OclConfig::default());
    let mut result = vec![0.0; f.dataset.size()];
    let n = f.grid.num_subspaces();

    engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..n, 0..1024).unwrap();
    let first = trace.launches();
    assert_eq!(first[0].dims.global_offset, 0);
    assert_eq!(first[0].dims.global_size, 512);
    assert_eq!(first[1].dims.global_offset, 512);
    assert_eq!(first[1].dims.global_size, 512);

    let timings = engine.last_timings(Operation::Mult);
    assert_relative_eq!(timings[1], 2.0 * timings[0], epsilon = 1e-15);
    assert_relative_eq!(engine.partition_weights(Operation::Mult)[0], 2.0 / 3.0, epsilon = 1e-9);
    // The transpose balancer is independent.
    assert_eq!(engine.partition_weights(Operation::MultTranspose), &[0.5, 0.5]);

    trace.clear_launches();
    engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..n, 0..1024).unwrap();
    let second = trace.launches();
    assert!(second[0].dims.global_size > 512, "{:?}", second[0].dims);
    assert_eq!(second[0].dims.global_size + second[1].dims.global_size, 1024);
    assert_eq!(second[0].dims.global_size % LOCAL, 0);
}

#[test]
fn elapsed_is_the_slowest_device() {
    let f = fixture(4 * LOCAL);
    let alpha = alpha_for(&f.grid);
    let specs = vec![HostDeviceSpec::new("a").with_throughput(1e6), HostDeviceSpec::new("b").with_throughput(2e6)];
    let (mut engine, _) = engine_on(host(specs), OclConfig::default());
    let mut result = vec![0.0; f.dataset.size()];

    let elapsed =
        engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..1, 0..f.dataset.size()).unwrap();
    // 128 items at 1e6/s on device 0.
    assert_relative_eq!(elapsed, 128e-6, epsilon = 1e-12);
}

// ---------------------------------------------------------------------------
// multTranspose
// ---------------------------------------------------------------------------

fn expected_transpose(f: &Fixture, source: &[f64]) -> Vec<f64> {
    let mut expected = vec![0.0; f.grid.grid_size()];
    for (p, &slot) in f.points.iter().zip(&f.slots) {
        expected[slot] = (0..f.dataset.size()).map(|j| source[j] * phi(p, &f.dataset.point(j))).sum();
    }
    expected
}

#[test]
fn transpose_sums_partials_from_every_device() {
    let f = fixture(6 * LOCAL);
    let source: Vec<f64> = (0..f.dataset.size()).map(|j| 1.0 + (j % 7) as f64 * 0.5).collect();
    let specs = vec![
        HostDeviceSpec::new("a"),
        HostDeviceSpec::new("b").with_throughput(3e8),
        HostDeviceSpec::new("c").with_throughput(7e8),
    ];
    let (mut engine, trace) = engine_on(host(specs), OclConfig::default());
    let expected = expected_transpose(&f, &source);
    let n = f.grid.num_subspaces();

    for _ in 0..3 {
        let mut result = vec![99.0; f.grid.grid_size()];
        engine.mult_transpose(&f.grid, &f.dataset, &source, &mut result, 0..n, 0..f.dataset.size()).unwrap();
        for (r, e) in result.iter().zip(&expected) {
            assert_relative_eq!(*r, *e, epsilon = 1e-10);
        }
    }
    assert!(trace.launches().iter().all(|l| l.entry == "multTransOCL"));
    assert!(engine.partition_weights(Operation::MultTranspose)[0] > engine.partition_weights(Operation::MultTranspose)[1]);
}

#[test]
fn transpose_overwrites_only_the_grid_range_slots() {
    let f = fixture(2 * LOCAL);
    let source = vec![1.0; f.dataset.size()];
    let (mut engine, _) = uniform_engine(2);
    let expected = expected_transpose(&f, &source);

    let mut result = vec![-5.0; f.grid.grid_size()];
    engine.mult_transpose(&f.grid, &f.dataset, &source, &mut result, 1..2, 0..f.dataset.size()).unwrap();

    let slots = f.grid.slot_range(1..2);
    assert!(!slots.is_empty());
    for g in 0..f.grid.grid_size() {
        if slots.contains(&g) {
            assert_relative_eq!(result[g], expected[g], epsilon = 1e-10);
        } else {
            assert_eq!(result[g], -5.0);
        }
    }
}

#[test]
fn transpose_binds_data_segments() {
    let f = fixture(4 * LOCAL);
    let source = vec![1.0; f.dataset.size()];
    let (mut engine, trace) = uniform_engine(2);
    let mut result = vec![0.0; f.grid.grid_size()];
    let n = f.grid.num_subspaces();

    engine.mult_transpose(&f.grid, &f.dataset, &source, &mut result, 0..n, LOCAL..3 * LOCAL).unwrap();
    let launches = trace.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[1].args[6], KernelArg::U32(f.dataset.size() as u32));
    assert_eq!(launches[1].args[7], KernelArg::U32(2 * LOCAL as u32));
    assert_eq!(launches[1].args[8], KernelArg::U32(3 * LOCAL as u32));
    assert_eq!(launches[1].args[9], KernelArg::U32(n as u32));
}

// ---------------------------------------------------------------------------
// Buffer lifecycle
// ---------------------------------------------------------------------------

#[test]
fn reset_kernel_frees_only_grid_buffers() {
    let f = fixture(2 * LOCAL);
    let alpha = alpha_for(&f.grid);
    let (mut engine, trace) = uniform_engine(2);
    let mut result = vec![0.0; f.dataset.size()];
    let n = f.grid.num_subspaces();

    engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..n, 0..f.dataset.size()).unwrap();
    // levels, indices, descriptors, alpha, temp per device plus one shared dataset.
    assert_eq!(trace.live_buffers(), 11);
    assert_eq!(trace.live_kernels(), 2);

    engine.reset_kernel();
    assert_eq!(trace.live_buffers(), 3);
    assert_eq!(trace.live_kernels(), 2);
    assert_eq!(engine.state(), DispatchState::KernelsBuilt);

    // A different grid uploads cleanly after the reset.
    let smaller: Vec<GridPoint> = grid_points().into_iter().take(3).collect();
    let (grid2, _) = GridLayout::from_points(2, &smaller).unwrap();
    let alpha2 = alpha_for(&grid2);
    engine.mult(&grid2, &f.dataset, &alpha2, &mut result, 0..grid2.num_subspaces(), 0..LOCAL).unwrap();
    assert_eq!(trace.live_buffers(), 11);
    assert_eq!(trace.programs_built(), 1);

    engine.release_data_buffers();
    assert_eq!(trace.live_buffers(), 8);
    drop(engine);
    assert_eq!(trace.live_buffers(), 0);
    assert_eq!(trace.live_kernels(), 0);
}

#[test]
fn changed_grid_without_reset_is_rejected() {
    let f = fixture(LOCAL);
    let alpha = alpha_for(&f.grid);
    let (mut engine, _) = uniform_engine(1);
    let mut result = vec![0.0; f.dataset.size()];
    engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..1, 0..LOCAL).unwrap();

    let (grid2, _) = GridLayout::<f64>::from_points(2, &grid_points()[..2]).unwrap();
    let err = engine.mult(&grid2, &f.dataset, &alpha_for(&grid2), &mut result, 0..1, 0..LOCAL).unwrap_err();
    assert!(err.to_string().contains("reset_kernel"));
}

#[test]
fn multi_context_devices_share_one_dataset_per_context() {
    let f = fixture(4 * LOCAL);
    let alpha = alpha_for(&f.grid);
    let specs = vec![
        HostDeviceSpec::new("a").with_platform("p0"),
        HostDeviceSpec::new("b").with_platform("p1"),
        HostDeviceSpec::new("c").with_platform("p1"),
    ];
    let config = OclConfig { platform: PlatformSelector::All, ..Default::default() };
    let host = HostBackend::from_config(specs, &config).unwrap().with_kernels(reference::kernels::<f64>());
    let (mut engine, trace) = engine_on(host, config);
    let n = f.grid.num_subspaces();

    let mut result = vec![0.0; f.dataset.size()];
    engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..n, 0..f.dataset.size()).unwrap();
    // Five per-device replicas on three devices plus a dataset per context.
    assert_eq!(trace.live_buffers(), 5 * 3 + 2);
    for j in [0, 100, 255] {
        let x = f.dataset.point(j);
        assert_relative_eq!(result[j], f.grid.evaluate(&alpha, 0..n, &x), epsilon = 1e-12);
    }
}

// ---------------------------------------------------------------------------
// Precision
// ---------------------------------------------------------------------------

#[test]
fn precision_must_match_configuration() {
    let manager = DeviceManager::new(HostBackend::uniform(1), OclConfig::default()).unwrap();
    let err = DispatchEngine::<f32>::new(manager, 2).unwrap_err();
    assert!(matches!(
        err,
        OclError::PrecisionMismatch { configured: Precision::Double, requested: Precision::Float }
    ));
    assert!(!err.is_fatal());
}

#[test]
fn single_precision_engine_runs_float_kernels() {
    let points = grid_points();
    let (grid, _) = GridLayout::<f32>::from_points(2, &points).unwrap();
    let rows: Vec<f32> = rows(2 * LOCAL).into_iter().map(|v| v as f32).collect();
    let dataset = Dataset::from_rows(2, &rows).unwrap();
    let alpha: Vec<f32> = (0..grid.grid_size()).map(|g| 0.5 + g as f32 * 0.01).collect();

    let host = HostBackend::uniform(2).with_kernels(reference::kernels::<f32>());
    let config = OclConfig::default().with_precision(Precision::Float);
    let manager = DeviceManager::new(host, config).unwrap();
    let mut engine = DispatchEngine::<f32>::new(manager, 2).unwrap();

    let mut result = vec![0.0f32; dataset.size()];
    let n = grid.num_subspaces();
    engine.mult(&grid, &dataset, &alpha, &mut result, 0..n, 0..dataset.size()).unwrap();
    for j in 0..dataset.size() {
        assert_relative_eq!(result[j], grid.evaluate(&alpha, 0..n, &dataset.point(j)), epsilon = 1e-5);
    }
}

// ---------------------------------------------------------------------------
// Device failures
// ---------------------------------------------------------------------------

#[test]
fn enqueue_failure_reports_device() {
    let f = fixture(2 * LOCAL);
    let alpha = alpha_for(&f.grid);
    let mut backend = host(vec![HostDeviceSpec::new("a"), HostDeviceSpec::new("b")]);
    backend.inject_failure(HostCall::EnqueueKernel, Some(1), ClStatus::OUT_OF_RESOURCES);
    let (mut engine, _) = engine_on(backend, OclConfig::default());
    let mut result = vec![0.0; f.dataset.size()];

    let err = engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..1, 0..f.dataset.size()).unwrap_err();
    assert_eq!(err.device_index(), Some(1));
    assert!(err.is_fatal());
    assert!(err.to_string().contains("CL_OUT_OF_RESOURCES"), "{err}");
}

#[test]
fn missing_host_kernel_is_a_compile_error() {
    let f = fixture(LOCAL);
    let alpha = alpha_for(&f.grid);
    let manager = DeviceManager::new(HostBackend::uniform(1), OclConfig::default()).unwrap();
    let mut engine = DispatchEngine::<f64>::new(manager, 2).unwrap();
    let mut result = vec![0.0; f.dataset.size()];

    let err = engine.mult(&f.grid, &f.dataset, &alpha, &mut result, 0..1, 0..LOCAL).unwrap_err();
    match err {
        OclError::Compile { device, kernel, .. } => {
            assert_eq!(device, 0);
            assert_eq!(kernel, "multOCL");
        }
        other => panic!("expected compile error, got {other}"),
    }
}
