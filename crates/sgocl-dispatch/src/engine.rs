//! End-to-end multi-device dispatch of the evaluation operators.
//!
//! One [`DispatchEngine`] owns the compiled kernels, every device replica
//! and the load-balancing state for one grid dimensionality. Each call to
//! [`DispatchEngine::mult`] or [`DispatchEngine::mult_transpose`]:
//!
//! 1. partitions the data range across devices from the current weights,
//! 2. builds the kernel and uploads buffers on first use,
//! 3. binds arguments and enqueues one launch per active device,
//! 4. joins all launches at a single barrier,
//! 5. gathers each device's share of the result,
//! 6. feeds the measured times back into the balancer.
//!
//! Buffers and kernels persist across calls until [`DispatchEngine::reset_kernel`]
//! or [`DispatchEngine::release_data_buffers`].

use std::ops::Range;

use sgocl_common::{OclError, Real, Result};
use sgocl_runtime::{
    AccessPattern, DeviceManager, KernelArg, KernelSet, LaunchBatch, LaunchDims, ReplicaBuffer, Segment,
};
use tracing::{debug, info};

use crate::layout::{Dataset, GridLayout};
use crate::load_balancer::LinearLoadBalancer;
use crate::source::{FLOAT_ATOMICS_EXTENSION, KernelSourceBuilder, Operation};

/// Progress of the most recent dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    Uninitialized,
    KernelsBuilt,
    BuffersReady,
    Dispatched,
    ResultsGathered,
}

/// Per-operator kernels and balancing state.
#[derive(Debug)]
struct OperatorState {
    kernels: Option<KernelSet>,
    balancer: LinearLoadBalancer,
    /// Elapsed seconds per device of the last run; 0 for idle devices.
    timings: Vec<f64>,
}

impl OperatorState {
    fn new(num_devices: usize, verbose: bool) -> Self {
        Self {
            kernels: None,
            balancer: LinearLoadBalancer::new(num_devices, verbose),
            timings: vec![0.0; num_devices],
        }
    }
}

/// Multi-device `mult`/`multTranspose` dispatcher for precision `T`.
#[derive(Debug)]
pub struct DispatchEngine<T: Real> {
    manager: DeviceManager,
    sources: KernelSourceBuilder,
    dims: usize,
    local_size: usize,
    verbose: bool,
    state: DispatchState,

    mult: OperatorState,
    transpose: OperatorState,

    levels: ReplicaBuffer<T>,
    indices: ReplicaBuffer<T>,
    descriptors: ReplicaBuffer<u32>,
    dataset: ReplicaBuffer<T>,
    /// Coefficients for `mult`, per-device partial sums for `multTranspose`.
    alpha: ReplicaBuffer<T>,
    /// Per-point results for `mult`, per-point weights for `multTranspose`.
    temp: ReplicaBuffer<T>,
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| OclError::InvalidArgument(format!("{what} {value} does not fit a 32-bit kernel argument")))
}

/// Active devices must form a prefix; trailing devices may be idle.
fn check_contiguous(segments: &[Segment]) -> Result<()> {
    let mut idle_seen = false;
    for (device, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            idle_seen = true;
        } else if idle_seen {
            return Err(OclError::NonContiguousPartition { device });
        }
    }
    Ok(())
}

impl<T: Real> DispatchEngine<T> {
    /// Engine for `dims`-dimensional grids on the devices of `manager`.
    pub fn new(manager: DeviceManager, dims: usize) -> Result<Self> {
        let config = manager.config();
        if T::PRECISION != config.internal_precision {
            return Err(OclError::PrecisionMismatch {
                configured: config.internal_precision,
                requested: T::PRECISION,
            });
        }
        if dims == 0 {
            return Err(OclError::InvalidArgument("dispatch engine needs at least one dimension".into()));
        }

        let native_atomics = manager.devices().iter().all(|d| d.supports(FLOAT_ATOMICS_EXTENSION));
        let sources = KernelSourceBuilder::new(config, dims).with_native_float_atomics(native_atomics);
        let n = manager.num_devices();
        let local_size = config.local_size;
        let verbose = config.verbose;
        let balancing_verbose = config.load_balancing_verbose;

        info!(
            "Dispatch engine: {} device(s), {} dims, {} precision, local size {}{}",
            n,
            dims,
            T::PRECISION,
            local_size,
            if native_atomics { ", native float atomics" } else { "" }
        );

        Ok(Self {
            levels: ReplicaBuffer::new(&manager, AccessPattern::Broadcast),
            indices: ReplicaBuffer::new(&manager, AccessPattern::Broadcast),
            descriptors: ReplicaBuffer::new(&manager, AccessPattern::Broadcast),
            dataset: ReplicaBuffer::new(&manager, AccessPattern::SharedReadOnly),
            alpha: ReplicaBuffer::new(&manager, AccessPattern::PinnedRoundTrip),
            temp: ReplicaBuffer::new(&manager, AccessPattern::PinnedRoundTrip),
            mult: OperatorState::new(n, balancing_verbose),
            transpose: OperatorState::new(n, balancing_verbose),
            manager,
            sources,
            dims,
            local_size,
            verbose,
            state: DispatchState::Uninitialized,
        })
    }

    #[must_use]
    pub const fn state(&self) -> DispatchState {
        self.state
    }

    #[must_use]
    pub const fn dims(&self) -> usize {
        self.dims
    }

    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.manager.num_devices()
    }

    #[must_use]
    pub const fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    /// Elapsed seconds per device of the last `op` dispatch.
    #[must_use]
    pub fn last_timings(&self, op: Operation) -> &[f64] {
        &self.operator(op).timings
    }

    /// Fraction of the data range each device receives on the next `op`.
    #[must_use]
    pub fn partition_weights(&self, op: Operation) -> &[f64] {
        self.operator(op).balancer.weights()
    }

    const fn operator(&self, op: Operation) -> &OperatorState {
        match op {
            Operation::Mult => &self.mult,
            Operation::MultTranspose => &self.transpose,
        }
    }

    const fn operator_mut(&mut self, op: Operation) -> &mut OperatorState {
        match op {
            Operation::Mult => &mut self.mult,
            Operation::MultTranspose => &mut self.transpose,
        }
    }

    /// `result[j] = sum alpha[g] * phi_g(x_j)` for `j` in `data_range`,
    /// summing over subspaces from `grid_range.start` to the last one.
    ///
    /// Returns the slowest device's kernel time in seconds, 0 when either
    /// range is empty.
    pub fn mult(
        &mut self,
        grid: &GridLayout<T>,
        dataset: &Dataset<T>,
        alpha: &[T],
        result: &mut [T],
        grid_range: Range<usize>,
        data_range: Range<usize>,
    ) -> Result<f64> {
        if grid_range.is_empty() || data_range.is_empty() {
            return Ok(0.0);
        }
        self.check_shapes(grid, dataset, &grid_range, &data_range)?;
        if alpha.len() != grid.grid_size() {
            return Err(OclError::InvalidArgument(format!(
                "alpha has {} entries, grid has {} slots",
                alpha.len(),
                grid.grid_size()
            )));
        }
        if result.len() != dataset.size() {
            return Err(OclError::InvalidArgument(format!(
                "result has {} entries, dataset has {} points",
                result.len(),
                dataset.size()
            )));
        }

        let segments = self.partition(Operation::Mult, &data_range)?;
        self.ensure_kernels(Operation::Mult)?;
        self.ensure_buffers(grid, dataset)?;
        self.alpha.write(alpha, None)?;

        let result_size = to_u32(dataset.size(), "dataset size")?;
        let start_grid = to_u32(grid_range.start, "grid start")?;
        let num_subspaces = to_u32(grid.num_subspaces(), "subspace count")?;
        // Every launch covers all subspaces from start_grid on; grid_range.end
        // is not forwarded to the kernel.
        let end_grid = num_subspaces;

        let batch = self.launch(Operation::Mult, &segments, |engine, device, _seg| {
            Ok([
                KernelArg::Buffer(engine.levels.handle(device)?),
                KernelArg::Buffer(engine.indices.handle(device)?),
                KernelArg::Buffer(engine.descriptors.handle(device)?),
                KernelArg::Buffer(engine.dataset.handle(device)?),
                KernelArg::Buffer(engine.alpha.handle(device)?),
                KernelArg::Buffer(engine.temp.handle(device)?),
                KernelArg::U32(result_size),
                KernelArg::U32(start_grid),
                KernelArg::U32(end_grid),
                KernelArg::U32(num_subspaces),
            ])
        })?;
        let elapsed = self.join(Operation::Mult, batch)?;

        self.temp.read(result, Some(&segments))?;
        self.state = DispatchState::ResultsGathered;
        self.finish_timing(Operation::Mult, elapsed)
    }

    /// `result[g] = sum source[j] * phi_g(x_j)` over `j` in `data_range`,
    /// for the slots of the subspaces in `grid_range`. Other entries of
    /// `result` are left untouched.
    ///
    /// Returns the slowest device's kernel time in seconds, 0 when either
    /// range is empty.
    pub fn mult_transpose(
        &mut self,
        grid: &GridLayout<T>,
        dataset: &Dataset<T>,
        source: &[T],
        result: &mut [T],
        grid_range: Range<usize>,
        data_range: Range<usize>,
    ) -> Result<f64> {
        if grid_range.is_empty() || data_range.is_empty() {
            return Ok(0.0);
        }
        self.check_shapes(grid, dataset, &grid_range, &data_range)?;
        if source.len() != dataset.size() {
            return Err(OclError::InvalidArgument(format!(
                "source has {} entries, dataset has {} points",
                source.len(),
                dataset.size()
            )));
        }
        if result.len() != grid.grid_size() {
            return Err(OclError::InvalidArgument(format!(
                "result has {} entries, grid has {} slots",
                result.len(),
                grid.grid_size()
            )));
        }

        let segments = self.partition(Operation::MultTranspose, &data_range)?;
        self.ensure_kernels(Operation::MultTranspose)?;
        self.ensure_buffers(grid, dataset)?;
        let zeros = vec![T::ZERO; grid.grid_size()];
        self.alpha.write(&zeros, None)?;
        self.temp.write(source, Some(&segments))?;

        let source_size = to_u32(dataset.size(), "dataset size")?;
        let num_subspaces = to_u32(grid.num_subspaces(), "subspace count")?;

        let batch = self.launch(Operation::MultTranspose, &segments, |engine, device, seg| {
            Ok([
                KernelArg::Buffer(engine.levels.handle(device)?),
                KernelArg::Buffer(engine.indices.handle(device)?),
                KernelArg::Buffer(engine.descriptors.handle(device)?),
                KernelArg::Buffer(engine.dataset.handle(device)?),
                KernelArg::Buffer(engine.temp.handle(device)?),
                KernelArg::Buffer(engine.alpha.handle(device)?),
                KernelArg::U32(source_size),
                KernelArg::U32(to_u32(seg.start, "data start")?),
                KernelArg::U32(to_u32(seg.end, "data end")?),
                KernelArg::U32(num_subspaces),
            ])
        })?;
        let elapsed = self.join(Operation::MultTranspose, batch)?;

        let slots = grid.slot_range(grid_range);
        result[slots.clone()].fill(T::ZERO);
        let mut partial = vec![T::ZERO; grid.grid_size()];
        for (device, _) in segments.iter().enumerate().filter(|(_, s)| !s.is_empty()) {
            self.alpha.read_range(device, slots.start, slots.end, &mut partial)?;
            for (r, p) in result[slots.clone()].iter_mut().zip(&partial[slots.clone()]) {
                *r += *p;
            }
        }
        self.state = DispatchState::ResultsGathered;
        self.finish_timing(Operation::MultTranspose, elapsed)
    }

    /// Free the grid-shaped buffers so the next call uploads a new grid.
    /// Kernels and the dataset stay.
    pub fn reset_kernel(&mut self) {
        self.levels.free();
        self.indices.free();
        self.descriptors.free();
        self.alpha.free();
        self.state = self.resting_state();
        debug!("grid buffers released");
    }

    /// Free the dataset-shaped buffers so the next call uploads a new dataset.
    pub fn release_data_buffers(&mut self) {
        self.dataset.free();
        self.temp.free();
        self.state = self.resting_state();
        debug!("dataset buffers released");
    }

    fn resting_state(&self) -> DispatchState {
        if self.mult.kernels.is_some() || self.transpose.kernels.is_some() {
            DispatchState::KernelsBuilt
        } else {
            DispatchState::Uninitialized
        }
    }

    fn check_shapes(
        &self,
        grid: &GridLayout<T>,
        dataset: &Dataset<T>,
        grid_range: &Range<usize>,
        data_range: &Range<usize>,
    ) -> Result<()> {
        if grid.dims() != self.dims || dataset.dims() != self.dims {
            return Err(OclError::InvalidArgument(format!(
                "engine is {}-dimensional, grid has {} and dataset {} dimensions",
                self.dims,
                grid.dims(),
                dataset.dims()
            )));
        }
        if grid_range.end > grid.num_subspaces() {
            return Err(OclError::InvalidArgument(format!(
                "grid range {grid_range:?} exceeds {} subspaces",
                grid.num_subspaces()
            )));
        }
        if data_range.end > dataset.size() {
            return Err(OclError::InvalidArgument(format!(
                "data range {data_range:?} exceeds {} points",
                dataset.size()
            )));
        }
        Ok(())
    }

    fn partition(&self, op: Operation, data_range: &Range<usize>) -> Result<Vec<Segment>> {
        let segments =
            self.operator(op).balancer.partition_segments(data_range.start, data_range.end, self.local_size)?;
        check_contiguous(&segments)?;
        Ok(segments)
    }

    fn ensure_kernels(&mut self, op: Operation) -> Result<()> {
        if self.operator(op).kernels.is_none() {
            let source = self.sources.source(op)?;
            let kernels = self.manager.build_kernel(&source.text, op.entry())?;
            info!(
                "Built {} for {} device(s){}",
                op,
                kernels.len(),
                if source.from_cache { " from cached source" } else { "" }
            );
            self.operator_mut(op).kernels = Some(kernels);
        }
        if self.state == DispatchState::Uninitialized {
            self.state = DispatchState::KernelsBuilt;
        }
        Ok(())
    }

    fn ensure_buffers(&mut self, grid: &GridLayout<T>, dataset: &Dataset<T>) -> Result<()> {
        if self.levels.is_initialized()
            && (self.levels.len() != grid.levels().len() || self.indices.len() != grid.indices().len())
        {
            return Err(OclError::InvalidArgument(
                "device buffers hold a grid of a different shape; call reset_kernel first".into(),
            ));
        }
        if self.dataset.is_initialized() && self.dataset.len() != dataset.data().len() {
            return Err(OclError::InvalidArgument(
                "device buffers hold a dataset of a different shape; call release_data_buffers first".into(),
            ));
        }

        self.levels.initialize(grid.levels())?;
        self.indices.initialize(grid.indices())?;
        self.descriptors.initialize(grid.descriptors())?;
        self.alpha.initialize_uninit(grid.grid_size())?;
        self.dataset.initialize(dataset.data())?;
        self.temp.initialize_uninit(dataset.size())?;
        self.state = DispatchState::BuffersReady;
        Ok(())
    }

    /// Bind `args(device, segment)` and enqueue on every device with work,
    /// in device order.
    fn launch(
        &mut self,
        op: Operation,
        segments: &[Segment],
        args: impl Fn(&Self, usize, &Segment) -> Result<[KernelArg; 10]>,
    ) -> Result<LaunchBatch> {
        let mut batch = LaunchBatch::new(&self.manager);
        let kernels = self
            .operator(op)
            .kernels
            .as_ref()
            .ok_or_else(|| OclError::InvalidArgument(format!("{op} kernels not built")))?;

        for (device, seg) in segments.iter().enumerate() {
            if seg.is_empty() {
                continue;
            }
            let kernel = kernels.kernel(device)?;
            let bound = args(self, device, seg)?;
            {
                let mut backend = self.manager.lock()?;
                for (index, arg) in (0u32..).zip(bound) {
                    backend.set_kernel_arg(kernel, index, arg)?;
                }
            }
            batch.enqueue(
                device,
                kernel,
                LaunchDims { global_offset: seg.start, global_size: seg.len(), local_size: self.local_size },
            )?;
        }
        self.state = DispatchState::Dispatched;
        Ok(batch)
    }

    /// Wait for `batch` and return elapsed seconds per device.
    fn join(&self, op: Operation, batch: LaunchBatch) -> Result<Vec<f64>> {
        let mut elapsed = vec![0.0; self.manager.num_devices()];
        for timing in batch.wait_all()? {
            elapsed[timing.device] = timing.elapsed_seconds();
        }
        if self.verbose {
            info!("{op} device times: {elapsed:?}");
        } else {
            debug!("{op} device times: {elapsed:?}");
        }
        Ok(elapsed)
    }

    fn finish_timing(&mut self, op: Operation, elapsed: Vec<f64>) -> Result<f64> {
        let slowest = elapsed.iter().copied().fold(0.0, f64::max);
        let state = self.operator_mut(op);
        state.balancer.update(&elapsed)?;
        state.timings = elapsed;
        Ok(slowest)
    }
}
