//! CPU reference backend.
//!
//! Simulates any number of devices without an OpenCL runtime. Kernels are
//! Rust functions registered under their OpenCL entry-point names; a
//! program "compiles" when every `__kernel` it declares has a registered
//! implementation. Each device owns a virtual clock advanced by
//! `global_size / throughput`, so profiling timestamps and therefore load
//! balancing are deterministic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use sgocl_common::{ClStatus, DeviceTypeFilter, OclConfig, OclError, Result};
use tracing::{debug, trace};

use crate::backend::{
    BufferId, ComputeBackend, DeviceInfo, EventId, KernelArg, KernelId, LaunchDims, MemoryKind,
    ProfileTimes, ProgramId,
};
use crate::selection::{PlatformDevices, select_devices};

/// Signature of a host kernel body.
pub type HostKernelFn = fn(&mut HostLaunch<'_>) -> Result<()>;

/// A Rust implementation of an OpenCL entry point.
#[derive(Debug, Clone, Copy)]
pub struct HostKernel {
    pub entry: &'static str,
    /// Argument slots the kernel writes.
    pub outputs: &'static [u32],
    pub run: HostKernelFn,
}

// ── Device specs ────────────────────────────────────────────────────

/// Description of one simulated device.
#[derive(Debug, Clone)]
pub struct HostDeviceSpec {
    pub name: String,
    pub platform: String,
    pub device_type: DeviceTypeFilter,
    /// Work-items processed per simulated second.
    pub throughput: f64,
    /// Fixed simulated cost per launch.
    pub launch_overhead_ns: u64,
    pub max_work_group_size: usize,
    pub extensions: Vec<String>,
}

impl HostDeviceSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: "Host Reference".into(),
            device_type: DeviceTypeFilter::Cpu,
            throughput: 1e9,
            launch_overhead_ns: 0,
            max_work_group_size: 1024,
            extensions: vec!["cl_khr_fp64".into()],
        }
    }

    #[must_use]
    pub fn with_throughput(mut self, items_per_second: f64) -> Self {
        self.throughput = items_per_second;
        self
    }

    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    #[must_use]
    pub const fn with_device_type(mut self, device_type: DeviceTypeFilter) -> Self {
        self.device_type = device_type;
        self
    }

    #[must_use]
    pub const fn with_launch_overhead_ns(mut self, ns: u64) -> Self {
        self.launch_overhead_ns = ns;
        self
    }

    #[must_use]
    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.extensions.push(ext.into());
        self
    }
}

// ── Fault injection ─────────────────────────────────────────────────

/// Backend calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCall {
    CreateBuffer,
    WriteBuffer,
    ReadBuffer,
    MapBuffer,
    BuildProgram,
    CreateKernel,
    SetKernelArg,
    EnqueueKernel,
    Finish,
    Profile,
}

impl HostCall {
    const fn cl_name(self) -> &'static str {
        match self {
            Self::CreateBuffer => "clCreateBuffer",
            Self::WriteBuffer => "clEnqueueWriteBuffer",
            Self::ReadBuffer => "clEnqueueReadBuffer",
            Self::MapBuffer => "clEnqueueMapBuffer",
            Self::BuildProgram => "clBuildProgram",
            Self::CreateKernel => "clCreateKernel",
            Self::SetKernelArg => "clSetKernelArg",
            Self::EnqueueKernel => "clEnqueueNDRangeKernel",
            Self::Finish => "clFinish",
            Self::Profile => "clGetEventProfilingInfo",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    call: HostCall,
    device: Option<usize>,
    code: ClStatus,
}

// ── Trace ───────────────────────────────────────────────────────────

/// One recorded kernel launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub device: usize,
    pub entry: String,
    pub args: Vec<KernelArg>,
    pub dims: LaunchDims,
}

#[derive(Debug, Default)]
struct HostTrace {
    launches: Vec<LaunchRecord>,
    live_buffers: usize,
    live_kernels: usize,
    live_events: usize,
    programs_built: usize,
}

/// Shared view of what a [`HostBackend`] has done.
///
/// Cloned out before the backend is boxed into a device manager.
#[derive(Debug, Clone, Default)]
pub struct HostTraceHandle(Arc<Mutex<HostTrace>>);

impl HostTraceHandle {
    fn lock(&self) -> MutexGuard<'_, HostTrace> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.lock().launches.clone()
    }

    #[must_use]
    pub fn launch_count(&self) -> usize {
        self.lock().launches.len()
    }

    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.lock().live_buffers
    }

    #[must_use]
    pub fn live_kernels(&self) -> usize {
        self.lock().live_kernels
    }

    /// Launch events not yet released.
    #[must_use]
    pub fn live_events(&self) -> usize {
        self.lock().live_events
    }

    #[must_use]
    pub fn programs_built(&self) -> usize {
        self.lock().programs_built
    }

    pub fn clear_launches(&self) {
        self.lock().launches.clear();
    }
}

// ── Memory ──────────────────────────────────────────────────────────

/// Byte storage aligned for any element type up to 8 bytes.
#[derive(Debug, Clone, Default)]
struct HostMemory {
    words: Vec<u64>,
    len: usize,
}

impl HostMemory {
    fn zeroed(len: usize) -> Self {
        Self { words: vec![0; len.div_ceil(8)], len }
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }
}

#[derive(Debug)]
struct HostBuffer {
    context: usize,
    kind: MemoryKind,
    memory: HostMemory,
}

#[derive(Debug)]
struct HostProgram {
    entries: Vec<(String, usize)>,
    log: String,
}

#[derive(Debug)]
struct HostKernelSlot {
    device: usize,
    kernel: HostKernel,
    arity: usize,
    args: Vec<Option<KernelArg>>,
}

/// Entry points declared in `source` with their parameter counts.
fn parse_entries(source: &str) -> Vec<(String, usize)> {
    let mut entries = Vec::new();
    let mut rest = source;
    while let Some(pos) = rest.find("__kernel") {
        rest = &rest[pos + "__kernel".len()..];
        let Some(ret) = rest.find("void") else { break };
        rest = &rest[ret + "void".len()..];
        let Some(open) = rest.find('(') else { break };
        let name = rest[..open].trim().to_string();
        let Some(close) = rest[open..].find(')') else { break };
        let params = &rest[open + 1..open + close];
        let count = if params.trim().is_empty() { 0 } else { params.split(',').count() };
        if !name.is_empty() {
            entries.push((name, count));
        }
        rest = &rest[open + close..];
    }
    entries
}

// ── Backend ─────────────────────────────────────────────────────────

/// CPU-backed [`ComputeBackend`] with simulated devices.
#[derive(Debug)]
pub struct HostBackend {
    devices: Vec<DeviceInfo>,
    specs: Vec<HostDeviceSpec>,
    clocks: Vec<u64>,
    registry: HashMap<&'static str, HostKernel>,
    buffers: HashMap<BufferId, HostBuffer>,
    programs: HashMap<ProgramId, HostProgram>,
    kernels: HashMap<KernelId, HostKernelSlot>,
    events: HashMap<EventId, ProfileTimes>,
    faults: Vec<Fault>,
    next_id: u64,
    trace: HostTraceHandle,
}

impl HostBackend {
    /// All `specs` as devices of a single context.
    #[must_use]
    pub fn new(specs: Vec<HostDeviceSpec>) -> Self {
        let contexts = vec![0; specs.len()];
        Self::with_contexts(specs, &contexts)
    }

    /// `count` identical devices.
    #[must_use]
    pub fn uniform(count: usize) -> Self {
        Self::new((0..count).map(|i| HostDeviceSpec::new(format!("host-{i}"))).collect())
    }

    /// Apply the configured platform and device filters to `specs`.
    ///
    /// Specs are grouped into platforms by their `platform` name, in
    /// first-appearance order.
    pub fn from_config(specs: Vec<HostDeviceSpec>, config: &OclConfig) -> Result<Self> {
        let mut platforms: Vec<PlatformDevices> = Vec::new();
        let mut members: Vec<Vec<usize>> = Vec::new();
        for (i, spec) in specs.iter().enumerate() {
            match platforms.iter().position(|p| p.name == spec.platform) {
                Some(p) => {
                    platforms[p].device_types.push(spec.device_type);
                    members[p].push(i);
                }
                None => {
                    platforms.push(PlatformDevices {
                        name: spec.platform.clone(),
                        device_types: vec![spec.device_type],
                    });
                    members.push(vec![i]);
                }
            }
        }

        let selected = select_devices(&platforms, config)?;
        let contexts: Vec<usize> = selected.iter().map(|s| s.context).collect();
        let chosen: Vec<HostDeviceSpec> =
            selected.iter().map(|s| specs[members[s.platform][s.device]].clone()).collect();
        Ok(Self::with_contexts(chosen, &contexts))
    }

    fn with_contexts(specs: Vec<HostDeviceSpec>, contexts: &[usize]) -> Self {
        let devices = specs
            .iter()
            .zip(contexts)
            .enumerate()
            .map(|(index, (spec, &context))| DeviceInfo {
                index,
                name: spec.name.clone(),
                vendor: "sgocl".into(),
                platform: spec.platform.clone(),
                device_type: spec.device_type,
                context,
                max_work_group_size: spec.max_work_group_size,
                extensions: spec.extensions.clone(),
            })
            .collect();
        Self {
            devices,
            clocks: vec![0; specs.len()],
            specs,
            registry: HashMap::new(),
            buffers: HashMap::new(),
            programs: HashMap::new(),
            kernels: HashMap::new(),
            events: HashMap::new(),
            faults: Vec::new(),
            next_id: 1,
            trace: HostTraceHandle::default(),
        }
    }

    /// Register kernel implementations.
    #[must_use]
    pub fn with_kernels(mut self, kernels: impl IntoIterator<Item = HostKernel>) -> Self {
        for k in kernels {
            self.registry.insert(k.entry, k);
        }
        self
    }

    /// Handle to the launch and allocation trace.
    #[must_use]
    pub fn trace(&self) -> HostTraceHandle {
        self.trace.clone()
    }

    /// Make the next `call` (on `device`, or any device) fail with `code`.
    pub fn inject_failure(&mut self, call: HostCall, device: Option<usize>, code: ClStatus) {
        self.faults.push(Fault { call, device, code });
    }

    /// Change the simulated speed of `device`.
    pub fn set_throughput(&mut self, device: usize, items_per_second: f64) {
        if let Some(spec) = self.specs.get_mut(device) {
            spec.throughput = items_per_second;
        }
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_fault(&mut self, call: HostCall, device: usize) -> Result<()> {
        let hit = self
            .faults
            .iter()
            .position(|f| f.call == call && f.device.is_none_or(|d| d == device));
        match hit {
            Some(i) => {
                let fault = self.faults.remove(i);
                Err(OclError::Device { device, call: call.cl_name(), code: fault.code })
            }
            None => Ok(()),
        }
    }

    fn check_device(&self, device: usize, call: HostCall) -> Result<()> {
        if device < self.devices.len() {
            Ok(())
        } else {
            Err(OclError::Device { device, call: call.cl_name(), code: ClStatus::INVALID_DEVICE })
        }
    }

    fn region(
        &self,
        device: usize,
        buffer: BufferId,
        offset: usize,
        len: usize,
        call: HostCall,
    ) -> Result<std::ops::Range<usize>> {
        let buf = self.buffers.get(&buffer).ok_or(OclError::Device {
            device,
            call: call.cl_name(),
            code: ClStatus::INVALID_MEM_OBJECT,
        })?;
        if buf.context != self.devices[device].context {
            return Err(OclError::Device { device, call: call.cl_name(), code: ClStatus::INVALID_MEM_OBJECT });
        }
        let end = offset.checked_add(len).filter(|&e| e <= buf.memory.len).ok_or(OclError::Device {
            device,
            call: call.cl_name(),
            code: ClStatus::INVALID_VALUE,
        })?;
        Ok(offset..end)
    }

    fn copy_in(&mut self, device: usize, buffer: BufferId, offset: usize, data: &[u8], call: HostCall) -> Result<()> {
        self.check_device(device, call)?;
        self.check_fault(call, device)?;
        let range = self.region(device, buffer, offset, data.len(), call)?;
        if let Some(buf) = self.buffers.get_mut(&buffer) {
            buf.memory.bytes_mut()[range].copy_from_slice(data);
        }
        Ok(())
    }

    fn copy_out(&mut self, device: usize, buffer: BufferId, offset: usize, out: &mut [u8], call: HostCall) -> Result<()> {
        self.check_device(device, call)?;
        self.check_fault(call, device)?;
        let range = self.region(device, buffer, offset, out.len(), call)?;
        if let Some(buf) = self.buffers.get(&buffer) {
            out.copy_from_slice(&buf.memory.bytes()[range]);
        }
        Ok(())
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    fn create_buffer(
        &mut self,
        device: usize,
        kind: MemoryKind,
        size_bytes: usize,
        init: Option<&[u8]>,
    ) -> Result<BufferId> {
        let call = HostCall::CreateBuffer;
        self.check_device(device, call)?;
        self.check_fault(call, device)?;
        if size_bytes == 0 {
            return Err(OclError::Device { device, call: call.cl_name(), code: ClStatus::INVALID_BUFFER_SIZE });
        }
        let mut memory = HostMemory::zeroed(size_bytes);
        if let Some(data) = init {
            if data.len() != size_bytes {
                return Err(OclError::Device { device, call: call.cl_name(), code: ClStatus::INVALID_VALUE });
            }
            memory.bytes_mut().copy_from_slice(data);
        }
        let id = BufferId(self.next());
        self.buffers.insert(id, HostBuffer { context: self.devices[device].context, kind, memory });
        self.trace.lock().live_buffers += 1;
        trace!("host buffer {id}: {size_bytes} bytes, {kind:?}, device {device}");
        Ok(id)
    }

    fn write_buffer(&mut self, device: usize, buffer: BufferId, offset: usize, data: &[u8]) -> Result<()> {
        self.copy_in(device, buffer, offset, data, HostCall::WriteBuffer)
    }

    fn read_buffer(&mut self, device: usize, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<()> {
        self.copy_out(device, buffer, offset, out, HostCall::ReadBuffer)
    }

    fn map_write(&mut self, device: usize, buffer: BufferId, offset: usize, data: &[u8]) -> Result<()> {
        self.copy_in(device, buffer, offset, data, HostCall::MapBuffer)
    }

    fn map_read(&mut self, device: usize, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<()> {
        self.copy_out(device, buffer, offset, out, HostCall::MapBuffer)
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        if self.buffers.remove(&buffer).is_some() {
            let mut trace = self.trace.lock();
            trace.live_buffers = trace.live_buffers.saturating_sub(1);
        }
    }

    fn build_program(&mut self, source: &str, options: &str, label: &str) -> Result<ProgramId> {
        let call = HostCall::BuildProgram;
        self.check_fault(call, 0)?;
        let compile_error = |log: String| OclError::Compile {
            device: 0,
            kernel: label.to_string(),
            code: ClStatus::BUILD_PROGRAM_FAILURE,
            log,
        };

        let opens = source.matches('{').count();
        let closes = source.matches('}').count();
        if opens != closes {
            return Err(compile_error(format!("error: unbalanced braces ({opens} '{{' vs {closes} '}}')")));
        }
        let entries = parse_entries(source);
        if entries.is_empty() {
            return Err(compile_error("error: no __kernel entry point declared".into()));
        }
        for (entry, _) in &entries {
            if !self.registry.contains_key(entry.as_str()) {
                return Err(compile_error(format!("error: no host implementation for kernel '{entry}'")));
            }
        }

        let log = format!(
            "host reference build of '{label}' with options '{options}': {} kernel(s)",
            entries.len()
        );
        let id = ProgramId(self.next());
        self.programs.insert(id, HostProgram { entries, log });
        self.trace.lock().programs_built += 1;
        debug!("host program {id} built for '{label}'");
        Ok(id)
    }

    fn build_log(&self, program: ProgramId, device: usize) -> Result<String> {
        self.programs.get(&program).map(|p| p.log.clone()).ok_or(OclError::Device {
            device,
            call: "clGetProgramBuildInfo",
            code: ClStatus(-44),
        })
    }

    fn create_kernel(&mut self, program: ProgramId, device: usize, entry: &str) -> Result<KernelId> {
        let call = HostCall::CreateKernel;
        self.check_device(device, call)?;
        self.check_fault(call, device)?;
        let arity = self
            .programs
            .get(&program)
            .and_then(|p| p.entries.iter().find(|(e, _)| e == entry))
            .map(|(_, n)| *n);
        let (kernel, arity) = match (self.registry.get(entry), arity) {
            (Some(k), Some(n)) => (*k, n),
            _ => {
                return Err(OclError::Device {
                    device,
                    call: call.cl_name(),
                    code: ClStatus::INVALID_KERNEL_NAME,
                });
            }
        };
        let id = KernelId(self.next());
        self.kernels.insert(id, HostKernelSlot { device, kernel, arity, args: Vec::new() });
        self.trace.lock().live_kernels += 1;
        Ok(id)
    }

    fn release_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
    }

    fn release_kernel(&mut self, kernel: KernelId) {
        if self.kernels.remove(&kernel).is_some() {
            let mut trace = self.trace.lock();
            trace.live_kernels = trace.live_kernels.saturating_sub(1);
        }
    }

    fn set_kernel_arg(&mut self, kernel: KernelId, index: u32, arg: KernelArg) -> Result<()> {
        let call = HostCall::SetKernelArg;
        let device = self.kernels.get(&kernel).map_or(0, |k| k.device);
        self.check_fault(call, device)?;
        if let KernelArg::Buffer(id) = arg {
            let ok = self.buffers.get(&id).is_some_and(|b| b.context == self.devices[device].context);
            if !ok {
                return Err(OclError::Device { device, call: call.cl_name(), code: ClStatus::INVALID_MEM_OBJECT });
            }
        }
        let slot = self.kernels.get_mut(&kernel).ok_or(OclError::Device {
            device,
            call: call.cl_name(),
            code: ClStatus::INVALID_KERNEL,
        })?;
        let idx = index as usize;
        if idx >= slot.arity {
            return Err(OclError::Device { device, call: call.cl_name(), code: ClStatus::INVALID_ARG_INDEX });
        }
        if slot.args.len() <= idx {
            slot.args.resize(idx + 1, None);
        }
        slot.args[idx] = Some(arg);
        Ok(())
    }

    fn enqueue_kernel(&mut self, device: usize, kernel: KernelId, dims: LaunchDims) -> Result<EventId> {
        let call = HostCall::EnqueueKernel;
        let err = |code| OclError::Device { device, call: call.cl_name(), code };
        self.check_device(device, call)?;
        self.check_fault(call, device)?;

        let slot = self.kernels.get(&kernel).ok_or(err(ClStatus::INVALID_KERNEL))?;
        if slot.device != device {
            return Err(err(ClStatus::INVALID_KERNEL));
        }
        if dims.local_size == 0
            || dims.local_size > self.specs[device].max_work_group_size
            || !dims.global_size.is_multiple_of(dims.local_size)
        {
            return Err(err(ClStatus::INVALID_WORK_GROUP_SIZE));
        }
        if dims.global_size == 0 {
            return Err(err(ClStatus::INVALID_GLOBAL_WORK_SIZE));
        }
        if slot.args.len() != slot.arity {
            return Err(err(ClStatus::INVALID_KERNEL_ARGS));
        }
        let args: Vec<KernelArg> =
            slot.args.iter().copied().collect::<Option<Vec<_>>>().ok_or(err(ClStatus::INVALID_KERNEL_ARGS))?;
        let host_kernel = slot.kernel;

        // Outputs leave the buffer table for the duration of the launch.
        let mut outputs = Vec::with_capacity(host_kernel.outputs.len());
        for &slot_idx in host_kernel.outputs {
            let id = match args.get(slot_idx as usize) {
                Some(KernelArg::Buffer(id)) => *id,
                _ => return Err(err(ClStatus::INVALID_ARG_VALUE)),
            };
            match self.buffers.get(&id) {
                Some(b) if !b.kind.kernel_writable() => return Err(err(ClStatus::INVALID_MEM_OBJECT)),
                Some(_) => {}
                None => return Err(err(ClStatus::INVALID_MEM_OBJECT)),
            }
            if let Some(buf) = self.buffers.remove(&id) {
                outputs.push((id, buf));
            }
        }

        let result = {
            let mut launch = HostLaunch { device, dims, args: &args, buffers: &self.buffers, outputs: &mut outputs };
            (host_kernel.run)(&mut launch)
        };
        for (id, buf) in outputs {
            self.buffers.insert(id, buf);
        }
        result?;

        let spec = &self.specs[device];
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let busy_ns =
            (dims.global_size as f64 * 1e9 / spec.throughput).round() as u64 + spec.launch_overhead_ns;
        let start_ns = self.clocks[device];
        let end_ns = start_ns + busy_ns;
        self.clocks[device] = end_ns;

        let event = EventId(self.next());
        self.events.insert(event, ProfileTimes { start_ns, end_ns });
        {
            let mut trace = self.trace.lock();
            trace.live_events += 1;
            trace.launches.push(LaunchRecord { device, entry: host_kernel.entry.to_string(), args, dims });
        }
        trace!(
            "host launch {} on device {device}: offset {} size {} ({busy_ns} ns)",
            host_kernel.entry, dims.global_offset, dims.global_size
        );
        Ok(event)
    }

    fn finish(&mut self, device: usize) -> Result<()> {
        self.check_device(device, HostCall::Finish)?;
        self.check_fault(HostCall::Finish, device)
    }

    fn profile(&mut self, device: usize, event: EventId) -> Result<ProfileTimes> {
        let call = HostCall::Profile;
        self.check_fault(call, device)?;
        self.events.get(&event).copied().ok_or(OclError::Device {
            device,
            call: call.cl_name(),
            code: ClStatus::INVALID_EVENT,
        })
    }

    fn release_event(&mut self, event: EventId) {
        if self.events.remove(&event).is_some() {
            let mut trace = self.trace.lock();
            trace.live_events = trace.live_events.saturating_sub(1);
        }
    }
}

// ── Launch context ──────────────────────────────────────────────────

/// Arguments and geometry visible to a running host kernel.
pub struct HostLaunch<'a> {
    pub device: usize,
    pub dims: LaunchDims,
    args: &'a [KernelArg],
    buffers: &'a HashMap<BufferId, HostBuffer>,
    outputs: &'a mut Vec<(BufferId, HostBuffer)>,
}

/// Read-only arguments of a launch.
#[derive(Clone, Copy)]
pub struct HostArgs<'a> {
    device: usize,
    args: &'a [KernelArg],
    buffers: &'a HashMap<BufferId, HostBuffer>,
}

fn launch_arg_error(device: usize) -> OclError {
    OclError::Device { device, call: "clEnqueueNDRangeKernel", code: ClStatus::INVALID_ARG_VALUE }
}

impl<'a> HostArgs<'a> {
    /// Scalar `uint` argument.
    pub fn u32_arg(&self, index: usize) -> Result<u32> {
        match self.args.get(index) {
            Some(KernelArg::U32(v)) => Ok(*v),
            _ => Err(launch_arg_error(self.device)),
        }
    }

    /// Scalar `ulong` argument.
    pub fn u64_arg(&self, index: usize) -> Result<u64> {
        match self.args.get(index) {
            Some(KernelArg::U64(v)) => Ok(*v),
            _ => Err(launch_arg_error(self.device)),
        }
    }

    /// Typed view of a buffer argument the kernel only reads.
    pub fn input<T: bytemuck::Pod>(&self, index: usize) -> Result<&'a [T]> {
        let buf = match self.args.get(index) {
            Some(KernelArg::Buffer(id)) => self.buffers.get(id),
            _ => None,
        };
        let buf = buf.ok_or_else(|| launch_arg_error(self.device))?;
        bytemuck::try_cast_slice(buf.memory.bytes()).map_err(|_| launch_arg_error(self.device))
    }
}

impl HostLaunch<'_> {
    /// Read-only arguments.
    #[must_use]
    pub fn args(&self) -> HostArgs<'_> {
        HostArgs { device: self.device, args: self.args, buffers: self.buffers }
    }

    /// Read-only arguments together with the writable output at `index`,
    /// which must be listed in [`HostKernel::outputs`].
    pub fn split_output<T: bytemuck::Pod>(&mut self, index: usize) -> Result<(HostArgs<'_>, &mut [T])> {
        let device = self.device;
        let id = match self.args.get(index) {
            Some(KernelArg::Buffer(id)) => *id,
            _ => return Err(launch_arg_error(device)),
        };
        let buf = self
            .outputs
            .iter_mut()
            .find(|(out, _)| *out == id)
            .map(|(_, buf)| buf)
            .ok_or_else(|| launch_arg_error(device))?;
        let out = bytemuck::try_cast_slice_mut(buf.memory.bytes_mut()).map_err(|_| launch_arg_error(device))?;
        Ok((HostArgs { device, args: self.args, buffers: self.buffers }, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scale(launch: &mut HostLaunch<'_>) -> Result<()> {
        let LaunchDims { global_offset, global_size, .. } = launch.dims;
        let (args, out) = launch.split_output::<f32>(1)?;
        let factor = args.u32_arg(2)? as f32;
        let input = args.input::<f32>(0)?;
        for i in global_offset..global_offset + global_size {
            out[i] = input[i] * factor;
        }
        Ok(())
    }

    const SCALE: HostKernel = HostKernel { entry: "scale", outputs: &[1], run: scale };
    const SCALE_SRC: &str = "__kernel void scale(__global const float* a, __global float* b, uint k) { }";

    fn bytes(v: &[f32]) -> Vec<u8> {
        bytemuck::cast_slice(v).to_vec()
    }

    #[test]
    fn parse_entries_counts_parameters() {
        let entries = parse_entries(SCALE_SRC);
        assert_eq!(entries, vec![("scale".to_string(), 3)]);
    }

    #[test]
    fn buffer_roundtrip_and_bounds() {
        let mut host = HostBackend::uniform(1);
        let buf = host.create_buffer(0, MemoryKind::Pinned, 12, None).unwrap();
        host.write_buffer(0, buf, 4, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 12];
        host.read_buffer(0, buf, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0, 0]);

        let err = host.write_buffer(0, buf, 10, &[0; 4]).unwrap_err();
        assert!(err.to_string().contains("CL_INVALID_VALUE"));
    }

    #[test]
    fn buffers_are_scoped_to_their_context() {
        let specs = vec![HostDeviceSpec::new("a").with_platform("p0"), HostDeviceSpec::new("b").with_platform("p1")];
        let cfg = OclConfig { platform: sgocl_common::PlatformSelector::All, ..Default::default() };
        let mut host = HostBackend::from_config(specs, &cfg).unwrap();
        assert_eq!(host.devices()[1].context, 1);
        let buf = host.create_buffer(0, MemoryKind::HostShared, 8, None).unwrap();
        let err = host.write_buffer(1, buf, 0, &[0; 8]).unwrap_err();
        assert_eq!(err.device_index(), Some(1));
    }

    #[test]
    fn launch_runs_kernel_and_advances_clock() {
        let mut host = HostBackend::new(vec![HostDeviceSpec::new("d0").with_throughput(1e6)]).with_kernels([SCALE]);
        let trace = host.trace();
        let program = host.build_program(SCALE_SRC, "", "scale").unwrap();
        let kernel = host.create_kernel(program, 0, "scale").unwrap();
        let a = host.create_buffer(0, MemoryKind::Device { read_only: true }, 16, Some(bytes(&[1.0, 2.0, 3.0, 4.0]).as_slice())).unwrap();
        let b = host.create_buffer(0, MemoryKind::Device { read_only: false }, 16, None).unwrap();
        host.set_kernel_arg(kernel, 0, KernelArg::Buffer(a)).unwrap();
        host.set_kernel_arg(kernel, 1, KernelArg::Buffer(b)).unwrap();
        host.set_kernel_arg(kernel, 2, KernelArg::U32(3)).unwrap();

        let dims = LaunchDims { global_offset: 2, global_size: 2, local_size: 2 };
        let event = host.enqueue_kernel(0, kernel, dims).unwrap();
        host.finish(0).unwrap();

        let mut out = [0u8; 16];
        host.read_buffer(0, b, 0, &mut out).unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, f32>(&out), &[0.0, 0.0, 9.0, 12.0]);

        let times = host.profile(0, event).unwrap();
        assert_eq!(times.end_ns - times.start_ns, 2_000);
        assert_eq!(trace.launch_count(), 1);
        assert_eq!(trace.launches()[0].entry, "scale");
    }

    #[test]
    fn kernel_cannot_write_read_only_memory() {
        let mut host = HostBackend::uniform(1).with_kernels([SCALE]);
        let program = host.build_program(SCALE_SRC, "", "scale").unwrap();
        let kernel = host.create_kernel(program, 0, "scale").unwrap();
        let a = host.create_buffer(0, MemoryKind::HostShared, 16, None).unwrap();
        host.set_kernel_arg(kernel, 0, KernelArg::Buffer(a)).unwrap();
        host.set_kernel_arg(kernel, 1, KernelArg::Buffer(a)).unwrap();
        host.set_kernel_arg(kernel, 2, KernelArg::U32(1)).unwrap();
        let dims = LaunchDims { global_offset: 0, global_size: 4, local_size: 4 };
        let err = host.enqueue_kernel(0, kernel, dims).unwrap_err();
        assert!(err.to_string().contains("CL_INVALID_MEM_OBJECT"));
    }

    #[test]
    fn unregistered_entry_fails_to_build() {
        let mut host = HostBackend::uniform(2);
        let err = host.build_program(SCALE_SRC, "", "scale").unwrap_err();
        match err {
            OclError::Compile { device, log, .. } => {
                assert_eq!(device, 0);
                assert!(log.contains("no host implementation for kernel 'scale'"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unbalanced_source_fails_to_build() {
        let mut host = HostBackend::uniform(1).with_kernels([SCALE]);
        let err = host.build_program("__kernel void scale(uint k) {", "", "scale").unwrap_err();
        assert!(err.to_string().contains("unbalanced braces"));
    }

    #[test]
    fn injected_failure_fires_once() {
        let mut host = HostBackend::uniform(2);
        host.inject_failure(HostCall::CreateBuffer, Some(1), ClStatus::MEM_OBJECT_ALLOCATION_FAILURE);
        assert!(host.create_buffer(0, MemoryKind::Pinned, 8, None).is_ok());
        let err = host.create_buffer(1, MemoryKind::Pinned, 8, None).unwrap_err();
        assert!(err.to_string().contains("device 1: clCreateBuffer failed with CL_MEM_OBJECT_ALLOCATION_FAILURE"));
        assert!(host.create_buffer(1, MemoryKind::Pinned, 8, None).is_ok());
    }

    fn fill(launch: &mut HostLaunch<'_>) -> Result<()> {
        let LaunchDims { global_offset, global_size, .. } = launch.dims;
        let (args, out) = launch.split_output::<f32>(0)?;
        #[allow(clippy::cast_precision_loss)]
        let value = args.u64_arg(1)? as f32;
        out[global_offset..global_offset + global_size].fill(value);
        Ok(())
    }

    const FILL: HostKernel = HostKernel { entry: "fill", outputs: &[0], run: fill };
    const FILL_SRC: &str = "__kernel void fill(__global float* out, ulong v) { }";

    #[test]
    fn ulong_arguments_reach_the_kernel() {
        let mut host = HostBackend::uniform(1).with_kernels([FILL]);
        let program = host.build_program(FILL_SRC, "", "fill").unwrap();
        let kernel = host.create_kernel(program, 0, "fill").unwrap();
        let out = host.create_buffer(0, MemoryKind::Pinned, 16, None).unwrap();
        host.set_kernel_arg(kernel, 0, KernelArg::Buffer(out)).unwrap();
        host.set_kernel_arg(kernel, 1, KernelArg::U64(1 << 40)).unwrap();
        let dims = LaunchDims { global_offset: 1, global_size: 2, local_size: 1 };
        host.enqueue_kernel(0, kernel, dims).unwrap();

        let mut back = [0u8; 16];
        host.read_buffer(0, out, 0, &mut back).unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, f32>(&back), &[0.0, 1_099_511_627_776.0, 1_099_511_627_776.0, 0.0]);

        // A uint where a ulong is expected is rejected.
        host.set_kernel_arg(kernel, 1, KernelArg::U32(7)).unwrap();
        let err = host.enqueue_kernel(0, kernel, dims).unwrap_err();
        assert_eq!(err.device_index(), Some(0));
    }

    #[test]
    fn profiling_follows_throughput_and_overhead() {
        let spec = HostDeviceSpec::new("d0").with_throughput(1e6).with_launch_overhead_ns(500);
        let mut host = HostBackend::new(vec![spec]).with_kernels([FILL]);
        let trace = host.trace();
        let program = host.build_program(FILL_SRC, "", "fill").unwrap();
        let kernel = host.create_kernel(program, 0, "fill").unwrap();
        let out = host.create_buffer(0, MemoryKind::Pinned, 64, None).unwrap();
        host.set_kernel_arg(kernel, 0, KernelArg::Buffer(out)).unwrap();
        host.set_kernel_arg(kernel, 1, KernelArg::U64(1)).unwrap();
        let dims = LaunchDims { global_offset: 0, global_size: 16, local_size: 16 };

        let first = host.enqueue_kernel(0, kernel, dims).unwrap();
        let times = host.profile(0, first).unwrap();
        assert_eq!(times.end_ns - times.start_ns, 16_000 + 500);

        host.set_throughput(0, 4e6);
        let second = host.enqueue_kernel(0, kernel, dims).unwrap();
        let later = host.profile(0, second).unwrap();
        assert_eq!(later.start_ns, times.end_ns);
        assert_eq!(later.end_ns - later.start_ns, 4_000 + 500);

        assert_eq!(trace.live_events(), 2);
        host.release_event(first);
        host.release_event(second);
        host.release_event(second);
        assert_eq!(trace.live_events(), 0);
    }

    #[test]
    fn missing_argument_rejected_at_enqueue() {
        let mut host = HostBackend::uniform(1).with_kernels([SCALE]);
        let program = host.build_program(SCALE_SRC, "", "scale").unwrap();
        let kernel = host.create_kernel(program, 0, "scale").unwrap();
        host.set_kernel_arg(kernel, 2, KernelArg::U32(1)).unwrap();
        let dims = LaunchDims { global_offset: 0, global_size: 4, local_size: 4 };
        let err = host.enqueue_kernel(0, kernel, dims).unwrap_err();
        assert!(err.to_string().contains("CL_INVALID_KERNEL_ARGS"));
    }
}
