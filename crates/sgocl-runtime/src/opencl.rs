//! OpenCL backend over the system ICD loader.
//!
//! One context per platform group (a single context unless `PLATFORM` is
//! `"all"`), one profiling-enabled in-order queue per device, one program
//! per context and one kernel object per device.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;

use opencl3::command_queue::{CL_QUEUE_PROFILING_ENABLE, CommandQueue};
use opencl3::context::Context;
use opencl3::device::{
    CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU, Device,
};
use opencl3::event::Event;
use opencl3::kernel::Kernel;
use opencl3::memory::{
    Buffer, CL_MAP_READ, CL_MAP_WRITE, CL_MEM_ALLOC_HOST_PTR, CL_MEM_COPY_HOST_PTR, CL_MEM_READ_ONLY,
    CL_MEM_READ_WRITE, ClMem,
};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{CL_BLOCKING, cl_device_id, cl_mem, cl_mem_flags};
use sgocl_common::{ClStatus, DeviceTypeFilter, OclConfig, OclError, Result};
use tracing::{debug, info};

use crate::backend::{
    BufferId, ComputeBackend, DeviceInfo, EventId, KernelArg, KernelId, LaunchDims, MemoryKind,
    ProfileTimes, ProgramId,
};
use crate::selection::{PlatformDevices, select_devices};

struct ClDevice {
    id: cl_device_id,
    queue: CommandQueue,
}

/// [`ComputeBackend`] on real OpenCL devices.
pub struct OpenClBackend {
    infos: Vec<DeviceInfo>,
    devices: Vec<ClDevice>,
    contexts: Vec<Context>,
    buffers: HashMap<BufferId, (usize, Buffer<u8>)>,
    /// One program per context.
    programs: HashMap<ProgramId, Vec<Program>>,
    kernels: HashMap<KernelId, (usize, Kernel)>,
    events: HashMap<EventId, Event>,
    next_id: u64,
}

// SAFETY: the backend is only reachable through the DeviceManager mutex,
// so no two threads touch its OpenCL handles at the same time.
unsafe impl Send for OpenClBackend {}

impl std::fmt::Debug for OpenClBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClBackend")
            .field("devices", &self.infos.len())
            .field("contexts", &self.contexts.len())
            .field("buffers", &self.buffers.len())
            .finish_non_exhaustive()
    }
}

fn device_kind(device: &Device) -> DeviceTypeFilter {
    let bits = device.dev_type().unwrap_or(CL_DEVICE_TYPE_ALL);
    if bits & CL_DEVICE_TYPE_GPU != 0 {
        DeviceTypeFilter::Gpu
    } else if bits & CL_DEVICE_TYPE_CPU != 0 {
        DeviceTypeFilter::Cpu
    } else if bits & CL_DEVICE_TYPE_ACCELERATOR != 0 {
        DeviceTypeFilter::Accelerator
    } else {
        DeviceTypeFilter::All
    }
}

const fn mem_flags(kind: MemoryKind) -> cl_mem_flags {
    match kind {
        MemoryKind::Device { read_only: true } => CL_MEM_READ_ONLY,
        MemoryKind::Device { read_only: false } => CL_MEM_READ_WRITE,
        MemoryKind::Pinned => CL_MEM_READ_WRITE | CL_MEM_ALLOC_HOST_PTR,
        MemoryKind::HostShared => CL_MEM_READ_ONLY | CL_MEM_ALLOC_HOST_PTR,
    }
}

impl OpenClBackend {
    /// Enumerate platforms and open the devices selected by `config`.
    pub fn from_config(config: &OclConfig) -> Result<Self> {
        let platforms = get_platforms().map_err(|_| OclError::NoPlatforms)?;
        if platforms.is_empty() {
            return Err(OclError::NoPlatforms);
        }

        let mut listing = Vec::with_capacity(platforms.len());
        let mut ids: Vec<Vec<cl_device_id>> = Vec::with_capacity(platforms.len());
        for platform in &platforms {
            let name = platform.name().unwrap_or_default();
            let device_ids = platform.get_devices(CL_DEVICE_TYPE_ALL).unwrap_or_default();
            debug!("Scanning OpenCL platform: {} ({} devices)", name, device_ids.len());
            let device_types = device_ids.iter().map(|&id| device_kind(&Device::new(id))).collect();
            listing.push(PlatformDevices { name, device_types });
            ids.push(device_ids);
        }

        let selected = select_devices(&listing, config)?;
        let context_count = selected.iter().map(|s| s.context).max().map_or(0, |m| m + 1);

        let mut contexts = Vec::with_capacity(context_count);
        for c in 0..context_count {
            let members: Vec<cl_device_id> =
                selected.iter().filter(|s| s.context == c).map(|s| ids[s.platform][s.device]).collect();
            let first = selected.iter().position(|s| s.context == c).unwrap_or(0);
            let context = Context::from_devices(&members, &[], None, ptr::null_mut())
                .map_err(|e| OclError::device(first, "clCreateContext", e.0))?;
            contexts.push(context);
        }

        let mut infos = Vec::with_capacity(selected.len());
        let mut devices = Vec::with_capacity(selected.len());
        for (index, s) in selected.iter().enumerate() {
            let id = ids[s.platform][s.device];
            let device = Device::new(id);
            let queue = unsafe {
                CommandQueue::create_with_properties(&contexts[s.context], id, CL_QUEUE_PROFILING_ENABLE, 0)
            }
            .map_err(|e| OclError::device(index, "clCreateCommandQueue", e.0))?;

            let info = DeviceInfo {
                index,
                name: device.name().unwrap_or_default(),
                vendor: device.vendor().unwrap_or_default(),
                platform: listing[s.platform].name.clone(),
                device_type: device_kind(&device),
                context: s.context,
                max_work_group_size: device.max_work_group_size().unwrap_or(1),
                extensions: device
                    .extensions()
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            };
            if config.ocl_manager_verbose {
                info!("OpenCL device {index}: {} on '{}'", info.name, info.platform);
            }
            infos.push(info);
            devices.push(ClDevice { id, queue });
        }

        Ok(Self {
            infos,
            devices,
            contexts,
            buffers: HashMap::new(),
            programs: HashMap::new(),
            kernels: HashMap::new(),
            events: HashMap::new(),
            next_id: 1,
        })
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn device(&self, device: usize, call: &'static str) -> Result<&ClDevice> {
        self.devices
            .get(device)
            .ok_or(OclError::Device { device, call, code: ClStatus::INVALID_DEVICE })
    }

    fn buffer_in_context(&self, device: usize, buffer: BufferId, call: &'static str) -> Result<&Buffer<u8>> {
        let Some(info) = self.infos.get(device) else {
            return Err(OclError::Device { device, call, code: ClStatus::INVALID_DEVICE });
        };
        match self.buffers.get(&buffer) {
            Some((context, buf)) if *context == info.context => Ok(buf),
            _ => Err(OclError::Device { device, call, code: ClStatus::INVALID_MEM_OBJECT }),
        }
    }

    fn map_copy(
        &mut self,
        device: usize,
        buffer: BufferId,
        offset: usize,
        len: usize,
        write: bool,
        mut copy: impl FnMut(*mut u8),
    ) -> Result<()> {
        let call = "clEnqueueMapBuffer";
        if len == 0 {
            return Ok(());
        }
        self.buffer_in_context(device, buffer, call)?;
        let context = self.infos[device].context;
        let queue = &self.devices[device].queue;
        let Some((_, buf)) = self.buffers.get_mut(&buffer).filter(|(c, _)| *c == context) else {
            return Err(OclError::Device { device, call, code: ClStatus::INVALID_MEM_OBJECT });
        };
        let flags = if write { CL_MAP_WRITE } else { CL_MAP_READ };
        let mut mapped: cl_mem = ptr::null_mut();
        unsafe {
            queue
                .enqueue_map_buffer(buf, CL_BLOCKING, flags, offset, len, &mut mapped, &[])
                .map_err(|e| OclError::device(device, call, e.0))?;
            copy(mapped.cast::<u8>());
            let event = queue
                .enqueue_unmap_mem_object(buf.get(), mapped.cast::<c_void>(), &[])
                .map_err(|e| OclError::device(device, "clEnqueueUnmapMemObject", e.0))?;
            event.wait().map_err(|e| OclError::device(device, "clWaitForEvents", e.0))?;
        }
        Ok(())
    }
}

impl ComputeBackend for OpenClBackend {
    fn name(&self) -> &str {
        "opencl"
    }

    fn devices(&self) -> &[DeviceInfo] {
        &self.infos
    }

    fn create_buffer(
        &mut self,
        device: usize,
        kind: MemoryKind,
        size_bytes: usize,
        init: Option<&[u8]>,
    ) -> Result<BufferId> {
        let call = "clCreateBuffer";
        self.device(device, call)?;
        let context = self.infos[device].context;
        let (flags, host_ptr) = match init {
            Some(data) if data.len() == size_bytes => {
                (mem_flags(kind) | CL_MEM_COPY_HOST_PTR, data.as_ptr().cast_mut().cast::<c_void>())
            }
            Some(_) => return Err(OclError::Device { device, call, code: ClStatus::INVALID_VALUE }),
            None => (mem_flags(kind), ptr::null_mut()),
        };
        // COPY_HOST_PTR copies during creation, so `init` need not outlive the call.
        let buf = unsafe { Buffer::<u8>::create(&self.contexts[context], flags, size_bytes, host_ptr) }
            .map_err(|e| OclError::device(device, call, e.0))?;
        let id = BufferId(self.next());
        debug!("OpenCL buffer {id}: {size_bytes} bytes, {kind:?}, context {context}");
        self.buffers.insert(id, (context, buf));
        Ok(id)
    }

    fn write_buffer(&mut self, device: usize, buffer: BufferId, offset: usize, data: &[u8]) -> Result<()> {
        let call = "clEnqueueWriteBuffer";
        self.buffer_in_context(device, buffer, call)?;
        let context = self.infos[device].context;
        let queue = &self.devices[device].queue;
        let Some((_, buf)) = self.buffers.get_mut(&buffer).filter(|(c, _)| *c == context) else {
            return Err(OclError::Device { device, call, code: ClStatus::INVALID_MEM_OBJECT });
        };
        unsafe {
            queue
                .enqueue_write_buffer(buf, CL_BLOCKING, offset, data, &[])
                .map_err(|e| OclError::device(device, call, e.0))?;
        }
        Ok(())
    }

    fn read_buffer(&mut self, device: usize, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<()> {
        let call = "clEnqueueReadBuffer";
        let buf = self.buffer_in_context(device, buffer, call)?;
        let queue = &self.device(device, call)?.queue;
        unsafe {
            queue
                .enqueue_read_buffer(buf, CL_BLOCKING, offset, out, &[])
                .map_err(|e| OclError::device(device, call, e.0))?;
        }
        Ok(())
    }

    fn map_write(&mut self, device: usize, buffer: BufferId, offset: usize, data: &[u8]) -> Result<()> {
        self.map_copy(device, buffer, offset, data.len(), true, |dst| unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        })
    }

    fn map_read(&mut self, device: usize, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<()> {
        let len = out.len();
        let dst = out.as_mut_ptr();
        self.map_copy(device, buffer, offset, len, false, |src| unsafe {
            ptr::copy_nonoverlapping(src.cast_const(), dst, len);
        })
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
    }

    fn build_program(&mut self, source: &str, options: &str, label: &str) -> Result<ProgramId> {
        let mut programs = Vec::with_capacity(self.contexts.len());
        for (c, context) in self.contexts.iter().enumerate() {
            let first = self.infos.iter().position(|i| i.context == c).unwrap_or(0);
            let mut program = Program::create_from_source(context, source)
                .map_err(|e| OclError::device(first, "clCreateProgramWithSource", e.0))?;
            if let Err(e) = program.build(context.devices(), options) {
                // Report the first device whose compiler produced output.
                let mut failing = (first, String::new());
                for info in self.infos.iter().filter(|i| i.context == c) {
                    let log = program.get_build_log(self.devices[info.index].id).unwrap_or_default();
                    if !log.trim().is_empty() {
                        failing = (info.index, log);
                        break;
                    }
                }
                return Err(OclError::Compile {
                    device: failing.0,
                    kernel: label.to_string(),
                    code: ClStatus(e.0),
                    log: failing.1,
                });
            }
            programs.push(program);
        }
        let id = ProgramId(self.next());
        info!("Compiled OpenCL program from source: {}", label);
        self.programs.insert(id, programs);
        Ok(id)
    }

    fn build_log(&self, program: ProgramId, device: usize) -> Result<String> {
        let call = "clGetProgramBuildInfo";
        let programs = self.programs.get(&program).ok_or(OclError::Device { device, call, code: ClStatus::INVALID_PROGRAM })?;
        let context = self.infos.get(device).ok_or(OclError::Device { device, call, code: ClStatus::INVALID_DEVICE })?.context;
        programs[context].get_build_log(self.devices[device].id).map_err(|e| OclError::device(device, call, e.0))
    }

    fn create_kernel(&mut self, program: ProgramId, device: usize, entry: &str) -> Result<KernelId> {
        let call = "clCreateKernel";
        let context = self.infos.get(device).ok_or(OclError::Device { device, call, code: ClStatus::INVALID_DEVICE })?.context;
        let programs = self.programs.get(&program).ok_or(OclError::Device { device, call, code: ClStatus::INVALID_PROGRAM })?;
        let kernel = Kernel::create(&programs[context], entry).map_err(|e| OclError::device(device, call, e.0))?;
        let id = KernelId(self.next());
        self.kernels.insert(id, (device, kernel));
        Ok(id)
    }

    fn release_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
    }

    fn release_kernel(&mut self, kernel: KernelId) {
        self.kernels.remove(&kernel);
    }

    fn set_kernel_arg(&mut self, kernel: KernelId, index: u32, arg: KernelArg) -> Result<()> {
        let call = "clSetKernelArg";
        let (device, k) = self.kernels.get(&kernel).ok_or(OclError::Device { device: 0, call, code: ClStatus::INVALID_KERNEL })?;
        let device = *device;
        let result = match arg {
            KernelArg::Buffer(id) => {
                let mem = self.buffer_in_context(device, id, call)?.get();
                unsafe { k.set_arg(index, &mem) }
            }
            KernelArg::U32(v) => unsafe { k.set_arg(index, &v) },
            KernelArg::U64(v) => unsafe { k.set_arg(index, &v) },
        };
        result.map_err(|e| OclError::device(device, call, e.0))
    }

    fn enqueue_kernel(&mut self, device: usize, kernel: KernelId, dims: LaunchDims) -> Result<EventId> {
        let call = "clEnqueueNDRangeKernel";
        let queue = &self.device(device, call)?.queue;
        let k = match self.kernels.get(&kernel) {
            Some((owner, k)) if *owner == device => k,
            _ => return Err(OclError::Device { device, call, code: ClStatus::INVALID_KERNEL }),
        };
        let offsets = [dims.global_offset];
        let globals = [dims.global_size];
        let locals = [dims.local_size];
        let event = unsafe {
            queue.enqueue_nd_range_kernel(k.get(), 1, offsets.as_ptr(), globals.as_ptr(), locals.as_ptr(), &[])
        }
        .map_err(|e| OclError::device(device, call, e.0))?;
        let id = EventId(self.next());
        self.events.insert(id, event);
        Ok(id)
    }

    fn finish(&mut self, device: usize) -> Result<()> {
        let call = "clFinish";
        self.device(device, call)?.queue.finish().map_err(|e| OclError::device(device, call, e.0))
    }

    fn profile(&mut self, device: usize, event: EventId) -> Result<ProfileTimes> {
        let call = "clGetEventProfilingInfo";
        let ev = self.events.get(&event).ok_or(OclError::Device { device, call, code: ClStatus::INVALID_EVENT })?;
        ev.wait().map_err(|e| OclError::device(device, "clWaitForEvents", e.0))?;
        let start_ns = ev.profiling_command_start().map_err(|e| OclError::device(device, call, e.0))?;
        let end_ns = ev.profiling_command_end().map_err(|e| OclError::device(device, call, e.0))?;
        Ok(ProfileTimes { start_ns, end_ns })
    }

    fn release_event(&mut self, event: EventId) {
        self.events.remove(&event);
    }
}
