//! The compute-backend seam.
//!
//! Everything above this trait speaks in opaque handles and byte slices;
//! everything below it talks to a concrete runtime. [`HostBackend`]
//! executes on the CPU for tests and machines without an ICD, and
//! `OpenClBackend` (feature `opencl`) drives real devices.
//!
//! [`HostBackend`]: crate::host::HostBackend

use std::fmt;

use sgocl_common::{DeviceTypeFilter, Result};

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

define_handle!(
    /// A device allocation.
    BufferId
);
define_handle!(
    /// A compiled program, shared by every device in its context.
    ProgramId
);
define_handle!(
    /// A kernel object bound to one device.
    KernelId
);
define_handle!(
    /// A profiling-enabled completion event.
    EventId
);

/// Placement and access flags of a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Plain device memory (`CL_MEM_READ_WRITE` or `CL_MEM_READ_ONLY`).
    Device { read_only: bool },
    /// Host-accessible memory for map/unmap round trips
    /// (`CL_MEM_READ_WRITE | CL_MEM_ALLOC_HOST_PTR`).
    Pinned,
    /// Host-resident memory read by every device of a context
    /// (`CL_MEM_READ_ONLY | CL_MEM_ALLOC_HOST_PTR`).
    HostShared,
}

impl MemoryKind {
    /// Whether kernels may write the allocation.
    #[must_use]
    pub const fn kernel_writable(self) -> bool {
        match self {
            Self::Device { read_only } => !read_only,
            Self::Pinned => true,
            Self::HostShared => false,
        }
    }
}

/// A value bound to a kernel parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    Buffer(BufferId),
    U32(u32),
    U64(u64),
}

/// One-dimensional launch geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    pub global_offset: usize,
    pub global_size: usize,
    pub local_size: usize,
}

/// Profiling timestamps of a completed command, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileTimes {
    pub start_ns: u64,
    pub end_ns: u64,
}

impl ProfileTimes {
    /// Elapsed device time in seconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn elapsed_seconds(&self) -> f64 {
        self.end_ns.saturating_sub(self.start_ns) as f64 * 1e-9
    }
}

/// Static description of a selected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Position in the backend's device list.
    pub index: usize,
    pub name: String,
    pub vendor: String,
    pub platform: String,
    pub device_type: DeviceTypeFilter,
    /// Context the device belongs to; buffers are shared within a context.
    pub context: usize,
    pub max_work_group_size: usize,
    pub extensions: Vec<String>,
}

impl DeviceInfo {
    /// Whether the device advertises extension `name`.
    #[must_use]
    pub fn supports(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e == name)
    }
}

/// Heterogeneous-compute runtime driven by a single host thread.
///
/// Every call that can fail reports the device index, the runtime call
/// and the status code through [`sgocl_common::OclError::Device`].
/// `release_*` methods are infallible so they can run from `Drop`.
pub trait ComputeBackend: Send {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Selected devices, indexed by [`DeviceInfo::index`].
    fn devices(&self) -> &[DeviceInfo];

    // ── Memory ──────────────────────────────────────────────────

    /// Allocate `size_bytes` in the context of `device`, optionally
    /// initialised from `init`.
    fn create_buffer(
        &mut self,
        device: usize,
        kind: MemoryKind,
        size_bytes: usize,
        init: Option<&[u8]>,
    ) -> Result<BufferId>;

    /// Blocking transfer of `data` to `buffer` at `offset` bytes.
    fn write_buffer(&mut self, device: usize, buffer: BufferId, offset: usize, data: &[u8])
    -> Result<()>;

    /// Blocking transfer from `buffer` at `offset` bytes into `out`.
    fn read_buffer(&mut self, device: usize, buffer: BufferId, offset: usize, out: &mut [u8])
    -> Result<()>;

    /// Map the region for writing, copy `data` in, unmap.
    fn map_write(&mut self, device: usize, buffer: BufferId, offset: usize, data: &[u8])
    -> Result<()>;

    /// Map the region for reading, copy it into `out`, unmap.
    fn map_read(&mut self, device: usize, buffer: BufferId, offset: usize, out: &mut [u8])
    -> Result<()>;

    fn release_buffer(&mut self, buffer: BufferId);

    // ── Programs and kernels ────────────────────────────────────

    /// Compile `source` for every device. `label` names the program in
    /// diagnostics; a failure carries the first failing device's log.
    fn build_program(&mut self, source: &str, options: &str, label: &str) -> Result<ProgramId>;

    /// Compiler output of `program` on `device`.
    fn build_log(&self, program: ProgramId, device: usize) -> Result<String>;

    fn create_kernel(&mut self, program: ProgramId, device: usize, entry: &str)
    -> Result<KernelId>;

    fn release_program(&mut self, program: ProgramId);

    fn release_kernel(&mut self, kernel: KernelId);

    fn set_kernel_arg(&mut self, kernel: KernelId, index: u32, arg: KernelArg) -> Result<()>;

    // ── Execution ───────────────────────────────────────────────

    /// Enqueue `kernel` on the queue of `device` without waiting.
    fn enqueue_kernel(&mut self, device: usize, kernel: KernelId, dims: LaunchDims)
    -> Result<EventId>;

    /// Block until every command on the queue of `device` completed.
    fn finish(&mut self, device: usize) -> Result<()>;

    /// Profiling timestamps of a completed command.
    fn profile(&mut self, device: usize, event: EventId) -> Result<ProfileTimes>;

    fn release_event(&mut self, event: EventId);
}
