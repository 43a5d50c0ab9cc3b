//! Device-side replicas of host arrays.
//!
//! Three strategies sit behind the [`Replica`] capability trait:
//!
//! - [`ClonedBuffer`]: a full copy in device memory on every device.
//!   Writes broadcast; reads pull each device's owned segment.
//! - [`StretchedBuffer`]: one pinned (`ALLOC_HOST_PTR`) allocation per
//!   device, accessed by map, memcpy and unmap. Only the segment a device
//!   computed is read back.
//! - [`ZeroCopyBuffer`]: one host-resident read-only allocation per
//!   context, shared by every device in it.
//!
//! [`ReplicaBuffer`] is the typed front end; the strategy is chosen from
//! the data's [`AccessPattern`] at construction.

mod cloned;
mod stretched;
mod zero_copy;

use std::marker::PhantomData;

use sgocl_common::{OclError, Result};

use crate::backend::BufferId;
use crate::manager::{DeviceBuffer, DeviceManager};
use crate::segment::Segment;

pub use cloned::ClonedBuffer;
pub use stretched::StretchedBuffer;
pub use zero_copy::ZeroCopyBuffer;

/// How a host array is used by the kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessPattern {
    /// Every device reads all of it; kernels do not write it.
    Broadcast,
    /// Written by the host and by kernels, read back per device segment.
    PinnedRoundTrip,
    /// Large read-only input shared by every device.
    SharedReadOnly,
}

/// Replication strategy of a [`Replica`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaStrategy {
    Cloned,
    Stretched,
    ZeroCopy,
}

/// Capability interface shared by all replication strategies.
///
/// Lengths and offsets of `write`/`read` are in bytes of the whole host
/// array; segments are in elements and give one range per device.
pub trait Replica: Send {
    fn strategy(&self) -> ReplicaStrategy;

    fn is_initialized(&self) -> bool;

    fn element_size(&self) -> usize;

    fn element_count(&self) -> usize;

    /// Allocate device storage, optionally filled from `initial`.
    ///
    /// A no-op when already initialised with the same shape.
    fn initialize(&mut self, initial: Option<&[u8]>, element_size: usize, element_count: usize)
    -> Result<()>;

    /// Handle to bind as a kernel argument on `device`.
    fn handle(&self, device: usize) -> Result<BufferId>;

    /// Copy host data to the device side; the whole array when
    /// `segments` is `None`, else each device's segment.
    fn write(&mut self, host: &[u8], segments: Option<&[Segment]>) -> Result<()>;

    /// Copy device data back; the whole array (from device 0) when
    /// `segments` is `None`, else each device's segment from that device.
    fn read(&mut self, host: &mut [u8], segments: Option<&[Segment]>) -> Result<()>;

    /// Read elements `[start, end)` of `device` into the matching bytes of
    /// `host`.
    fn read_range(&mut self, device: usize, start: usize, end: usize, host: &mut [u8]) -> Result<()>;

    /// Release every allocation. Safe to call repeatedly.
    fn free(&mut self);
}

// ── Shared state ────────────────────────────────────────────────────

/// Shape and allocations common to all strategies.
#[derive(Debug)]
struct ReplicaState {
    manager: DeviceManager,
    element_size: usize,
    element_count: usize,
    buffers: Vec<DeviceBuffer>,
}

impl ReplicaState {
    fn new(manager: &DeviceManager) -> Self {
        Self { manager: manager.clone(), element_size: 0, element_count: 0, buffers: Vec::new() }
    }

    fn is_initialized(&self) -> bool {
        !self.buffers.is_empty()
    }

    fn size_bytes(&self) -> usize {
        self.element_size * self.element_count
    }

    /// `Ok(true)` when allocation can be skipped.
    fn begin_initialize(
        &mut self,
        initial: Option<&[u8]>,
        element_size: usize,
        element_count: usize,
    ) -> Result<bool> {
        if self.is_initialized() {
            if element_size == self.element_size && element_count == self.element_count {
                return Ok(true);
            }
            return Err(OclError::InvalidArgument(format!(
                "replica already holds {} elements of {} bytes, cannot reinitialise with {element_count} of {element_size}",
                self.element_count, self.element_size
            )));
        }
        if element_size == 0 || element_count == 0 {
            return Err(OclError::InvalidArgument("cannot allocate an empty replica".into()));
        }
        let size = element_size.checked_mul(element_count).ok_or_else(|| {
            OclError::InvalidArgument(format!("{element_count} x {element_size} bytes overflows usize"))
        })?;
        if let Some(data) = initial {
            if data.len() != size {
                return Err(OclError::InvalidArgument(format!(
                    "initial data is {} bytes, replica needs {size}",
                    data.len()
                )));
            }
        }
        self.element_size = element_size;
        self.element_count = element_count;
        Ok(false)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(OclError::InvalidArgument("replica used before initialisation".into()))
        }
    }

    /// Validate a host array and optional per-device segments.
    fn check_transfer(&self, host_len: usize, segments: Option<&[Segment]>) -> Result<()> {
        self.ensure_initialized()?;
        if host_len != self.size_bytes() {
            return Err(OclError::InvalidArgument(format!(
                "host array is {host_len} bytes, replica holds {}",
                self.size_bytes()
            )));
        }
        if let Some(segs) = segments {
            let devices = self.manager.num_devices();
            if segs.len() != devices {
                return Err(OclError::InvalidArgument(format!(
                    "{} segments given for {devices} devices",
                    segs.len()
                )));
            }
            for (d, s) in segs.iter().enumerate() {
                self.check_range(d, s.start, s.end)?;
            }
        }
        Ok(())
    }

    fn check_range(&self, device: usize, start: usize, end: usize) -> Result<()> {
        if start > end || end > self.element_count {
            return Err(OclError::InvalidArgument(format!(
                "segment [{start}, {end}) of device {device} outside replica of {} elements",
                self.element_count
            )));
        }
        Ok(())
    }

    fn free(&mut self) {
        self.buffers.clear();
        self.element_size = 0;
        self.element_count = 0;
    }
}

// ── Typed front end ─────────────────────────────────────────────────

/// A replica of a `[T]` host array.
pub struct ReplicaBuffer<T: bytemuck::Pod> {
    inner: Box<dyn Replica>,
    _marker: PhantomData<T>,
}

impl<T: bytemuck::Pod> std::fmt::Debug for ReplicaBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaBuffer")
            .field("strategy", &self.inner.strategy())
            .field("len", &self.inner.element_count())
            .field("elem_size", &std::mem::size_of::<T>())
            .finish()
    }
}

impl<T: bytemuck::Pod> ReplicaBuffer<T> {
    /// Replica whose strategy matches `pattern`.
    #[must_use]
    pub fn new(manager: &DeviceManager, pattern: AccessPattern) -> Self {
        let inner: Box<dyn Replica> = match pattern {
            AccessPattern::Broadcast => Box::new(ClonedBuffer::new(manager)),
            AccessPattern::PinnedRoundTrip => Box::new(StretchedBuffer::new(manager)),
            AccessPattern::SharedReadOnly => Box::new(ZeroCopyBuffer::new(manager)),
        };
        Self { inner, _marker: PhantomData }
    }

    #[must_use]
    pub fn strategy(&self) -> ReplicaStrategy {
        self.inner.strategy()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    /// Number of elements held, 0 before initialisation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.element_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate and fill from `data`; no-op if already allocated with
    /// `data.len()` elements.
    pub fn initialize(&mut self, data: &[T]) -> Result<()> {
        self.inner.initialize(Some(bytemuck::cast_slice(data)), std::mem::size_of::<T>(), data.len())
    }

    /// Allocate `count` elements without initial contents.
    pub fn initialize_uninit(&mut self, count: usize) -> Result<()> {
        self.inner.initialize(None, std::mem::size_of::<T>(), count)
    }

    pub fn handle(&self, device: usize) -> Result<BufferId> {
        self.inner.handle(device)
    }

    pub fn write(&mut self, data: &[T], segments: Option<&[Segment]>) -> Result<()> {
        self.inner.write(bytemuck::cast_slice(data), segments)
    }

    pub fn read(&mut self, out: &mut [T], segments: Option<&[Segment]>) -> Result<()> {
        self.inner.read(bytemuck::cast_slice_mut(out), segments)
    }

    /// Read elements `[start, end)` computed by `device` into `out[start..end]`.
    pub fn read_range(&mut self, device: usize, start: usize, end: usize, out: &mut [T]) -> Result<()> {
        self.inner.read_range(device, start, end, bytemuck::cast_slice_mut(out))
    }

    pub fn free(&mut self) {
        self.inner.free();
    }
}
