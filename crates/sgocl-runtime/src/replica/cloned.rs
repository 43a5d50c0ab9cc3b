//! Full per-device copies in device memory.

use sgocl_common::Result;
use tracing::debug;

use super::{Replica, ReplicaState, ReplicaStrategy};
use crate::backend::{BufferId, MemoryKind};
use crate::manager::DeviceManager;
use crate::segment::Segment;

/// Every device holds the complete array.
#[derive(Debug)]
pub struct ClonedBuffer {
    state: ReplicaState,
}

impl ClonedBuffer {
    /// Replica that kernels only read.
    #[must_use]
    pub fn new(manager: &DeviceManager) -> Self {
        Self { state: ReplicaState::new(manager) }
    }
}

impl Replica for ClonedBuffer {
    fn strategy(&self) -> ReplicaStrategy {
        ReplicaStrategy::Cloned
    }

    fn is_initialized(&self) -> bool {
        self.state.is_initialized()
    }

    fn element_size(&self) -> usize {
        self.state.element_size
    }

    fn element_count(&self) -> usize {
        self.state.element_count
    }

    fn initialize(&mut self, initial: Option<&[u8]>, element_size: usize, element_count: usize) -> Result<()> {
        if self.state.begin_initialize(initial, element_size, element_count)? {
            return Ok(());
        }
        let size = self.state.size_bytes();
        let kind = MemoryKind::Device { read_only: true };
        let devices = self.state.manager.num_devices();
        let mut buffers = Vec::with_capacity(devices);
        for d in 0..devices {
            match self.state.manager.allocate(d, kind, size, initial) {
                Ok(b) => buffers.push(b),
                Err(e) => {
                    self.state.free();
                    return Err(e);
                }
            }
        }
        self.state.buffers = buffers;
        debug!("cloned buffer allocated: {element_count} elems x {devices} devices, {size} bytes each");
        Ok(())
    }

    fn handle(&self, device: usize) -> Result<BufferId> {
        self.state.ensure_initialized()?;
        self.state.buffers.get(device).map(|b| b.id()).ok_or_else(|| {
            sgocl_common::OclError::InvalidArgument(format!("no cloned replica for device {device}"))
        })
    }

    fn write(&mut self, host: &[u8], segments: Option<&[Segment]>) -> Result<()> {
        self.state.check_transfer(host.len(), segments)?;
        let elem = self.state.element_size;
        let mut backend = self.state.manager.lock()?;
        for (d, buf) in self.state.buffers.iter().enumerate() {
            match segments {
                None => backend.write_buffer(d, buf.id(), 0, host)?,
                Some(segs) if !segs[d].is_empty() => {
                    let r = segs[d].byte_range(elem);
                    backend.write_buffer(d, buf.id(), r.start, &host[r])?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn read(&mut self, host: &mut [u8], segments: Option<&[Segment]>) -> Result<()> {
        self.state.check_transfer(host.len(), segments)?;
        let elem = self.state.element_size;
        let mut backend = self.state.manager.lock()?;
        match segments {
            None => backend.read_buffer(0, self.state.buffers[0].id(), 0, host)?,
            Some(segs) => {
                for (d, buf) in self.state.buffers.iter().enumerate() {
                    if segs[d].is_empty() {
                        continue;
                    }
                    let r = segs[d].byte_range(elem);
                    backend.read_buffer(d, buf.id(), r.start, &mut host[r])?;
                }
            }
        }
        Ok(())
    }

    fn read_range(&mut self, device: usize, start: usize, end: usize, host: &mut [u8]) -> Result<()> {
        self.state.check_transfer(host.len(), None)?;
        self.state.check_range(device, start, end)?;
        if start == end {
            return Ok(());
        }
        let id = self.handle(device)?;
        let r = Segment::new(start, end).byte_range(self.state.element_size);
        self.state.manager.lock()?.read_buffer(device, id, r.start, &mut host[r])
    }

    fn free(&mut self) {
        self.state.free();
    }
}
