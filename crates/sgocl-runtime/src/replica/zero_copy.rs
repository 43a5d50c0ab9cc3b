//! Host-resident read-only buffers shared by every device of a context.

use sgocl_common::{OclError, Result};
use tracing::debug;

use super::{Replica, ReplicaState, ReplicaStrategy};
use crate::backend::{BufferId, MemoryKind};
use crate::manager::DeviceManager;
use crate::segment::Segment;

/// A single allocation per context, mapped by all of its devices.
#[derive(Debug)]
pub struct ZeroCopyBuffer {
    state: ReplicaState,
    /// Index into `state.buffers` for each device.
    slot_of_device: Vec<usize>,
    /// Device used to access each buffer.
    owner_of_slot: Vec<usize>,
}

impl ZeroCopyBuffer {
    #[must_use]
    pub fn new(manager: &DeviceManager) -> Self {
        let mut slot_of_device = Vec::with_capacity(manager.num_devices());
        let mut contexts: Vec<usize> = Vec::new();
        let mut owner_of_slot = Vec::new();
        for d in manager.devices() {
            let slot = match contexts.iter().position(|&c| c == d.context) {
                Some(s) => s,
                None => {
                    contexts.push(d.context);
                    owner_of_slot.push(d.index);
                    contexts.len() - 1
                }
            };
            slot_of_device.push(slot);
        }
        Self { state: ReplicaState::new(manager), slot_of_device, owner_of_slot }
    }

    fn slot(&self, device: usize) -> Result<usize> {
        self.slot_of_device
            .get(device)
            .copied()
            .ok_or_else(|| OclError::InvalidArgument(format!("no shared replica for device {device}")))
    }
}

impl Replica for ZeroCopyBuffer {
    fn strategy(&self) -> ReplicaStrategy {
        ReplicaStrategy::ZeroCopy
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
        let mut buffers = Vec::with_capacity(self.owner_of_slot.len());
        for &owner in &self.owner_of_slot {
            match self.state.manager.allocate(owner, MemoryKind::HostShared, size, initial) {
                Ok(b) => buffers.push(b),
                Err(e) => {
                    self.state.free();
                    return Err(e);
                }
            }
        }
        self.state.buffers = buffers;
        debug!(
            "shared buffer allocated: {element_count} elems, {size} bytes in {} context(s)",
            self.owner_of_slot.len()
        );
        Ok(())
    }

    fn handle(&self, device: usize) -> Result<BufferId> {
        self.state.ensure_initialized()?;
        Ok(self.state.buffers[self.slot(device)?].id())
    }

    fn write(&mut self, host: &[u8], segments: Option<&[Segment]>) -> Result<()> {
        self.state.check_transfer(host.len(), segments)?;
        let elem = self.state.element_size;
        let mut backend = self.state.manager.lock()?;
        match segments {
            None => {
                for (slot, buf) in self.state.buffers.iter().enumerate() {
                    backend.map_write(self.owner_of_slot[slot], buf.id(), 0, host)?;
                }
            }
            Some(segs) => {
                for (d, seg) in segs.iter().enumerate() {
                    if seg.is_empty() {
                        continue;
                    }
                    let buf = &self.state.buffers[self.slot_of_device[d]];
                    let r = seg.byte_range(elem);
                    backend.map_write(d, buf.id(), r.start, &host[r])?;
                }
            }
        }
        Ok(())
    }

    fn read(&mut self, host: &mut [u8], segments: Option<&[Segment]>) -> Result<()> {
        self.state.check_transfer(host.len(), segments)?;
        let elem = self.state.element_size;
        let mut backend = self.state.manager.lock()?;
        match segments {
            None => backend.map_read(self.owner_of_slot[0], self.state.buffers[0].id(), 0, host)?,
            Some(segs) => {
                for (d, seg) in segs.iter().enumerate() {
                    if seg.is_empty() {
                        continue;
                    }
                    let buf = &self.state.buffers[self.slot_of_device[d]];
                    let r = seg.byte_range(elem);
                    backend.map_read(d, buf.id(), r.start, &mut host[r])?;
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
        self.state.manager.lock()?.map_read(device, id, r.start, &mut host[r])
    }

    fn free(&mut self) {
        self.state.free();
    }
}
