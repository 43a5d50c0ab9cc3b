//! Fan-out of per-device launches joined by a single barrier.

use sgocl_common::Result;
use tracing::trace;

use crate::backend::{EventId, KernelId, LaunchDims, ProfileTimes};
use crate::manager::DeviceManager;

/// Completed launch on one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaunchTiming {
    pub device: usize,
    pub times: ProfileTimes,
}

impl LaunchTiming {
    #[must_use]
    pub fn elapsed_seconds(&self) -> f64 {
        self.times.elapsed_seconds()
    }
}

/// Launches enqueued on independent device queues and not yet joined.
///
/// [`LaunchBatch::wait_all`] is the only blocking point. Events that were
/// never joined are released on drop.
#[derive(Debug)]
pub struct LaunchBatch {
    manager: DeviceManager,
    pending: Vec<(usize, EventId)>,
}

impl LaunchBatch {
    #[must_use]
    pub fn new(manager: &DeviceManager) -> Self {
        Self { manager: manager.clone(), pending: Vec::new() }
    }

    /// Enqueue `kernel` on `device` without waiting.
    pub fn enqueue(&mut self, device: usize, kernel: KernelId, dims: LaunchDims) -> Result<()> {
        let event = self.manager.lock()?.enqueue_kernel(device, kernel, dims)?;
        trace!("enqueued {kernel} on device {device}: {dims:?}");
        self.pending.push((device, event));
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Block until every enqueued launch finished and collect profiling
    /// times in enqueue order.
    pub fn wait_all(mut self) -> Result<Vec<LaunchTiming>> {
        let mut backend = self.manager.lock()?;
        let pending = std::mem::take(&mut self.pending);
        let mut result = Ok(());
        for &(device, _) in &pending {
            if let Err(e) = backend.finish(device) {
                result = Err(e);
                break;
            }
        }
        let mut timings = Vec::with_capacity(pending.len());
        for &(device, event) in &pending {
            if result.is_ok() {
                match backend.profile(device, event) {
                    Ok(times) => timings.push(LaunchTiming { device, times }),
                    Err(e) => result = Err(e),
                }
            }
            backend.release_event(event);
        }
        result.map(|()| timings)
    }
}

impl Drop for LaunchBatch {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if let Ok(mut backend) = self.manager.lock() {
            for (device, event) in self.pending.drain(..) {
                let _ = backend.finish(device);
                backend.release_event(event);
            }
        }
    }
}
