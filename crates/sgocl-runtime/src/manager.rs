//! Device ownership, kernel compilation and RAII device handles.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use sgocl_common::{OclConfig, OclError, Result};
use tracing::{debug, info};

use crate::backend::{BufferId, ComputeBackend, DeviceInfo, KernelId, MemoryKind};

/// Backend shared between the manager and every handle it hands out.
pub type SharedBackend = Arc<Mutex<Box<dyn ComputeBackend>>>;

/// Owns the compute backend and the selected devices.
///
/// Cloning is cheap and yields another handle to the same devices. Other
/// components refer to devices by index only.
#[derive(Clone)]
pub struct DeviceManager {
    backend: SharedBackend,
    devices: Arc<[DeviceInfo]>,
    config: Arc<OclConfig>,
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceManager")
            .field("devices", &self.devices.len())
            .field("contexts", &self.context_count())
            .finish_non_exhaustive()
    }
}

impl DeviceManager {
    /// Take ownership of `backend` after validating `config`.
    pub fn new(backend: impl ComputeBackend + 'static, config: OclConfig) -> Result<Self> {
        config.validate()?;
        let devices: Arc<[DeviceInfo]> = backend.devices().into();
        if devices.is_empty() {
            return Err(OclError::NoDevice { reason: format!("backend '{}' exposes no devices", backend.name()) });
        }
        for d in devices.iter() {
            if config.ocl_manager_verbose {
                info!("device {}: {} ({}, platform '{}', context {})", d.index, d.name, d.vendor, d.platform, d.context);
            } else {
                debug!("device {}: {} ({}, platform '{}', context {})", d.index, d.name, d.vendor, d.platform, d.context);
            }
        }
        let backend: Box<dyn ComputeBackend> = Box::new(backend);
        Ok(Self { backend: Arc::new(Mutex::new(backend)), devices, config: Arc::new(config) })
    }

    /// Open real OpenCL devices as selected by `config`.
    #[cfg(feature = "opencl")]
    pub fn opencl(config: OclConfig) -> Result<Self> {
        let backend = crate::opencl::OpenClBackend::from_config(&config)?;
        Self::new(backend, config)
    }

    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    #[must_use]
    pub fn config(&self) -> &OclConfig {
        &self.config
    }

    /// Number of distinct contexts among the selected devices.
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.devices.iter().map(|d| d.context).max().map_or(0, |m| m + 1)
    }

    /// Exclusive access to the backend.
    pub fn lock(&self) -> Result<MutexGuard<'_, Box<dyn ComputeBackend>>> {
        self.backend.lock().map_err(|_| OclError::LockPoisoned)
    }

    /// Compile `source` once and create one `kernel_name` kernel per device.
    pub fn build_kernel(&self, source: &str, kernel_name: &str) -> Result<KernelSet> {
        let options = self.config.build_options();
        let mut backend = self.lock()?;
        debug!("building '{kernel_name}' with options '{options}' on {} device(s)", self.devices.len());
        let program = backend.build_program(source, &options, kernel_name)?;

        if self.config.show_build_log {
            for d in 0..self.devices.len() {
                let log = backend.build_log(program, d)?;
                info!("build log of '{kernel_name}' on device {d}:\n{log}");
            }
        }

        let mut kernels = Vec::with_capacity(self.devices.len());
        for d in 0..self.devices.len() {
            match backend.create_kernel(program, d, kernel_name) {
                Ok(k) => kernels.push(k),
                Err(e) => {
                    for k in kernels {
                        backend.release_kernel(k);
                    }
                    backend.release_program(program);
                    return Err(e);
                }
            }
        }
        // Kernels keep the program alive.
        backend.release_program(program);
        drop(backend);

        Ok(KernelSet { backend: Arc::clone(&self.backend), name: kernel_name.to_string(), kernels })
    }

    /// Allocate a buffer in the context of `device`.
    pub fn allocate(
        &self,
        device: usize,
        kind: MemoryKind,
        size_bytes: usize,
        init: Option<&[u8]>,
    ) -> Result<DeviceBuffer> {
        let id = self.lock()?.create_buffer(device, kind, size_bytes, init)?;
        Ok(DeviceBuffer { backend: Arc::clone(&self.backend), id, device, size_bytes, kind })
    }
}

// ── KernelSet ───────────────────────────────────────────────────────

/// One compiled kernel per device; released on drop.
pub struct KernelSet {
    backend: SharedBackend,
    name: String,
    kernels: Vec<KernelId>,
}

impl fmt::Debug for KernelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelSet").field("name", &self.name).field("kernels", &self.kernels).finish()
    }
}

impl KernelSet {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel of `device`.
    pub fn kernel(&self, device: usize) -> Result<KernelId> {
        self.kernels.get(device).copied().ok_or_else(|| {
            OclError::InvalidArgument(format!("kernel '{}' has no instance for device {device}", self.name))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl Drop for KernelSet {
    fn drop(&mut self) {
        if let Ok(mut backend) = self.backend.lock() {
            for k in self.kernels.drain(..) {
                backend.release_kernel(k);
            }
        }
    }
}

// ── DeviceBuffer ────────────────────────────────────────────────────

/// An owned device allocation; released on drop.
pub struct DeviceBuffer {
    backend: SharedBackend,
    id: BufferId,
    device: usize,
    size_bytes: usize,
    kind: MemoryKind,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("size_bytes", &self.size_bytes)
            .field("kind", &self.kind)
            .finish()
    }
}

impl DeviceBuffer {
    #[must_use]
    pub const fn id(&self) -> BufferId {
        self.id
    }

    /// Device whose context owns the allocation.
    #[must_use]
    pub const fn device(&self) -> usize {
        self.device
    }

    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    #[must_use]
    pub const fn kind(&self) -> MemoryKind {
        self.kind
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Ok(mut backend) = self.backend.lock() {
            backend.release_buffer(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostBackend, HostDeviceSpec, HostKernel, HostLaunch};

    fn noop(_: &mut HostLaunch<'_>) -> Result<()> {
        Ok(())
    }

    const NOOP: HostKernel = HostKernel { entry: "noop", outputs: &[], run: noop };

    #[test]
    fn empty_backend_is_rejected() {
        let err = DeviceManager::new(HostBackend::new(Vec::new()), OclConfig::default()).unwrap_err();
        assert!(matches!(err, OclError::NoDevice { .. }));
    }

    #[test]
    fn invalid_config_is_rejected_before_device_work() {
        let cfg = OclConfig::default().with_local_size(0);
        let err = DeviceManager::new(HostBackend::uniform(1), cfg).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn kernel_set_has_one_kernel_per_device_and_releases() {
        let host = HostBackend::uniform(3).with_kernels([NOOP]);
        let trace = host.trace();
        let manager = DeviceManager::new(host, OclConfig::default()).unwrap();
        let set = manager.build_kernel("__kernel void noop(uint n) { }", "noop").unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(trace.live_kernels(), 3);
        assert!(set.kernel(3).is_err());
        drop(set);
        assert_eq!(trace.live_kernels(), 0);
    }

    #[test]
    fn compile_failure_surfaces_log() {
        let manager = DeviceManager::new(HostBackend::uniform(2), OclConfig::default()).unwrap();
        let err = manager.build_kernel("__kernel void missing(uint n) { }", "missing").unwrap_err();
        match err {
            OclError::Compile { kernel, log, .. } => {
                assert_eq!(kernel, "missing");
                assert!(log.contains("missing"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn show_build_log_does_not_change_result() {
        let cfg = OclConfig { show_build_log: true, ..Default::default() };
        let manager = DeviceManager::new(HostBackend::uniform(1).with_kernels([NOOP]), cfg).unwrap();
        assert!(manager.build_kernel("__kernel void noop(uint n) { }", "noop").is_ok());
    }

    #[test]
    fn device_buffer_released_on_drop() {
        let host = HostBackend::uniform(1);
        let trace = host.trace();
        let manager = DeviceManager::new(host, OclConfig::default()).unwrap();
        let buf = manager.allocate(0, MemoryKind::Pinned, 64, None).unwrap();
        assert_eq!(buf.size_bytes(), 64);
        assert_eq!(trace.live_buffers(), 1);
        drop(buf);
        assert_eq!(trace.live_buffers(), 0);
    }

    #[test]
    fn context_count_reflects_platforms() {
        let specs = vec![
            HostDeviceSpec::new("a").with_platform("p0"),
            HostDeviceSpec::new("b").with_platform("p1"),
            HostDeviceSpec::new("c").with_platform("p1"),
        ];
        let cfg = OclConfig { platform: sgocl_common::PlatformSelector::All, ..Default::default() };
        let host = HostBackend::from_config(specs, &cfg).unwrap();
        let manager = DeviceManager::new(host, cfg).unwrap();
        assert_eq!(manager.num_devices(), 3);
        assert_eq!(manager.context_count(), 2);
    }
}
