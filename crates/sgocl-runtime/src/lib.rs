//! Device management and memory replication for multi-device dispatch.
//!
//! [`DeviceManager`] owns a [`ComputeBackend`] and the devices it selected;
//! [`ReplicaBuffer`] mirrors host arrays onto those devices using one of
//! three strategies; [`LaunchBatch`] fans work out to the device queues and
//! joins it at a single barrier.

pub mod backend;
pub mod host;
pub mod launch;
pub mod manager;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod replica;
pub mod segment;
pub mod selection;

pub use backend::{
    BufferId, ComputeBackend, DeviceInfo, EventId, KernelArg, KernelId, LaunchDims, MemoryKind,
    ProfileTimes, ProgramId,
};
pub use host::{HostArgs, HostBackend, HostCall, HostDeviceSpec, HostKernel, HostLaunch, HostTraceHandle};
pub use launch::{LaunchBatch, LaunchTiming};
pub use manager::{DeviceBuffer, DeviceManager, KernelSet};
#[cfg(feature = "opencl")]
pub use opencl::OpenClBackend;
pub use replica::{AccessPattern, Replica, ReplicaBuffer, ReplicaStrategy};
pub use segment::Segment;
