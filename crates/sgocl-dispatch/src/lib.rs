//! Load-balanced multi-device dispatch of sparse-grid evaluation kernels.
//!
//! [`DispatchEngine`] drives the `mult` and `multTranspose` operators over
//! every device of a [`DeviceManager`](sgocl_runtime::DeviceManager):
//! kernel text comes from [`KernelSourceBuilder`], work is split by
//! [`LinearLoadBalancer`], and device memory is managed through the
//! replica strategies of `sgocl-runtime`.
//!
//! [`reference::kernels`] registers host implementations of both entry
//! points with a [`HostBackend`](sgocl_runtime::HostBackend), so the whole
//! pipeline runs without OpenCL hardware.

pub mod engine;
pub mod layout;
pub mod load_balancer;
pub mod reference;
pub mod source;

pub use engine::{DispatchEngine, DispatchState};
pub use layout::{Dataset, GridLayout, GridPoint, SubspaceDescriptor, SubspaceKind};
pub use load_balancer::LinearLoadBalancer;
pub use source::{KernelSource, KernelSourceBuilder, Operation};
