//! Shared foundations for the sgocl multi-device dispatch stack.
//!
//! This crate carries the pieces every layer needs: the configuration
//! dictionary ([`OclConfig`]), the error taxonomy ([`OclError`]), the
//! floating-point abstraction used by kernels and buffers ([`Real`]) and
//! the tracing bootstrap.

pub mod config;
pub mod error;
pub mod logging;
pub mod precision;

pub use config::{DeviceTypeFilter, OclConfig, PlatformSelector};
pub use error::{ClStatus, ConfigError, OclError, Result};
pub use precision::{Precision, Real};
