//! Error taxonomy for configuration, device and compilation failures.
//!
//! Configuration errors are caller-correctable and raised before any
//! device work is issued. Device and compile errors are fatal: they carry
//! the device index, the failing call and the OpenCL status code so a
//! driver problem can be diagnosed from the message alone.

use std::fmt;
use std::path::PathBuf;

use crate::precision::Precision;

/// Result alias used throughout the dispatch stack.
pub type Result<T> = std::result::Result<T, OclError>;

// ── Status codes ────────────────────────────────────────────────────

/// An OpenCL status code as returned by a runtime call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClStatus(pub i32);

impl ClStatus {
    pub const SUCCESS: Self = Self(0);
    pub const DEVICE_NOT_FOUND: Self = Self(-1);
    pub const MEM_OBJECT_ALLOCATION_FAILURE: Self = Self(-4);
    pub const OUT_OF_RESOURCES: Self = Self(-5);
    pub const OUT_OF_HOST_MEMORY: Self = Self(-6);
    pub const PROFILING_INFO_NOT_AVAILABLE: Self = Self(-7);
    pub const BUILD_PROGRAM_FAILURE: Self = Self(-11);
    pub const MAP_FAILURE: Self = Self(-12);
    pub const INVALID_VALUE: Self = Self(-30);
    pub const INVALID_DEVICE_TYPE: Self = Self(-31);
    pub const INVALID_DEVICE: Self = Self(-33);
    pub const INVALID_MEM_OBJECT: Self = Self(-38);
    pub const INVALID_PROGRAM: Self = Self(-44);
    pub const INVALID_KERNEL_NAME: Self = Self(-46);
    pub const INVALID_KERNEL: Self = Self(-48);
    pub const INVALID_ARG_INDEX: Self = Self(-49);
    pub const INVALID_ARG_VALUE: Self = Self(-50);
    pub const INVALID_KERNEL_ARGS: Self = Self(-52);
    pub const INVALID_WORK_GROUP_SIZE: Self = Self(-54);
    pub const INVALID_GLOBAL_OFFSET: Self = Self(-56);
    pub const INVALID_EVENT: Self = Self(-58);
    pub const INVALID_BUFFER_SIZE: Self = Self(-61);
    pub const INVALID_GLOBAL_WORK_SIZE: Self = Self(-63);

    /// Symbolic name of the status code, `"CL_UNKNOWN_ERROR"` if unmapped.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self.0 {
            0 => "CL_SUCCESS",
            -1 => "CL_DEVICE_NOT_FOUND",
            -2 => "CL_DEVICE_NOT_AVAILABLE",
            -3 => "CL_COMPILER_NOT_AVAILABLE",
            -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
            -5 => "CL_OUT_OF_RESOURCES",
            -6 => "CL_OUT_OF_HOST_MEMORY",
            -7 => "CL_PROFILING_INFO_NOT_AVAILABLE",
            -11 => "CL_BUILD_PROGRAM_FAILURE",
            -12 => "CL_MAP_FAILURE",
            -30 => "CL_INVALID_VALUE",
            -31 => "CL_INVALID_DEVICE_TYPE",
            -32 => "CL_INVALID_PLATFORM",
            -33 => "CL_INVALID_DEVICE",
            -34 => "CL_INVALID_CONTEXT",
            -36 => "CL_INVALID_COMMAND_QUEUE",
            -38 => "CL_INVALID_MEM_OBJECT",
            -44 => "CL_INVALID_PROGRAM",
            -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
            -46 => "CL_INVALID_KERNEL_NAME",
            -48 => "CL_INVALID_KERNEL",
            -49 => "CL_INVALID_ARG_INDEX",
            -50 => "CL_INVALID_ARG_VALUE",
            -51 => "CL_INVALID_ARG_SIZE",
            -52 => "CL_INVALID_KERNEL_ARGS",
            -54 => "CL_INVALID_WORK_GROUP_SIZE",
            -55 => "CL_INVALID_WORK_ITEM_SIZE",
            -56 => "CL_INVALID_GLOBAL_OFFSET",
            -58 => "CL_INVALID_EVENT",
            -61 => "CL_INVALID_BUFFER_SIZE",
            -63 => "CL_INVALID_GLOBAL_WORK_SIZE",
            _ => "CL_UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ClStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

// ── Configuration errors ────────────────────────────────────────────

/// Errors produced while loading or validating an [`OclConfig`].
///
/// [`OclConfig`]: crate::config::OclConfig
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported device type '{0}' (expected CL_DEVICE_TYPE_CPU, GPU, ACCELERATOR or ALL)")]
    UnsupportedDeviceType(String),

    #[error("unsupported precision '{0}' (expected \"float\" or \"double\")")]
    UnsupportedPrecision(String),

    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

// ── Dispatch errors ─────────────────────────────────────────────────

/// Every failure the dispatch stack can surface.
#[derive(Debug, thiserror::Error)]
pub enum OclError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no OpenCL platforms found")]
    NoPlatforms,

    #[error("no compute devices found: {reason}")]
    NoDevice { reason: String },

    #[error("device {device}: {call} failed with {code}")]
    Device { device: usize, call: &'static str, code: ClStatus },

    #[error("kernel '{kernel}' failed to build on device {device} with {code}:\n{log}")]
    Compile { device: usize, kernel: String, code: ClStatus, log: String },

    #[error(
        "device {device} was assigned work after an idle device; \
         only trailing partitions may be empty"
    )]
    NonContiguousPartition { device: usize },

    #[error("kernel source cache file not found: {}", path.display())]
    SourceCacheMissing { path: PathBuf },

    #[error("engine built for {requested} precision but INTERNAL_PRECISION is {configured}")]
    PrecisionMismatch { configured: Precision, requested: Precision },

    #[error("compute backend lock poisoned")]
    LockPoisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OclError {
    /// Shorthand for a failed runtime call on `device`.
    #[must_use]
    pub const fn device(device: usize, call: &'static str, code: i32) -> Self {
        Self::Device { device, call, code: ClStatus(code) }
    }

    /// `true` for device, driver and compiler failures.
    ///
    /// Configuration and argument errors can be fixed by the caller;
    /// everything else leaves buffers in an undefined state.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::InvalidArgument(_) | Self::PrecisionMismatch { .. })
    }

    /// Index of the device that reported the failure, if any.
    #[must_use]
    pub const fn device_index(&self) -> Option<usize> {
        match self {
            Self::Device { device, .. }
            | Self::Compile { device, .. }
            | Self::NonContiguousPartition { device } => Some(*device),
            _ => None,
        }
    }
}
