//! Dispatch configuration with JSON, TOML, environment variable and
//! default config sources.
//!
//! Keys keep their historical SCREAMING_SNAKE_CASE names so existing
//! parameter files load unchanged. Environment overrides use the same
//! names prefixed with `SGOCL_`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt, fs};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::precision::Precision;

/// Prefix for environment overrides, e.g. `SGOCL_LOCAL_SIZE`.
pub const ENV_PREFIX: &str = "SGOCL_";

/// Every recognised configuration key.
pub const KEYS: &[&str] = &[
    "LOCAL_SIZE",
    "ENABLE_OPTIMIZATIONS",
    "OPTIMIZATION_FLAGS",
    "INTERNAL_PRECISION",
    "PLATFORM",
    "DEVICE_TYPE",
    "REUSE_SOURCE",
    "WRITE_SOURCE",
    "KERNEL_SOURCE_DIR",
    "VERBOSE",
    "OCL_MANAGER_VERBOSE",
    "LOAD_BALANCING_VERBOSE",
    "SHOW_BUILD_LOG",
    "KERNEL_MAX_DIM_UNROLL",
    "MAX_DEVICES",
    "SELECT_SPECIFIC_DEVICE",
];

// ── DeviceTypeFilter ────────────────────────────────────────────────

/// Device class to enumerate (`DEVICE_TYPE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceTypeFilter {
    Cpu,
    Gpu,
    Accelerator,
    #[default]
    All,
}

impl DeviceTypeFilter {
    /// Whether a device of class `kind` passes this filter.
    #[must_use]
    pub const fn admits(self, kind: Self) -> bool {
        matches!(self, Self::All) || self as u8 == kind as u8
    }
}

impl fmt::Display for DeviceTypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cpu => "CL_DEVICE_TYPE_CPU",
            Self::Gpu => "CL_DEVICE_TYPE_GPU",
            Self::Accelerator => "CL_DEVICE_TYPE_ACCELERATOR",
            Self::All => "CL_DEVICE_TYPE_ALL",
        };
        f.write_str(s)
    }
}

impl FromStr for DeviceTypeFilter {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.strip_prefix("CL_DEVICE_TYPE_").unwrap_or(&upper) {
            "CPU" => Ok(Self::Cpu),
            "GPU" => Ok(Self::Gpu),
            "ACCELERATOR" => Ok(Self::Accelerator),
            "ALL" => Ok(Self::All),
            _ => Err(ConfigError::UnsupportedDeviceType(s.to_string())),
        }
    }
}

impl TryFrom<String> for DeviceTypeFilter {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceTypeFilter> for String {
    fn from(d: DeviceTypeFilter) -> Self {
        d.to_string()
    }
}

// ── PlatformSelector ────────────────────────────────────────────────

/// Which platform(s) to draw devices from (`PLATFORM`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PlatformSelector {
    /// The first platform that exposes a matching device.
    #[default]
    First,
    /// Every platform, one context each.
    All,
    /// The platform whose name matches exactly.
    Named(String),
}

impl PlatformSelector {
    /// `true` when devices may come from more than one context.
    #[must_use]
    pub const fn is_multi_platform(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl fmt::Display for PlatformSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => f.write_str("first"),
            Self::All => f.write_str("all"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl From<String> for PlatformSelector {
    fn from(value: String) -> Self {
        match value.as_str() {
            "first" => Self::First,
            "all" => Self::All,
            _ => Self::Named(value),
        }
    }
}

impl From<PlatformSelector> for String {
    fn from(p: PlatformSelector) -> Self {
        p.to_string()
    }
}

// ── OclConfig ───────────────────────────────────────────────────────

/// Tunable parameters of device management, code generation and dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct OclConfig {
    /// Work-group size; also the alignment unit for partitions.
    pub local_size: usize,
    pub enable_optimizations: bool,
    /// Compiler flags used when optimisations are enabled.
    pub optimization_flags: String,
    pub internal_precision: Precision,
    pub platform: PlatformSelector,
    pub device_type: DeviceTypeFilter,
    /// Read cached kernel source instead of generating it.
    pub reuse_source: bool,
    /// Persist generated kernel source for a later `REUSE_SOURCE` run.
    pub write_source: bool,
    pub kernel_source_dir: PathBuf,
    pub verbose: bool,
    pub ocl_manager_verbose: bool,
    pub load_balancing_verbose: bool,
    pub show_build_log: bool,
    /// Dimensions above this use arrays and loops instead of named scalars.
    pub kernel_max_dim_unroll: usize,
    pub max_devices: Option<usize>,
    pub select_specific_device: Option<usize>,
}

impl Default for OclConfig {
    fn default() -> Self {
        Self {
            local_size: 64,
            enable_optimizations: true,
            optimization_flags: String::new(),
            internal_precision: Precision::Double,
            platform: PlatformSelector::First,
            device_type: DeviceTypeFilter::All,
            reuse_source: false,
            write_source: false,
            kernel_source_dir: PathBuf::from("."),
            verbose: false,
            ocl_manager_verbose: false,
            load_balancing_verbose: false,
            show_build_log: false,
            kernel_max_dim_unroll: 10,
            max_devices: None,
            select_specific_device: None,
        }
    }
}

impl OclConfig {
    // ── Constructors ────────────────────────────────────────────

    /// Parse a JSON parameter dictionary; missing keys take defaults.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parse a TOML parameter table; missing keys take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a `.toml` or `.json` file (JSON for any other extension).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let is_toml = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        debug!("loading dispatch config from {}", path.display());
        if is_toml { Self::from_toml_str(&text) } else { Self::from_json_str(&text) }
    }

    /// Defaults overlaid with `SGOCL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// File (or defaults when `path` is `None`), then environment
    /// overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overwrite every key that has a `SGOCL_<KEY>` environment variable.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for key in KEYS {
            if let Ok(value) = env::var(format!("{ENV_PREFIX}{key}")) {
                debug!("environment override {key}={value}");
                self.set(key, &value)?;
            }
        }
        Ok(())
    }

    // ── Builder-style setters ───────────────────────────────────

    #[must_use]
    pub fn with_local_size(mut self, local_size: usize) -> Self {
        self.local_size = local_size;
        self
    }

    #[must_use]
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.internal_precision = precision;
        self
    }

    #[must_use]
    pub fn with_max_dim_unroll(mut self, threshold: usize) -> Self {
        self.kernel_max_dim_unroll = threshold;
        self
    }

    #[must_use]
    pub fn with_kernel_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kernel_source_dir = dir.into();
        self
    }

    // ── Validation ──────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_size == 0 {
            return Err(ConfigError::Validation("LOCAL_SIZE must be > 0".into()));
        }
        if self.max_devices == Some(0) {
            return Err(ConfigError::Validation("MAX_DEVICES must be > 0 when set".into()));
        }
        if self.max_devices.is_some() && self.select_specific_device.is_some() {
            return Err(ConfigError::Validation(
                "MAX_DEVICES and SELECT_SPECIFIC_DEVICE are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    /// Options passed to the device compiler.
    #[must_use]
    pub fn build_options(&self) -> String {
        if self.enable_optimizations {
            self.optimization_flags.clone()
        } else {
            "-cl-opt-disable".to_string()
        }
    }

    // ── Dictionary access ───────────────────────────────────────

    /// Set `key` from its textual form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "LOCAL_SIZE" => self.local_size = parse_usize(key, value)?,
            "ENABLE_OPTIMIZATIONS" => self.enable_optimizations = parse_bool(key, value)?,
            "OPTIMIZATION_FLAGS" => self.optimization_flags = value.to_string(),
            "INTERNAL_PRECISION" => self.internal_precision = value.parse()?,
            "PLATFORM" => self.platform = PlatformSelector::from(value.to_string()),
            "DEVICE_TYPE" => self.device_type = value.parse()?,
            "REUSE_SOURCE" => self.reuse_source = parse_bool(key, value)?,
            "WRITE_SOURCE" => self.write_source = parse_bool(key, value)?,
            "KERNEL_SOURCE_DIR" => self.kernel_source_dir = PathBuf::from(value),
            "VERBOSE" => self.verbose = parse_bool(key, value)?,
            "OCL_MANAGER_VERBOSE" => self.ocl_manager_verbose = parse_bool(key, value)?,
            "LOAD_BALANCING_VERBOSE" => self.load_balancing_verbose = parse_bool(key, value)?,
            "SHOW_BUILD_LOG" => self.show_build_log = parse_bool(key, value)?,
            "KERNEL_MAX_DIM_UNROLL" => self.kernel_max_dim_unroll = parse_usize(key, value)?,
            "MAX_DEVICES" => self.max_devices = parse_optional_usize(key, value)?,
            "SELECT_SPECIFIC_DEVICE" => {
                self.select_specific_device = parse_optional_usize(key, value)?;
            }
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Textual value of `key`; `None` for unset optional keys.
    pub fn get_as_str(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let value = match key {
            "LOCAL_SIZE" => self.local_size.to_string(),
            "ENABLE_OPTIMIZATIONS" => self.enable_optimizations.to_string(),
            "OPTIMIZATION_FLAGS" => self.optimization_flags.clone(),
            "INTERNAL_PRECISION" => self.internal_precision.to_string(),
            "PLATFORM" => self.platform.to_string(),
            "DEVICE_TYPE" => self.device_type.to_string(),
            "REUSE_SOURCE" => self.reuse_source.to_string(),
            "WRITE_SOURCE" => self.write_source.to_string(),
            "KERNEL_SOURCE_DIR" => self.kernel_source_dir.display().to_string(),
            "VERBOSE" => self.verbose.to_string(),
            "OCL_MANAGER_VERBOSE" => self.ocl_manager_verbose.to_string(),
            "LOAD_BALANCING_VERBOSE" => self.load_balancing_verbose.to_string(),
            "SHOW_BUILD_LOG" => self.show_build_log.to_string(),
            "KERNEL_MAX_DIM_UNROLL" => self.kernel_max_dim_unroll.to_string(),
            "MAX_DEVICES" => return Ok(self.max_devices.map(|v| v.to_string())),
            "SELECT_SPECIFIC_DEVICE" => {
                return Ok(self.select_specific_device.map(|v| v.to_string()));
            }
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        };
        Ok(Some(value))
    }

    /// Numeric value of `key`.
    pub fn get_as_unsigned(&self, key: &str) -> Result<u64, ConfigError> {
        let value = self.require(key)?;
        value.parse::<u64>().map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value })
    }

    /// Boolean value of `key`.
    pub fn get_as_bool(&self, key: &str) -> Result<bool, ConfigError> {
        let value = self.require(key)?;
        parse_bool(key, &value)
    }

    fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.get_as_str(key)?
            .ok_or_else(|| ConfigError::InvalidValue { key: key.to_string(), value: "<unset>".into() })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn parse_usize(key: &str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value: val.to_string() })
}

fn parse_optional_usize(key: &str, val: &str) -> Result<Option<usize>, ConfigError> {
    match val.trim().to_ascii_lowercase().as_str() {
        "" | "none" => Ok(None),
        _ => parse_usize(key, val).map(Some),
    }
}

fn parse_bool(key: &str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { key: key.to_string(), value: val.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let cfg = OclConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.local_size, 64);
        assert_eq!(cfg.internal_precision, Precision::Double);
        assert_eq!(cfg.kernel_max_dim_unroll, 10);
    }

    #[test]
    fn device_type_accepts_short_and_long_names() {
        assert_eq!("CL_DEVICE_TYPE_GPU".parse::<DeviceTypeFilter>().unwrap(), DeviceTypeFilter::Gpu);
        assert_eq!("cpu".parse::<DeviceTypeFilter>().unwrap(), DeviceTypeFilter::Cpu);
        let err = "CL_DEVICE_TYPE_FPGA".parse::<DeviceTypeFilter>().unwrap_err();
        assert!(err.to_string().contains("unsupported device type"));
    }

    #[test]
    fn all_filter_admits_everything() {
        assert!(DeviceTypeFilter::All.admits(DeviceTypeFilter::Gpu));
        assert!(DeviceTypeFilter::Gpu.admits(DeviceTypeFilter::Gpu));
        assert!(!DeviceTypeFilter::Gpu.admits(DeviceTypeFilter::Cpu));
    }

    #[test]
    fn platform_selector_from_string() {
        assert_eq!(PlatformSelector::from("first".to_string()), PlatformSelector::First);
        assert!(PlatformSelector::from("all".to_string()).is_multi_platform());
        assert_eq!(
            PlatformSelector::from("NVIDIA CUDA".to_string()),
            PlatformSelector::Named("NVIDIA CUDA".into())
        );
    }

    #[test]
    fn build_options_follow_optimization_switch() {
        let mut cfg = OclConfig { optimization_flags: "-cl-fast-relaxed-math".into(), ..Default::default() };
        assert_eq!(cfg.build_options(), "-cl-fast-relaxed-math");
        cfg.enable_optimizations = false;
        assert_eq!(cfg.build_options(), "-cl-opt-disable");
    }

    #[test]
    fn max_devices_and_specific_device_conflict() {
        let cfg = OclConfig { max_devices: Some(2), select_specific_device: Some(0), ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_local_size_rejected() {
        let cfg = OclConfig::default().with_local_size(0);
        assert!(cfg.validate().unwrap_err().to_string().contains("LOCAL_SIZE"));
    }

    #[test]
    fn dictionary_set_and_get() {
        let mut cfg = OclConfig::default();
        cfg.set("LOCAL_SIZE", "128").unwrap();
        cfg.set("LOAD_BALANCING_VERBOSE", "true").unwrap();
        cfg.set("MAX_DEVICES", "none").unwrap();
        assert_eq!(cfg.get_as_unsigned("LOCAL_SIZE").unwrap(), 128);
        assert!(cfg.get_as_bool("LOAD_BALANCING_VERBOSE").unwrap());
        assert_eq!(cfg.get_as_str("MAX_DEVICES").unwrap(), None);
        assert!(cfg.get_as_unsigned("MAX_DEVICES").is_err());
        assert!(matches!(cfg.set("NO_SUCH_KEY", "1"), Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn every_key_is_readable() {
        let cfg = OclConfig::default();
        for key in KEYS {
            assert!(cfg.get_as_str(key).is_ok(), "{key} not readable");
        }
    }
}
