//! Floating-point precision selection for kernels and buffers.

use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Internal precision of generated kernels (`INTERNAL_PRECISION`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Precision {
    Float,
    Double,
}

impl Precision {
    /// OpenCL C scalar type name.
    #[must_use]
    pub const fn cl_type(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Double => "double",
        }
    }

    /// Suffix appended to floating-point literals in generated source.
    #[must_use]
    pub const fn literal_suffix(self) -> &'static str {
        match self {
            Self::Float => "f",
            Self::Double => "",
        }
    }

    /// Integer type of the same width, used by compare-and-swap loops.
    #[must_use]
    pub const fn cas_int_type(self) -> &'static str {
        match self {
            Self::Float => "uint",
            Self::Double => "ulong",
        }
    }

    /// Element size in bytes.
    #[must_use]
    pub const fn size_of(self) -> usize {
        match self {
            Self::Float => 4,
            Self::Double => 8,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cl_type())
    }
}

impl FromStr for Precision {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float" => Ok(Self::Float),
            "double" => Ok(Self::Double),
            _ => Err(ConfigError::UnsupportedPrecision(s.to_string())),
        }
    }
}

impl TryFrom<String> for Precision {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Precision> for String {
    fn from(p: Precision) -> Self {
        p.cl_type().to_string()
    }
}

/// Scalar element type a dispatch engine computes in.
///
/// Implemented for `f32` and `f64`; the associated [`Precision`] selects
/// the matching kernel source.
pub trait Real:
    bytemuck::Pod
    + Default
    + PartialOrd
    + fmt::Debug
    + fmt::Display
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + AddAssign
{
    const PRECISION: Precision;
    const ZERO: Self;
    const ONE: Self;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    fn abs(self) -> Self;
    fn floor(self) -> Self;
    fn max(self, other: Self) -> Self;
    fn exp2(self) -> Self;
}

macro_rules! impl_real {
    ($t:ty, $p:expr) => {
        impl Real for $t {
            const PRECISION: Precision = $p;
            const ZERO: Self = 0.0;
            const ONE: Self = 1.0;

            #[inline]
            #[allow(clippy::cast_possible_truncation)]
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            #[inline]
            fn to_f64(self) -> f64 {
                f64::from(self)
            }
            #[inline]
            fn abs(self) -> Self {
                <$t>::abs(self)
            }
            #[inline]
            fn floor(self) -> Self {
                <$t>::floor(self)
            }
            #[inline]
            fn max(self, other: Self) -> Self {
                <$t>::max(self, other)
            }
            #[inline]
            fn exp2(self) -> Self {
                <$t>::exp2(self)
            }
        }
    };
}

impl_real!(f32, Precision::Float);
impl_real!(f64, Precision::Double);
