//! Data types for tensor elements

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Supported data types for tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
}

impl DType {
    /// Size of the dtype in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    /// Engine-facing dtype label written into converted configs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
        }
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float32" | "fp32" | "f32" => Ok(Self::F32),
            "float16" | "fp16" | "f16" | "half" => Ok(Self::F16),
            "bfloat16" | "bf16" => Ok(Self::BF16),
            other => Err(Error::UnsupportedDtype(format!(
                "unknown dtype label '{other}'"
            ))),
        }
    }
}

impl From<DType> for safetensors::Dtype {
    fn from(dtype: DType) -> Self {
        match dtype {
            DType::F32 => Self::F32,
            DType::F16 => Self::F16,
            DType::BF16 => Self::BF16,
        }
    }
}

impl TryFrom<safetensors::Dtype> for DType {
    type Error = Error;

    fn try_from(dtype: safetensors::Dtype) -> Result<Self, Self::Error> {
        match dtype {
            safetensors::Dtype::F32 => Ok(Self::F32),
            safetensors::Dtype::F16 => Ok(Self::F16),
            safetensors::Dtype::BF16 => Ok(Self::BF16),
            other => Err(Error::UnsupportedDtype(format!("{other:?}"))),
        }
    }
}

/// Trait for types that can be used as tensor elements
pub trait TensorDType: bytemuck::Pod + Copy + Default + Send + Sync + 'static {
    /// The corresponding `DType` enum value
    const DTYPE: DType;

    /// Widen to f32.
    fn to_f32(self) -> f32;

    /// Narrow from f32 (round-to-nearest for half types).
    fn from_f32(v: f32) -> Self;
}

impl TensorDType for f32 {
    const DTYPE: DType = DType::F32;

    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(v: f32) -> Self {
        v
    }
}

impl TensorDType for half::f16 {
    const DTYPE: DType = DType::F16;

    fn to_f32(self) -> f32 {
        half::f16::to_f32(self)
    }

    fn from_f32(v: f32) -> Self {
        half::f16::from_f32(v)
    }
}

impl TensorDType for half::bf16 {
    const DTYPE: DType = DType::BF16;

    fn to_f32(self) -> f32 {
        half::bf16::to_f32(self)
    }

    fn from_f32(v: f32) -> Self {
        half::bf16::from_f32(v)
    }
}
