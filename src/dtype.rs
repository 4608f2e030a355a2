// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Element types and their kinds.
//!
//! ## Why This Module Exists
//!
//! Backends disagree on which element types they can hold: image pipelines
//! routinely produce `u16` data that some tensor runtimes cannot represent at
//! all. The bridge therefore carries its own closed [`DType`] set and maps it
//! onto each backend at the edges.
//!
//! ## Design Decisions
//!
//! - **Kinds over types**: the rescaler only cares whether a dtype is
//!   unsigned, signed or floating point, so [`DtypeKind`] is the unit of
//!   comparison for dtype preservation.
//!
//! - **No implicit conversions**: every dtype change goes through an explicit
//!   cast or the rescaler.

use crate::error::{BridgeError, Result};
use std::fmt;
use std::str::FromStr;

/// Element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// IEEE half precision.
    F16,
    /// Brain floating point.
    BF16,
    /// IEEE single precision.
    F32,
    /// IEEE double precision.
    F64,
}

/// Coarse classification used for dtype preservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtypeKind {
    /// Unsigned integers.
    Unsigned,
    /// Signed integers.
    Signed,
    /// Floating point.
    Float,
}

impl DtypeKind {
    /// Whether this kind is an integer kind.
    #[must_use]
    pub fn is_integer(self) -> bool {
        !matches!(self, Self::Float)
    }
}

impl DType {
    /// All supported dtypes.
    pub const ALL: [DType; 10] = [
        Self::U8,
        Self::U16,
        Self::U32,
        Self::I16,
        Self::I32,
        Self::I64,
        Self::F16,
        Self::BF16,
        Self::F32,
        Self::F64,
    ];

    /// Number of bytes per element.
    #[must_use]
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 | Self::I16 | Self::F16 | Self::BF16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    /// Kind of this dtype.
    #[must_use]
    pub fn kind(self) -> DtypeKind {
        match self {
            Self::U8 | Self::U16 | Self::U32 => DtypeKind::Unsigned,
            Self::I16 | Self::I32 | Self::I64 => DtypeKind::Signed,
            Self::F16 | Self::BF16 | Self::F32 | Self::F64 => DtypeKind::Float,
        }
    }

    /// Check if this dtype is floating point.
    #[must_use]
    pub fn is_floating_point(self) -> bool {
        self.kind() == DtypeKind::Float
    }

    /// Check if this dtype is an integer type.
    #[must_use]
    pub fn is_integer(self) -> bool {
        self.kind().is_integer()
    }

    /// Check if this dtype is a half-precision float (f16 or bf16).
    #[must_use]
    pub fn is_half_precision(self) -> bool {
        matches!(self, Self::F16 | Self::BF16)
    }

    /// Representable range of an integer dtype, as `f64`.
    ///
    /// Returns `None` for floating-point dtypes. The bounds of `i64` are not
    /// exactly representable in `f64`; casts from `f64` saturate, so the
    /// rounded bounds are still safe clamp limits.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn integer_range(self) -> Option<(f64, f64)> {
        match self {
            Self::U8 => Some((0.0, f64::from(u8::MAX))),
            Self::U16 => Some((0.0, f64::from(u16::MAX))),
            Self::U32 => Some((0.0, f64::from(u32::MAX))),
            Self::I16 => Some((f64::from(i16::MIN), f64::from(i16::MAX))),
            Self::I32 => Some((f64::from(i32::MIN), f64::from(i32::MAX))),
            Self::I64 => Some((i64::MIN as f64, i64::MAX as f64)),
            Self::F16 | Self::BF16 | Self::F32 | Self::F64 => None,
        }
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        // Accept the common long spellings too (uint8, float32, ...).
        let normalized = match wanted.as_str() {
            "uint8" => "u8",
            "uint16" => "u16",
            "uint32" => "u32",
            "int16" => "i16",
            "int32" => "i32",
            "int64" => "i64",
            "float16" | "half" => "f16",
            "bfloat16" => "bf16",
            "float32" | "float" => "f32",
            "float64" | "double" => "f64",
            other => other,
        };
        Self::ALL
            .into_iter()
            .find(|d| d.name() == normalized)
            .ok_or_else(|| BridgeError::invalid_config(format!("unknown dtype: {s}")))
    }
}

/// Get the size in bytes for a single element of the given dtype.
///
/// ## Example
///
/// ```rust
/// use arraybridge::{bytes_per_element, DType};
///
/// assert_eq!(bytes_per_element(DType::U16), 2);
/// assert_eq!(bytes_per_element(DType::F64), 8);
/// ```
#[must_use]
pub fn bytes_per_element(dtype: DType) -> usize {
    dtype.size_in_bytes()
}
