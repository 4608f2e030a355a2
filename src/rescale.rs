// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Dtype-preserving rescale.
//!
//! When a float-producing computation runs on data that arrived as integers,
//! writing the float result straight back with a cast truncates and can wrap.
//! The rescaler maps the float values linearly into the integer type's
//! representable range, rounds, and clamps before casting.
//!
//! ## Scaling law
//!
//! For an integer target with range `[lo, hi]`:
//!
//! - [`RescalePolicy::Stretch`] (default): `v' = (v - min) / (max - min) * (hi - lo) + lo`
//!   where `min`/`max` are taken over the finite input values. Negative
//!   inputs for unsigned targets land at or above `lo = 0` by construction.
//!   When every finite value is equal (or none are finite) the law
//!   degenerates to `Saturate`.
//! - [`RescalePolicy::Saturate`]: `v' = clamp(round(v), lo, hi)`, for callers
//!   whose float results are already in integer units.
//!
//! In both cases `+inf` maps to `hi`, `-inf` to `lo`, and `NaN` to zero.
//! The law is backend independent; backends only supply the primitive that
//! applies it (see [`Backend::rescale`](crate::Backend::rescale)).

use crate::buffer::{HostArray, HostData};
use crate::dtype::DType;
use crate::error::{BridgeError, Result};
use std::str::FromStr;

/// How float values are brought into an integer range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RescalePolicy {
    /// Linear min/max mapping onto the full integer range.
    #[default]
    Stretch,
    /// Round and clamp, keeping values in place.
    Saturate,
}

impl FromStr for RescalePolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stretch" => Ok(Self::Stretch),
            "saturate" | "clamp" => Ok(Self::Saturate),
            other => Err(BridgeError::invalid_config(format!(
                "unknown rescale policy: {other}"
            ))),
        }
    }
}

/// Whether writing `result` back as `original` requires rescaling.
///
/// Only float results destined for integer dtypes are rescaled; any other
/// combination is returned unchanged.
#[must_use]
pub fn needs_rescale(result: DType, original: DType) -> bool {
    result.is_floating_point() && original.is_integer()
}

/// Finite minimum and maximum, if any value is finite.
#[must_use]
pub fn finite_range(values: &[f64]) -> Option<(f64, f64)> {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Affine coefficients `(mul, add)` for the stretch law, or `None` when the
/// input range is degenerate and saturation applies instead.
#[must_use]
pub fn stretch_coefficients(range: Option<(f64, f64)>, target: DType) -> Option<(f64, f64)> {
    let (lo, hi) = target.integer_range()?;
    let (min, max) = range?;
    if max <= min {
        return None;
    }
    let mul = (hi - lo) / (max - min);
    Some((mul, lo - min * mul))
}

/// Apply the scaling law to `values` for an integer `target`.
///
/// Float targets are returned unchanged.
#[must_use]
pub fn scale_values(values: &[f64], target: DType, policy: RescalePolicy) -> Vec<f64> {
    let Some((lo, hi)) = target.integer_range() else {
        return values.to_vec();
    };
    let affine = match policy {
        RescalePolicy::Stretch => stretch_coefficients(finite_range(values), target),
        RescalePolicy::Saturate => None,
    };
    values
        .iter()
        .map(|&v| {
            if v.is_nan() {
                return 0.0;
            }
            let mapped = match affine {
                Some((mul, add)) if v.is_finite() => v.mul_add(mul, add),
                _ => v,
            };
            mapped.round().clamp(lo, hi)
        })
        .collect()
}

/// Rescale a host array to `original` if the dtype-preservation rule applies.
#[must_use]
pub fn preserve_host_dtype(array: &HostArray, original: DType, policy: RescalePolicy) -> HostArray {
    if !needs_rescale(array.dtype(), original) {
        return array.clone();
    }
    let scaled = scale_values(&array.to_f64(), original, policy);
    array.with_data(HostData::from_f64(original, &scaled))
}
