// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Batch helpers: stack N buffers into one, split one into N.
//!
//! Parts may live on different backends. Both directions gather through the
//! host bridge format and hand the result to the conversion engine, so the
//! target gets the same OOM and stream discipline as a plain conversion.

use crate::backend::BackendId;
use crate::buffer::{Buffer, HostArray};
use crate::convert::ConversionEngine;
use crate::error::{BridgeError, Result};

/// Stack same-shape, same-dtype buffers along a new leading axis on `target`.
///
/// Metadata is checked for every part before any data moves.
///
/// # Errors
///
/// - [`BridgeError::EmptyBatch`] for an empty slice
/// - [`BridgeError::ShapeMismatch`] / [`BridgeError::DTypeMismatch`] when a
///   part differs from the first
/// - any conversion error from gathering or placing the result
pub fn stack(
    engine: &ConversionEngine,
    parts: &[Buffer],
    target: BackendId,
    device: Option<usize>,
) -> Result<Buffer> {
    let first = parts.first().ok_or(BridgeError::EmptyBatch)?;
    for part in &parts[1..] {
        if part.dtype() != first.dtype() {
            return Err(BridgeError::DTypeMismatch {
                expected: first.dtype(),
                actual: part.dtype(),
            });
        }
        if part.shape() != first.shape() {
            return Err(BridgeError::shape_mismatch(first.shape(), part.shape()));
        }
    }

    let hosts = parts
        .iter()
        .map(|part| engine.to_host(part))
        .collect::<Result<Vec<HostArray>>>()?;
    let stacked = HostArray::stack(&hosts)?;
    tracing::debug!(
        target: "arraybridge::convert",
        parts = parts.len(),
        shape = ?stacked.shape(),
        %target,
        "stacked batch"
    );
    engine.convert(&Buffer::host(stacked), target, device)
}

/// Split `buffer` along its leading axis into buffers on `target`.
///
/// # Errors
///
/// - [`BridgeError::ShapeMismatch`] for a zero-dimensional buffer
/// - any conversion error
pub fn unstack(
    engine: &ConversionEngine,
    buffer: &Buffer,
    target: BackendId,
    device: Option<usize>,
) -> Result<Vec<Buffer>> {
    if buffer.ndim() == 0 {
        return Err(BridgeError::shape_mismatch(vec![1], Vec::new()));
    }
    let host = engine.to_host(buffer)?;
    host.unstack()?
        .into_iter()
        .map(|part| engine.convert(&Buffer::host(part), target, device))
        .collect()
}
