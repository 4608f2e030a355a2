// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Zero-copy exchange capsule.
//!
//! A [`SharedTensor`] describes memory owned by one backend well enough for
//! another backend to adopt it without copying: the device it lives on, its
//! dtype, shape and element strides, plus a reference-counted handle that
//! keeps the exporter's allocation alive for as long as the importer holds it.
//! This is the DLPack handshake expressed with owned Rust types.
//!
//! Importers must check [`SharedTensor::is_contiguous`] and the device kind
//! before adopting the memory; a refusal is not fatal, the bridge then takes
//! the host fallback path.

use crate::buffer::Storage;
use crate::dtype::DType;
use std::any::Any;
use std::fmt;

/// Physical memory space of a shared view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Host RAM.
    Host,
    /// NVIDIA device memory.
    Cuda,
    /// AMD device memory.
    Rocm,
    /// Apple unified/device memory.
    Metal,
    /// OpenCL device memory.
    OpenCl,
}

/// Device kind plus ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceLocation {
    /// Memory space.
    pub kind: DeviceKind,
    /// Device ordinal (0 for host).
    pub index: usize,
}

impl DeviceLocation {
    /// Host memory.
    #[must_use]
    pub fn host() -> Self {
        Self {
            kind: DeviceKind::Host,
            index: 0,
        }
    }

    /// Device memory of `kind` at `index`.
    #[must_use]
    pub fn device(kind: DeviceKind, index: usize) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.index)
    }
}

/// Row-major element strides for `shape`.
#[must_use]
pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Shared-memory view produced by an exporter and consumed by an importer.
#[derive(Clone)]
pub struct SharedTensor {
    /// Where the memory lives.
    pub device: DeviceLocation,
    /// Element type.
    pub dtype: DType,
    /// Shape.
    pub shape: Vec<usize>,
    /// Element strides.
    pub strides: Vec<usize>,
    /// Offset of the first element, in elements.
    pub offset: usize,
    owner: Storage,
}

impl SharedTensor {
    /// Describe a contiguous row-major allocation.
    pub fn contiguous(
        device: DeviceLocation,
        dtype: DType,
        shape: impl Into<Vec<usize>>,
        owner: Storage,
    ) -> Self {
        let shape = shape.into();
        let strides = row_major_strides(&shape);
        Self {
            device,
            dtype,
            shape,
            strides,
            offset: 0,
            owner,
        }
    }

    /// Describe an arbitrarily strided allocation.
    pub fn strided(
        device: DeviceLocation,
        dtype: DType,
        shape: impl Into<Vec<usize>>,
        strides: impl Into<Vec<usize>>,
        offset: usize,
        owner: Storage,
    ) -> Self {
        Self {
            device,
            dtype,
            shape: shape.into(),
            strides: strides.into(),
            offset,
            owner,
        }
    }

    /// Whether the view is dense row-major with no offset.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0
            && self.strides.len() == self.shape.len()
            && self
                .shape
                .iter()
                .zip(self.strides.iter().zip(row_major_strides(&self.shape)))
                // Size-1 axes may carry any stride.
                .all(|(&dim, (&stride, expected))| dim <= 1 || stride == expected)
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Downcast the exporter's allocation.
    #[must_use]
    pub fn owner<T: Any>(&self) -> Option<&T> {
        self.owner.downcast_ref::<T>()
    }

    /// Shared handle to the exporter's allocation.
    #[must_use]
    pub fn owner_handle(&self) -> Storage {
        Storage::clone(&self.owner)
    }
}

impl fmt::Debug for SharedTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTensor")
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}
