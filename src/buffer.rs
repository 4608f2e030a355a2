// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Buffer handles and the host bridge format.
//!
//! A [`Buffer`] wraps memory owned by one backend together with the metadata
//! the bridge needs to move it: backend identity, dtype, shape and an optional
//! device index. The allocation itself is type-erased; only the owning backend
//! knows how to downcast it.
//!
//! A [`HostArray`] is the neutral host-resident representation every backend
//! can read from and write to. It is the second hop of the fallback
//! conversion path and the storage type of the host backend.

use crate::backend::{describe, BackendId};
use crate::dtype::DType;
use crate::error::{BridgeError, Result};
use crate::memory::estimate_tensor_bytes;
use half::{bf16, f16};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Type-erased backend allocation.
pub type Storage = Arc<dyn Any + Send + Sync>;

/// Element types that can live in a [`HostArray`].
pub trait HostElement: Copy + Send + Sync + 'static {
    /// Matching dtype.
    const DTYPE: DType;

    /// Widen to `f64`.
    fn to_f64(self) -> f64;

    /// Narrow from `f64`. Integer targets saturate and map NaN to zero.
    fn from_f64(value: f64) -> Self;

    /// Wrap a vector into [`HostData`].
    fn wrap(values: Vec<Self>) -> HostData;

    /// Borrow the matching slice out of [`HostData`].
    fn unwrap(data: &HostData) -> Option<&[Self]>;
}

macro_rules! host_element {
    ($ty:ty, $variant:ident, |$w:ident| $widen:expr, |$n:ident| $narrow:expr) => {
        impl HostElement for $ty {
            const DTYPE: DType = DType::$variant;

            #[allow(clippy::cast_precision_loss, clippy::cast_lossless)]
            fn to_f64(self) -> f64 {
                let $w = self;
                $widen
            }

            #[allow(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                clippy::cast_precision_loss
            )]
            fn from_f64(value: f64) -> Self {
                let $n = value;
                $narrow
            }

            fn wrap(values: Vec<Self>) -> HostData {
                HostData::$variant(values)
            }

            fn unwrap(data: &HostData) -> Option<&[Self]> {
                match data {
                    HostData::$variant(values) => Some(values),
                    _ => None,
                }
            }
        }
    };
}

host_element!(u8, U8, |v| v as f64, |v| v as u8);
host_element!(u16, U16, |v| v as f64, |v| v as u16);
host_element!(u32, U32, |v| v as f64, |v| v as u32);
host_element!(i16, I16, |v| v as f64, |v| v as i16);
host_element!(i32, I32, |v| v as f64, |v| v as i32);
host_element!(i64, I64, |v| v as f64, |v| v as i64);
host_element!(f16, F16, |v| v.to_f64(), |v| f16::from_f64(v));
host_element!(bf16, BF16, |v| v.to_f64(), |v| bf16::from_f64(v));
host_element!(f32, F32, |v| v as f64, |v| v as f32);
host_element!(f64, F64, |v| v, |v| v);

/// Typed contiguous host data.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    /// `u8` elements.
    U8(Vec<u8>),
    /// `u16` elements.
    U16(Vec<u16>),
    /// `u32` elements.
    U32(Vec<u32>),
    /// `i16` elements.
    I16(Vec<i16>),
    /// `i32` elements.
    I32(Vec<i32>),
    /// `i64` elements.
    I64(Vec<i64>),
    /// `f16` elements.
    F16(Vec<f16>),
    /// `bf16` elements.
    BF16(Vec<bf16>),
    /// `f32` elements.
    F32(Vec<f32>),
    /// `f64` elements.
    F64(Vec<f64>),
}

/// Run `$body` with `$v` bound to the inner vector, whatever its type.
macro_rules! with_values {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            HostData::U8($v) => $body,
            HostData::U16($v) => $body,
            HostData::U32($v) => $body,
            HostData::I16($v) => $body,
            HostData::I32($v) => $body,
            HostData::I64($v) => $body,
            HostData::F16($v) => $body,
            HostData::BF16($v) => $body,
            HostData::F32($v) => $body,
            HostData::F64($v) => $body,
        }
    };
}

/// Like `with_values!`, re-wrapping the result in the same variant.
macro_rules! map_values {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            HostData::U8($v) => HostData::U8($body),
            HostData::U16($v) => HostData::U16($body),
            HostData::U32($v) => HostData::U32($body),
            HostData::I16($v) => HostData::I16($body),
            HostData::I32($v) => HostData::I32($body),
            HostData::I64($v) => HostData::I64($body),
            HostData::F16($v) => HostData::F16($body),
            HostData::BF16($v) => HostData::BF16($body),
            HostData::F32($v) => HostData::F32($body),
            HostData::F64($v) => HostData::F64($body),
        }
    };
}

fn narrow<T: HostElement>(values: &[f64]) -> Vec<T> {
    values.iter().map(|&v| T::from_f64(v)).collect()
}

impl HostData {
    /// Element type.
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::U8(_) => DType::U8,
            Self::U16(_) => DType::U16,
            Self::U32(_) => DType::U32,
            Self::I16(_) => DType::I16,
            Self::I32(_) => DType::I32,
            Self::I64(_) => DType::I64,
            Self::F16(_) => DType::F16,
            Self::BF16(_) => DType::BF16,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        with_values!(self, v => v.len())
    }

    /// Whether there are no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the elements as `T`, if `T` matches the dtype.
    #[must_use]
    pub fn as_slice<T: HostElement>(&self) -> Option<&[T]> {
        T::unwrap(self)
    }

    /// Widen every element to `f64`.
    #[must_use]
    pub fn to_f64(&self) -> Vec<f64> {
        with_values!(self, v => v.iter().map(|&x| x.to_f64()).collect())
    }

    /// Build data of `dtype` from `f64` lanes with saturating casts.
    #[must_use]
    pub fn from_f64(dtype: DType, values: &[f64]) -> Self {
        match dtype {
            DType::U8 => Self::U8(narrow(values)),
            DType::U16 => Self::U16(narrow(values)),
            DType::U32 => Self::U32(narrow(values)),
            DType::I16 => Self::I16(narrow(values)),
            DType::I32 => Self::I32(narrow(values)),
            DType::I64 => Self::I64(narrow(values)),
            DType::F16 => Self::F16(narrow(values)),
            DType::BF16 => Self::BF16(narrow(values)),
            DType::F32 => Self::F32(narrow(values)),
            DType::F64 => Self::F64(values.to_vec()),
        }
    }

    /// Copy of the elements in `range`.
    fn slice(&self, range: std::ops::Range<usize>) -> Self {
        map_values!(self, v => v[range].to_vec())
    }

    /// Append `other` (same dtype) to `self`.
    fn extend_from(&mut self, other: &HostData) -> Result<()> {
        let (expected, actual) = (self.dtype(), other.dtype());
        match (self, other) {
            (Self::U8(a), Self::U8(b)) => a.extend_from_slice(b),
            (Self::U16(a), Self::U16(b)) => a.extend_from_slice(b),
            (Self::U32(a), Self::U32(b)) => a.extend_from_slice(b),
            (Self::I16(a), Self::I16(b)) => a.extend_from_slice(b),
            (Self::I32(a), Self::I32(b)) => a.extend_from_slice(b),
            (Self::I64(a), Self::I64(b)) => a.extend_from_slice(b),
            (Self::F16(a), Self::F16(b)) => a.extend_from_slice(b),
            (Self::BF16(a), Self::BF16(b)) => a.extend_from_slice(b),
            (Self::F32(a), Self::F32(b)) => a.extend_from_slice(b),
            (Self::F64(a), Self::F64(b)) => a.extend_from_slice(b),
            _ => return Err(BridgeError::DTypeMismatch { expected, actual }),
        }
        Ok(())
    }

    fn with_capacity(dtype: DType, capacity: usize) -> Self {
        match dtype {
            DType::U8 => Self::U8(Vec::with_capacity(capacity)),
            DType::U16 => Self::U16(Vec::with_capacity(capacity)),
            DType::U32 => Self::U32(Vec::with_capacity(capacity)),
            DType::I16 => Self::I16(Vec::with_capacity(capacity)),
            DType::I32 => Self::I32(Vec::with_capacity(capacity)),
            DType::I64 => Self::I64(Vec::with_capacity(capacity)),
            DType::F16 => Self::F16(Vec::with_capacity(capacity)),
            DType::BF16 => Self::BF16(Vec::with_capacity(capacity)),
            DType::F32 => Self::F32(Vec::with_capacity(capacity)),
            DType::F64 => Self::F64(Vec::with_capacity(capacity)),
        }
    }
}

/// Contiguous row-major host array: the bridge format.
///
/// The element storage is reference counted so that exporting a zero-copy
/// view never copies; the data is immutable once wrapped.
#[derive(Debug, Clone, PartialEq)]
pub struct HostArray {
    shape: Vec<usize>,
    data: Arc<HostData>,
}

impl HostArray {
    /// Wrap `data` with `shape`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ShapeMismatch`] if the element count differs
    /// from the product of `shape`.
    pub fn new(shape: impl Into<Vec<usize>>, data: HostData) -> Result<Self> {
        Self::from_shared(shape, Arc::new(data))
    }

    /// Wrap already shared data with `shape`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ShapeMismatch`] on an element count mismatch.
    pub fn from_shared(shape: impl Into<Vec<usize>>, data: Arc<HostData>) -> Result<Self> {
        let shape = shape.into();
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(BridgeError::shape_mismatch(vec![numel], vec![data.len()]));
        }
        Ok(Self { shape, data })
    }

    /// Build from a typed vector.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ShapeMismatch`] on an element count mismatch.
    pub fn from_vec<T: HostElement>(shape: impl Into<Vec<usize>>, values: Vec<T>) -> Result<Self> {
        Self::new(shape, T::wrap(values))
    }

    /// Same shape, new data of equal length.
    pub(crate) fn with_data(&self, data: HostData) -> Self {
        debug_assert_eq!(data.len(), self.numel());
        Self {
            shape: self.shape.clone(),
            data: Arc::new(data),
        }
    }

    /// Shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Borrow the typed data.
    #[must_use]
    pub fn data(&self) -> &HostData {
        &self.data
    }

    /// Shared handle to the data (no copy).
    #[must_use]
    pub fn shared_data(&self) -> Arc<HostData> {
        Arc::clone(&self.data)
    }

    /// Copy the elements out as `T`, if `T` matches the dtype.
    #[must_use]
    pub fn to_vec<T: HostElement>(&self) -> Option<Vec<T>> {
        self.data.as_slice::<T>().map(<[T]>::to_vec)
    }

    /// Widen every element to `f64`.
    #[must_use]
    pub fn to_f64(&self) -> Vec<f64> {
        self.data.to_f64()
    }

    /// Stack same-shape, same-dtype arrays along a new leading axis.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::EmptyBatch`] for an empty slice
    /// - [`BridgeError::ShapeMismatch`] / [`BridgeError::DTypeMismatch`] if
    ///   any part differs from the first
    pub fn stack(parts: &[HostArray]) -> Result<Self> {
        let first = parts.first().ok_or(BridgeError::EmptyBatch)?;
        let mut data = HostData::with_capacity(first.dtype(), first.numel() * parts.len());
        for part in parts {
            if part.shape != first.shape {
                return Err(BridgeError::shape_mismatch(
                    first.shape.clone(),
                    part.shape.clone(),
                ));
            }
            data.extend_from(&part.data)?;
        }
        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(parts.len());
        shape.extend_from_slice(&first.shape);
        Self::new(shape, data)
    }

    /// Split along the leading axis (inverse of [`HostArray::stack`]).
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ShapeMismatch`] for zero-dimensional arrays.
    pub fn unstack(&self) -> Result<Vec<Self>> {
        let (&count, rest) = self
            .shape
            .split_first()
            .ok_or_else(|| BridgeError::shape_mismatch(vec![1], Vec::new()))?;
        let step: usize = rest.iter().product();
        (0..count)
            .map(|i| Self::new(rest.to_vec(), self.data.slice(i * step..(i + 1) * step)))
            .collect()
    }
}

/// Handle to backend-owned array memory plus metadata.
///
/// Cloning a `Buffer` clones the handle; the backend allocation is released
/// when the last handle is dropped.
#[derive(Clone)]
pub struct Buffer {
    backend: BackendId,
    dtype: DType,
    shape: Vec<usize>,
    device: Option<usize>,
    storage: Storage,
}

impl Buffer {
    /// Wrap a backend allocation.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::UnknownBackend`] if `backend` has no descriptor
    /// - [`BridgeError::InvalidConfig`] if a device index is given for a
    ///   backend that is not device aware
    pub fn new<S: Any + Send + Sync>(
        backend: BackendId,
        dtype: DType,
        shape: impl Into<Vec<usize>>,
        device: Option<usize>,
        storage: S,
    ) -> Result<Self> {
        Self::from_storage(backend, dtype, shape, device, Arc::new(storage))
    }

    /// Wrap an already shared backend allocation.
    ///
    /// # Errors
    ///
    /// Same as [`Buffer::new`].
    pub fn from_storage(
        backend: BackendId,
        dtype: DType,
        shape: impl Into<Vec<usize>>,
        device: Option<usize>,
        storage: Storage,
    ) -> Result<Self> {
        let descriptor = describe(backend)?;
        if device.is_some() && !descriptor.device_aware {
            return Err(BridgeError::invalid_config(format!(
                "backend {backend} does not accept a device index"
            )));
        }
        Ok(Self {
            backend,
            dtype,
            shape: shape.into(),
            device,
            storage,
        })
    }

    /// Wrap a host array as a host-backend buffer.
    #[must_use]
    pub fn host(array: HostArray) -> Self {
        Self {
            backend: BackendId::Host,
            dtype: array.dtype(),
            shape: array.shape().to_vec(),
            device: None,
            storage: Arc::new(array),
        }
    }

    /// Owning backend.
    #[must_use]
    pub fn backend(&self) -> BackendId {
        self.backend
    }

    /// Element type.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Device index, for device-resident buffers.
    #[must_use]
    pub fn device(&self) -> Option<usize> {
        self.device
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Raw size of the data in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        estimate_tensor_bytes(&self.shape, self.dtype)
    }

    /// Downcast the backend allocation.
    #[must_use]
    pub fn storage<T: Any>(&self) -> Option<&T> {
        self.storage.downcast_ref::<T>()
    }

    /// Shared handle to the backend allocation.
    #[must_use]
    pub fn storage_handle(&self) -> Storage {
        Arc::clone(&self.storage)
    }

    /// Whether two buffers are handles to the same allocation.
    #[must_use]
    pub fn shares_storage_with(&self, other: &Buffer) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.storage), Arc::as_ptr(&other.storage))
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("backend", &self.backend)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}
