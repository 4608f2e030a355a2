// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Candle backend.
//!
//! Buffers of this backend hold a [`candle_core::Tensor`]. Placement follows
//! [`get_device`]: CUDA when the `cuda` feature is enabled and a device is
//! present, CPU otherwise (with a one-time warning).
//!
//! Candle has no `u16`, `i16` or `i32` storage, so those dtypes are reported
//! as unsupported and the bridge refuses the conversion up front rather than
//! failing halfway.

use crate::backend::BackendId;
use crate::buffer::{Buffer, HostArray, HostData};
use crate::device::{get_device, DeviceConfig};
use crate::dtype::DType;
use crate::error::BackendError;
use crate::rescale::{needs_rescale, stretch_coefficients, RescalePolicy};
use crate::stream::Stream;
use crate::traits::{rescale_via_host, Backend};
use candle_core::{Device, Tensor};

/// Map a bridge dtype onto Candle, if Candle can hold it.
#[must_use]
pub fn candle_dtype(dtype: DType) -> Option<candle_core::DType> {
    match dtype {
        DType::U8 => Some(candle_core::DType::U8),
        DType::U32 => Some(candle_core::DType::U32),
        DType::I64 => Some(candle_core::DType::I64),
        DType::F16 => Some(candle_core::DType::F16),
        DType::BF16 => Some(candle_core::DType::BF16),
        DType::F32 => Some(candle_core::DType::F32),
        DType::F64 => Some(candle_core::DType::F64),
        DType::U16 | DType::I16 | DType::I32 => None,
    }
}

/// Ordinal of the GPU `device` lives on, `None` for the CPU.
fn device_index(device: &Device) -> Option<usize> {
    match device.location() {
        candle_core::DeviceLocation::Cuda { gpu_id } | candle_core::DeviceLocation::Metal { gpu_id } => {
            Some(gpu_id)
        }
        _ => None,
    }
}

/// Backend over Candle tensors.
#[derive(Debug, Clone, Default)]
pub struct CandleBackend {
    config: DeviceConfig,
}

impl CandleBackend {
    /// Create a Candle backend with the given device policy.
    #[must_use]
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }

    /// Device policy in use.
    #[must_use]
    pub fn device_config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Wrap an existing tensor as a bridge buffer, tagged with the ordinal of
    /// the device it lives on.
    ///
    /// # Errors
    ///
    /// Returns an unsupported-class error for Candle dtypes the bridge does
    /// not model.
    pub fn wrap(&self, tensor: Tensor) -> Result<Buffer, BackendError> {
        let dtype = match tensor.dtype() {
            candle_core::DType::U8 => DType::U8,
            candle_core::DType::U32 => DType::U32,
            candle_core::DType::I64 => DType::I64,
            candle_core::DType::F16 => DType::F16,
            candle_core::DType::BF16 => DType::BF16,
            candle_core::DType::F32 => DType::F32,
            candle_core::DType::F64 => DType::F64,
            other => {
                return Err(BackendError::unsupported(format!(
                    "candle dtype {other:?} has no bridge equivalent"
                )))
            }
        };
        let index = device_index(tensor.device());
        let shape = tensor.dims().to_vec();
        Buffer::new(BackendId::Candle, dtype, shape, index, tensor)
            .map_err(|e| BackendError::runtime(e.to_string()))
    }

    fn tensor_of(buffer: &Buffer) -> Result<&Tensor, BackendError> {
        buffer.storage::<Tensor>().ok_or_else(|| {
            BackendError::runtime(format!(
                "buffer tagged {} does not hold a candle tensor",
                buffer.backend()
            ))
        })
    }
}

impl Backend for CandleBackend {
    fn id(&self) -> BackendId {
        BackendId::Candle
    }

    fn supports_dtype(&self, dtype: DType) -> bool {
        candle_dtype(dtype).is_some()
    }

    fn to_host(&self, buffer: &Buffer, _stream: &Stream) -> Result<HostArray, BackendError> {
        let tensor = Self::tensor_of(buffer)?;
        let flat = tensor.flatten_all()?;
        let data = match tensor.dtype() {
            candle_core::DType::U8 => HostData::U8(flat.to_vec1()?),
            candle_core::DType::U32 => HostData::U32(flat.to_vec1()?),
            candle_core::DType::I64 => HostData::I64(flat.to_vec1()?),
            candle_core::DType::F16 => HostData::F16(flat.to_vec1()?),
            candle_core::DType::BF16 => HostData::BF16(flat.to_vec1()?),
            candle_core::DType::F32 => HostData::F32(flat.to_vec1()?),
            candle_core::DType::F64 => HostData::F64(flat.to_vec1()?),
            other => {
                return Err(BackendError::unsupported(format!(
                    "candle dtype {other:?} cannot be copied to host"
                )))
            }
        };
        HostArray::new(tensor.dims(), data).map_err(|e| BackendError::runtime(e.to_string()))
    }

    fn from_host(
        &self,
        array: &HostArray,
        device: Option<usize>,
        _stream: &Stream,
    ) -> Result<Buffer, BackendError> {
        let target = get_device(&self.config, device)
            .map_err(|e| BackendError::unavailable(e.to_string()))?;
        let shape = array.shape();
        let tensor = match array.data() {
            HostData::U8(v) => Tensor::from_slice(v, shape, &target)?,
            HostData::U32(v) => Tensor::from_slice(v, shape, &target)?,
            HostData::I64(v) => Tensor::from_slice(v, shape, &target)?,
            HostData::F16(v) => Tensor::from_slice(v, shape, &target)?,
            HostData::BF16(v) => Tensor::from_slice(v, shape, &target)?,
            HostData::F32(v) => Tensor::from_slice(v, shape, &target)?,
            HostData::F64(v) => Tensor::from_slice(v, shape, &target)?,
            HostData::U16(_) | HostData::I16(_) | HostData::I32(_) => {
                return Err(BackendError::unsupported(format!(
                    "candle cannot represent {}",
                    array.dtype()
                )))
            }
        };
        Buffer::new(
            BackendId::Candle,
            array.dtype(),
            shape,
            device_index(&target),
            tensor,
        )
            .map_err(|e| BackendError::runtime(e.to_string()))
    }

    fn rescale(
        &self,
        buffer: &Buffer,
        dtype: DType,
        policy: RescalePolicy,
        stream: &Stream,
    ) -> Result<Buffer, BackendError> {
        if !needs_rescale(buffer.dtype(), dtype) {
            return Ok(buffer.clone());
        }
        let (Some(target), Some((lo, hi))) = (candle_dtype(dtype), dtype.integer_range()) else {
            return Err(BackendError::unsupported(format!(
                "candle cannot represent {dtype}"
            )));
        };
        let tensor = Self::tensor_of(buffer)?.to_dtype(candle_core::DType::F64)?;
        if tensor.elem_count() == 0 {
            return self.wrap(tensor.to_dtype(target)?);
        }

        let flat = tensor.flatten_all()?;
        let min = flat.min(0)?.to_scalar::<f64>()?;
        let max = flat.max(0)?.to_scalar::<f64>()?;
        if !(min.is_finite() && max.is_finite()) {
            // NaN/inf need the host law's per-element handling.
            return rescale_via_host(self, buffer, dtype, policy, stream);
        }

        let mapped = match policy {
            RescalePolicy::Stretch => match stretch_coefficients(Some((min, max)), dtype) {
                Some((mul, add)) => tensor.affine(mul, add)?,
                None => tensor,
            },
            RescalePolicy::Saturate => tensor,
        };
        let out = mapped.round()?.clamp(lo, hi)?.to_dtype(target)?;
        self.wrap(out)
    }
}
