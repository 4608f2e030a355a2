// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Host backend.
//!
//! Buffers of this backend hold a [`HostArray`] directly, so both fallback
//! hops are reference-count bumps rather than copies. The backend also
//! exports and imports zero-copy views of host memory, which lets device
//! runtimes with host-visible memory (or any backend that keeps its data in a
//! `HostData`) exchange buffers with it without copying.

use crate::backend::BackendId;
use crate::buffer::{Buffer, HostArray, HostData};
use crate::error::BackendError;
use crate::exchange::{DeviceKind, DeviceLocation, SharedTensor};
use crate::stream::Stream;
use crate::traits::Backend;

/// Host-memory backend; its storage type is [`HostArray`].
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBackend;

impl HostBackend {
    /// Create the host backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn array_of(buffer: &Buffer) -> Result<&HostArray, BackendError> {
        buffer.storage::<HostArray>().ok_or_else(|| {
            BackendError::runtime(format!(
                "buffer tagged {} does not hold host memory",
                buffer.backend()
            ))
        })
    }
}

impl Backend for HostBackend {
    fn id(&self) -> BackendId {
        BackendId::Host
    }

    fn to_host(&self, buffer: &Buffer, _stream: &Stream) -> Result<HostArray, BackendError> {
        Self::array_of(buffer).cloned()
    }

    fn from_host(
        &self,
        array: &HostArray,
        _device: Option<usize>,
        _stream: &Stream,
    ) -> Result<Buffer, BackendError> {
        Ok(Buffer::host(array.clone()))
    }

    fn export_shared(&self, buffer: &Buffer, _stream: &Stream) -> Result<SharedTensor, BackendError> {
        let array = Self::array_of(buffer)?;
        Ok(SharedTensor::contiguous(
            DeviceLocation::host(),
            array.dtype(),
            array.shape(),
            array.shared_data(),
        ))
    }

    fn import_shared(
        &self,
        view: SharedTensor,
        _device: Option<usize>,
        _stream: &Stream,
    ) -> Result<Buffer, BackendError> {
        if view.device.kind != DeviceKind::Host {
            return Err(BackendError::unsupported(format!(
                "host cannot adopt memory on {}",
                view.device
            )));
        }
        if !view.is_contiguous() {
            return Err(BackendError::unsupported("host import requires a contiguous view"));
        }
        let data = view
            .owner_handle()
            .downcast::<HostData>()
            .map_err(|_| BackendError::unsupported("shared view is not backed by host data"))?;
        if data.dtype() != view.dtype {
            return Err(BackendError::unsupported(format!(
                "view declares {} but holds {}",
                view.dtype,
                data.dtype()
            )));
        }
        let array = HostArray::from_shared(view.shape, data)
            .map_err(|e| BackendError::unsupported(e.to_string()))?;
        Ok(Buffer::host(array))
    }
}
