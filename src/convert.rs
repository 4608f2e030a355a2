// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Conversion engine.
//!
//! Moving a buffer between backends goes through up to three stages:
//!
//! 1. **Identity**: a buffer already on the target is returned as is.
//! 2. **Zero-copy**: when both descriptors allow it, the source exports a
//!    [`SharedTensor`](crate::SharedTensor) and the target adopts it. Any
//!    failure here is logged at `warn` and the engine moves on.
//! 3. **Host fallback**: source `to_host`, target `from_host`.
//!
//! Stages 2 and 3 run with the calling thread's pooled stream for each
//! backend and under the OOM supervisor, which consults the target
//! descriptor before the source descriptor.

use crate::backend::{BackendDescriptor, BackendId};
use crate::buffer::{Buffer, HostArray};
use crate::dtype::DType;
use crate::error::{BackendError, BridgeError, Result};
use crate::logging::log_conversion;
use crate::recovery::{run_with_recovery, Fault, OomCandidate, DEFAULT_MAX_RETRIES};
use crate::registry::BackendRegistry;
use crate::rescale::{needs_rescale, RescalePolicy};
use crate::stream::{Stream, StreamPool};
use crate::traits::Backend;
use std::sync::Arc;
use std::time::Instant;

/// Backend implementation plus descriptor, resolved once per call.
struct Endpoint<'a> {
    backend: &'a dyn Backend,
    descriptor: &'static BackendDescriptor,
    stream: Stream,
}

impl Endpoint<'_> {
    fn id(&self) -> BackendId {
        self.descriptor.id
    }

    fn candidate(&self) -> OomCandidate<'_> {
        OomCandidate::new(self.backend, self.descriptor)
    }
}

/// Dispatches conversions using the descriptor table and a backend registry.
#[derive(Debug, Clone)]
pub struct ConversionEngine {
    registry: Arc<BackendRegistry>,
    streams: StreamPool,
    zero_copy: bool,
    max_retries: usize,
}

impl ConversionEngine {
    /// Engine over `registry` with zero-copy on and the default retry budget.
    #[must_use]
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            streams: StreamPool::new(),
            zero_copy: true,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Enable or disable the zero-copy stage.
    #[must_use]
    pub fn with_zero_copy(mut self, enabled: bool) -> Self {
        self.zero_copy = enabled;
        self
    }

    /// Retry budget used by [`convert`](Self::convert).
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Registered implementations.
    #[must_use]
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Per-thread stream pool.
    #[must_use]
    pub fn streams(&self) -> &StreamPool {
        &self.streams
    }

    /// Calling thread's stream for `backend`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::BackendUnavailable`] if no implementation is
    /// registered or stream creation fails, [`BridgeError::OutOfMemory`] if
    /// stream creation keeps running out of memory.
    pub fn acquire_stream(&self, backend: BackendId) -> Result<Stream> {
        Ok(self.endpoint(backend)?.stream)
    }

    fn endpoint(&self, id: BackendId) -> Result<Endpoint<'_>> {
        let (backend, descriptor) = self.registry.resolve(id)?;
        // Creating a stream allocates device memory, so an OOM here is
        // retried like any other allocation.
        let candidate = OomCandidate::new(backend.as_ref(), descriptor);
        let stream = run_with_recovery(&[candidate], id, id, self.max_retries, |_| {
            self.streams
                .acquire(descriptor, || backend.create_stream())
                .map_err(|e| Fault::new(id, e))
        })
        .map_err(|failure| {
            if failure.oom_backend.is_some() {
                failure.into_bridge_error(id, id)
            } else {
                BridgeError::unavailable(id, format!("stream creation failed: {}", failure.fault.error))
            }
        })?;
        Ok(Endpoint {
            backend: backend.as_ref(),
            descriptor,
            stream,
        })
    }

    /// Convert `buffer` to `target`, placing it on `device` when the target
    /// is device aware.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::UnsupportedConversion`] if the target cannot hold the
    ///   buffer's dtype or reports the operation unsupported
    /// - [`BridgeError::BackendUnavailable`] if a backend is not registered
    ///   or cannot initialize
    /// - [`BridgeError::OutOfMemory`] once the retry budget is exhausted
    /// - [`BridgeError::ConversionFailure`] for any other backend error
    pub fn convert(&self, buffer: &Buffer, target: BackendId, device: Option<usize>) -> Result<Buffer> {
        let source_id = buffer.backend();
        if source_id == target {
            return Ok(buffer.clone());
        }

        let source = self.endpoint(source_id)?;
        let sink = self.endpoint(target)?;
        if !sink.backend.supports_dtype(buffer.dtype()) {
            return Err(BridgeError::unsupported(
                source_id,
                target,
                format!("{target} cannot represent {}", buffer.dtype()),
            ));
        }
        let device = if sink.descriptor.device_aware { device } else { None };

        let started = Instant::now();
        let candidates = [sink.candidate(), source.candidate()];
        let (converted, zero_copy) =
            run_with_recovery(&candidates, source_id, target, self.max_retries, |_| {
                self.transfer(buffer, &source, &sink, device)
            })
            .map_err(|failure| failure.into_bridge_error(source_id, target))?;

        log_conversion(
            source_id,
            target,
            converted.shape(),
            converted.dtype(),
            zero_copy,
            started.elapsed(),
        );
        Ok(converted)
    }

    /// One complete attempt. Returns the buffer and whether it moved zero-copy.
    fn transfer(
        &self,
        buffer: &Buffer,
        source: &Endpoint<'_>,
        sink: &Endpoint<'_>,
        device: Option<usize>,
    ) -> std::result::Result<(Buffer, bool), Fault> {
        if self.zero_copy && source.descriptor.supports_zero_copy && sink.descriptor.supports_zero_copy {
            match Self::exchange_shared(buffer, source, sink, device) {
                Ok(converted) => return Ok((converted, true)),
                Err(fault) => tracing::warn!(
                    target: "arraybridge::convert",
                    source = %source.id(),
                    target = %sink.id(),
                    failed_on = %fault.backend,
                    error = %fault.error,
                    "zero-copy exchange failed, falling back to host copy"
                ),
            }
        }

        let host = source
            .backend
            .to_host(buffer, &source.stream)
            .map_err(|e| Fault::new(source.id(), e))?;
        let converted = sink
            .backend
            .from_host(&host, device, &sink.stream)
            .map_err(|e| Fault::new(sink.id(), e))?;
        Self::check_result(&converted, buffer, sink.id())?;
        Ok((converted, false))
    }

    fn exchange_shared(
        buffer: &Buffer,
        source: &Endpoint<'_>,
        sink: &Endpoint<'_>,
        device: Option<usize>,
    ) -> std::result::Result<Buffer, Fault> {
        let view = source
            .backend
            .export_shared(buffer, &source.stream)
            .map_err(|e| Fault::new(source.id(), e))?;
        let converted = sink
            .backend
            .import_shared(view, device, &sink.stream)
            .map_err(|e| Fault::new(sink.id(), e))?;
        Self::check_result(&converted, buffer, sink.id())?;
        Ok(converted)
    }

    fn check_result(converted: &Buffer, original: &Buffer, target: BackendId) -> std::result::Result<(), Fault> {
        let error = if converted.backend() != target {
            format!("produced a buffer tagged {}", converted.backend())
        } else if converted.shape() != original.shape() {
            format!(
                "produced shape {:?} for input shape {:?}",
                converted.shape(),
                original.shape()
            )
        } else {
            return Ok(());
        };
        Err(Fault::new(target, BackendError::runtime(error)))
    }

    /// Copy any buffer into the host bridge format.
    ///
    /// # Errors
    ///
    /// As [`convert`](Self::convert).
    pub fn to_host(&self, buffer: &Buffer) -> Result<HostArray> {
        let host = self.convert(buffer, BackendId::Host, None)?;
        host.storage::<HostArray>().cloned().ok_or_else(|| BridgeError::ConversionFailure {
            source_backend: buffer.backend(),
            target: BackendId::Host,
            backend: BackendId::Host,
            error: BackendError::runtime("host backend returned foreign storage"),
        })
    }

    /// Rescale a float `result` back into integer `original` dtype on its own
    /// backend. Any other dtype pairing returns `result` unchanged.
    ///
    /// # Errors
    ///
    /// As [`run_scoped`](Self::run_scoped).
    pub fn preserve_dtype(&self, result: &Buffer, original: DType, policy: RescalePolicy) -> Result<Buffer> {
        if !needs_rescale(result.dtype(), original) {
            return Ok(result.clone());
        }
        let backend = result.backend();
        let implementation = Arc::clone(self.registry.get(backend)?);
        if !implementation.supports_dtype(original) {
            return Err(BridgeError::unsupported(
                backend,
                backend,
                format!("{backend} cannot represent {original}"),
            ));
        }
        self.run_scoped(backend, self.max_retries, |stream| {
            implementation.rescale(result, original, policy, stream)
        })
    }

    /// Run `op` with the calling thread's stream for `backend`, under OOM
    /// supervision against that backend's descriptor.
    ///
    /// # Errors
    ///
    /// [`BridgeError::OutOfMemory`] once retries are exhausted, otherwise the
    /// mapped form of the first non-OOM error.
    pub fn run_scoped<T, F>(&self, backend: BackendId, max_retries: usize, mut op: F) -> Result<T>
    where
        F: FnMut(&Stream) -> std::result::Result<T, BackendError>,
    {
        let endpoint = self.endpoint(backend)?;
        run_with_recovery(&[endpoint.candidate()], backend, backend, max_retries, |_| {
            op(&endpoint.stream).map_err(|e| Fault::new(backend, e))
        })
        .map_err(|failure| failure.into_bridge_error(backend, backend))
    }

    /// Run `op` under OOM supervision for `backend`, without a stream.
    ///
    /// # Errors
    ///
    /// As [`run_scoped`](Self::run_scoped).
    pub fn with_oom_recovery<T, F>(&self, backend: BackendId, max_retries: usize, mut op: F) -> Result<T>
    where
        F: FnMut() -> std::result::Result<T, BackendError>,
    {
        let (implementation, descriptor) = self.registry.resolve(backend)?;
        let candidate = OomCandidate::new(implementation.as_ref(), descriptor);
        run_with_recovery(&[candidate], backend, backend, max_retries, |_| {
            op().map_err(|e| Fault::new(backend, e))
        })
        .map_err(|failure| failure.into_bridge_error(backend, backend))
    }
}
