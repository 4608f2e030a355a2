// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Simulated device backend for integration tests.
//!
//! `SimDevice` behaves like a GPU runtime with a caching allocator:
//! - allocations are charged to a [`MemoryTracker`] with an optional limit;
//! - dropped blocks move to the tracker's cache until `clear_cache`;
//! - memory is host visible, so it exports and imports zero-copy views;
//! - OOM and other failures can be injected for the next N allocations.

#![allow(dead_code)]

use arraybridge::buffer::Storage;
use arraybridge::{
    Backend, BackendError, BackendId, Buffer, DeviceKind, DeviceLocation, HostArray, HostData,
    MemoryTracker, SharedTensor, Stream, StreamHandle,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// How injected failures are reported.
#[derive(Debug, Clone)]
pub enum Failure {
    /// Structured OOM class.
    OomClass,
    /// Generic runtime error whose message signals OOM.
    OomText(&'static str),
    /// Generic runtime error that is not an OOM.
    Runtime(&'static str),
}

impl Failure {
    fn into_error(self) -> BackendError {
        match self {
            Self::OomClass => BackendError::oom("simulated allocator exhausted"),
            Self::OomText(msg) | Self::Runtime(msg) => BackendError::runtime(msg),
        }
    }
}

/// Device allocation; returns its bytes to the cache when dropped.
#[derive(Debug)]
pub struct SimTensor {
    pub data: Arc<HostData>,
    pub shape: Vec<usize>,
    bytes: usize,
    pool: Arc<MemoryTracker>,
}

impl Drop for SimTensor {
    fn drop(&mut self) {
        self.pool.cache(self.bytes);
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub to_host: AtomicUsize,
    pub from_host: AtomicUsize,
    pub exports: AtomicUsize,
    pub imports: AtomicUsize,
    pub streams: AtomicUsize,
    pub clears: AtomicUsize,
}

#[derive(Debug)]
pub struct SimDevice {
    id: BackendId,
    pool: Arc<MemoryTracker>,
    pending: Mutex<Vec<Failure>>,
    stream_failures: Mutex<Vec<Failure>>,
    refuse_export: AtomicBool,
    reads_full: AtomicBool,
    next_stream: AtomicU64,
    pub counters: Counters,
}

impl SimDevice {
    pub fn new(id: BackendId) -> Self {
        Self::with_limit(id, 0)
    }

    pub fn with_limit(id: BackendId, limit_bytes: usize) -> Self {
        Self {
            id,
            pool: Arc::new(MemoryTracker::with_limit(limit_bytes)),
            pending: Mutex::new(Vec::new()),
            stream_failures: Mutex::new(Vec::new()),
            refuse_export: AtomicBool::new(false),
            reads_full: AtomicBool::new(false),
            next_stream: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    /// Fail the next `count` allocations with `failure`.
    pub fn inject(&self, failure: Failure, count: usize) {
        let mut pending = self.pending.lock().unwrap();
        pending.extend(std::iter::repeat(failure).take(count));
    }

    /// Fail the next `count` stream creations with `failure`.
    pub fn inject_stream_failure(&self, failure: Failure, count: usize) {
        let mut pending = self.stream_failures.lock().unwrap();
        pending.extend(std::iter::repeat(failure).take(count));
    }

    /// Fail every `to_host` with an OOM until this device's cache is cleared.
    pub fn fill_staging_until_cleared(&self) {
        self.reads_full.store(true, Ordering::SeqCst);
    }

    pub fn refuse_export(&self, refuse: bool) {
        self.refuse_export.store(refuse, Ordering::SeqCst);
    }

    /// Live plus cached, i.e. what the device would report as reserved.
    pub fn allocated_bytes(&self) -> usize {
        self.pool.reserved_bytes()
    }

    pub fn cached_bytes(&self) -> usize {
        self.pool.cached_bytes()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn allocate(&self, array: &HostArray) -> Result<usize, BackendError> {
        if let Some(failure) = self.pending.lock().unwrap().pop() {
            return Err(failure.into_error());
        }
        let bytes = array.numel() * array.dtype().size_in_bytes();
        self.pool.allocate(bytes)?;
        Ok(bytes)
    }

    fn tensor_of(buffer: &Buffer) -> Result<&SimTensor, BackendError> {
        buffer
            .storage::<SimTensor>()
            .ok_or_else(|| BackendError::runtime("not a simulated device buffer"))
    }

    fn kind(&self) -> DeviceKind {
        match self.id {
            BackendId::Rocm => DeviceKind::Rocm,
            BackendId::Metal => DeviceKind::Metal,
            BackendId::OpenCl => DeviceKind::OpenCl,
            _ => DeviceKind::Cuda,
        }
    }
}

impl Backend for SimDevice {
    fn id(&self) -> BackendId {
        self.id
    }

    fn to_host(&self, buffer: &Buffer, _stream: &Stream) -> Result<HostArray, BackendError> {
        self.counters.to_host.fetch_add(1, Ordering::SeqCst);
        if self.reads_full.load(Ordering::SeqCst) {
            return Err(BackendError::oom("staging buffer for device-to-host copy"));
        }
        let tensor = Self::tensor_of(buffer)?;
        HostArray::from_shared(tensor.shape.clone(), Arc::clone(&tensor.data))
            .map_err(|e| BackendError::runtime(e.to_string()))
    }

    fn from_host(
        &self,
        array: &HostArray,
        device: Option<usize>,
        _stream: &Stream,
    ) -> Result<Buffer, BackendError> {
        self.counters.from_host.fetch_add(1, Ordering::SeqCst);
        let bytes = self.allocate(array)?;
        // Device copy: fresh data, not the caller's allocation.
        let data = Arc::new(array.data().clone());
        let tensor = SimTensor {
            data,
            shape: array.shape().to_vec(),
            bytes,
            pool: Arc::clone(&self.pool),
        };
        Buffer::new(self.id, array.dtype(), array.shape(), Some(device.unwrap_or(0)), tensor)
            .map_err(|e| BackendError::runtime(e.to_string()))
    }

    fn export_shared(&self, buffer: &Buffer, _stream: &Stream) -> Result<SharedTensor, BackendError> {
        self.counters.exports.fetch_add(1, Ordering::SeqCst);
        if self.refuse_export.load(Ordering::SeqCst) {
            return Err(BackendError::runtime("export refused: stream not synchronized"));
        }
        let tensor = Self::tensor_of(buffer)?;
        Ok(SharedTensor::contiguous(
            DeviceLocation::host(),
            buffer.dtype(),
            tensor.shape.clone(),
            Arc::clone(&tensor.data) as Storage,
        ))
    }

    fn import_shared(
        &self,
        view: SharedTensor,
        device: Option<usize>,
        _stream: &Stream,
    ) -> Result<Buffer, BackendError> {
        self.counters.imports.fetch_add(1, Ordering::SeqCst);
        if view.device.kind != DeviceKind::Host && view.device.kind != self.kind() {
            return Err(BackendError::unsupported(format!("cannot adopt {}", view.device)));
        }
        if !view.is_contiguous() {
            return Err(BackendError::unsupported("strided views are not adopted"));
        }
        let data = view
            .owner_handle()
            .downcast::<HostData>()
            .map_err(|_| BackendError::unsupported("foreign owner"))?;
        let dtype = view.dtype;
        let tensor = SimTensor {
            data,
            shape: view.shape.clone(),
            bytes: 0,
            pool: Arc::clone(&self.pool),
        };
        Buffer::new(self.id, dtype, view.shape, Some(device.unwrap_or(0)), tensor)
            .map_err(|e| BackendError::runtime(e.to_string()))
    }

    fn create_stream(&self) -> Result<StreamHandle, BackendError> {
        self.counters.streams.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.stream_failures.lock().unwrap().pop() {
            return Err(failure.into_error());
        }
        Ok(Arc::new(self.next_stream.fetch_add(1, Ordering::SeqCst)))
    }

    fn clear_cache(&self) {
        self.counters.clears.fetch_add(1, Ordering::SeqCst);
        self.reads_full.store(false, Ordering::SeqCst);
        self.pool.clear_cache();
    }
}

/// Host array of `len` f32 values `0, 1, 2, ...`.
pub fn ramp(shape: &[usize]) -> HostArray {
    let len: usize = shape.iter().product();
    #[allow(clippy::cast_precision_loss)]
    let values = (0..len).map(|i| i as f32).collect();
    HostArray::from_vec(shape.to_vec(), values).unwrap()
}
