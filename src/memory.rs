// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Byte accounting for device backends.
//!
//! GPU runtimes rarely return freed blocks to the driver; they keep them in a
//! caching allocator. A device can therefore refuse an allocation while
//! holding plenty of idle memory, which is exactly the OOM the supervisor
//! recovers from by clearing the cache. [`MemoryTracker`] models that:
//! blocks are either live or cached, both count against the limit, and
//! [`MemoryTracker::clear_cache`] gives the cached part back.
//!
//! Exceeding the limit yields a [`BackendError`] of class
//! [`ErrorClass::OutOfMemory`](crate::ErrorClass::OutOfMemory), which every
//! descriptor recognises.

use crate::dtype::DType;
use crate::error::BackendError;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Bytes needed to hold `shape` elements of `dtype`, without allocator
/// rounding.
///
/// ```rust
/// use arraybridge::{estimate_tensor_bytes, DType};
///
/// assert_eq!(estimate_tensor_bytes(&[2048, 2048], DType::U16), 2048 * 2048 * 2);
/// ```
#[must_use]
pub fn estimate_tensor_bytes(shape: &[usize], dtype: DType) -> usize {
    shape
        .iter()
        .product::<usize>()
        .saturating_mul(dtype.size_in_bytes())
}

#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    live: usize,
    cached: usize,
    peak: usize,
}

impl Usage {
    fn reserved(self) -> usize {
        self.live + self.cached
    }
}

/// Live and cached bytes of one device, with an optional limit.
///
/// Shared by reference between every thread driving the device.
///
/// ```rust
/// use arraybridge::MemoryTracker;
///
/// let tracker = MemoryTracker::with_limit(1024);
/// tracker.allocate(800)?;
/// tracker.cache(800);
/// assert!(tracker.allocate(800).is_err());
/// assert_eq!(tracker.clear_cache(), 800);
/// tracker.allocate(800)?;
/// # Ok::<(), arraybridge::BackendError>(())
/// ```
#[derive(Debug, Default)]
pub struct MemoryTracker {
    usage: Mutex<Usage>,
    /// 0 = unlimited.
    limit: usize,
}

impl MemoryTracker {
    /// Tracker without a limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that refuses to reserve more than `limit_bytes` (0 = no limit).
    #[must_use]
    pub fn with_limit(limit_bytes: usize) -> Self {
        Self {
            usage: Mutex::default(),
            limit: limit_bytes,
        }
    }

    fn usage(&self) -> MutexGuard<'_, Usage> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Charge a new live block of `bytes`.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when live plus cached plus `bytes` exceeds the limit.
    /// Nothing is charged in that case.
    pub fn allocate(&self, bytes: usize) -> Result<(), BackendError> {
        let mut usage = self.usage();
        let reserved = usage.reserved().saturating_add(bytes);
        if self.limit > 0 && reserved > self.limit {
            return Err(BackendError::oom(format!(
                "out of memory: tried to allocate {bytes} bytes \
                 ({} live, {} cached, limit {})",
                usage.live, usage.cached, self.limit
            )));
        }
        usage.live += bytes;
        usage.peak = usage.peak.max(reserved);
        Ok(())
    }

    /// Free a live block straight back to the device.
    pub fn deallocate(&self, bytes: usize) {
        let mut usage = self.usage();
        usage.live = usage.live.saturating_sub(bytes);
    }

    /// Free a live block into the allocator cache. It stays reserved.
    pub fn cache(&self, bytes: usize) {
        let mut usage = self.usage();
        let moved = bytes.min(usage.live);
        usage.live -= moved;
        usage.cached += moved;
    }

    /// Release every cached block; returns the bytes released.
    pub fn clear_cache(&self) -> usize {
        std::mem::take(&mut self.usage().cached)
    }

    /// Bytes held by live blocks.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.usage().live
    }

    /// Bytes parked in the allocator cache.
    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        self.usage().cached
    }

    /// Live plus cached.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.usage().reserved()
    }

    /// Highest reserved total since creation or [`reset`](Self::reset).
    #[must_use]
    pub fn peak_bytes(&self) -> usize {
        self.usage().peak
    }

    /// Configured limit (0 = unlimited).
    #[must_use]
    pub fn limit_bytes(&self) -> usize {
        self.limit
    }

    /// Bytes that can still be allocated without clearing the cache, or
    /// `None` when unlimited.
    #[must_use]
    pub fn headroom(&self) -> Option<usize> {
        (self.limit > 0).then(|| self.limit.saturating_sub(self.reserved_bytes()))
    }

    /// Forget all usage, including the peak.
    pub fn reset(&self) {
        *self.usage() = Usage::default();
    }
}
