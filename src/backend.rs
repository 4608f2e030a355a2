// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Backend identities and the static capability table.
//!
//! Every backend the bridge knows about is listed in [`BackendId`], and each
//! one has exactly one [`BackendDescriptor`] in a `static` table. The table is
//! plain data: it is built at compile time, never mutated, and read without
//! locking from any thread. Conversion dispatch, OOM classification and
//! stream creation are all driven by these descriptors rather than by
//! per-pair code.
//!
//! ## Example
//!
//! ```rust
//! use arraybridge::{describe, BackendId};
//!
//! let cuda = describe(BackendId::Cuda)?;
//! assert!(cuda.supports_streams);
//! assert!(cuda.supports_zero_copy);
//!
//! let host: BackendId = "host".parse()?;
//! assert!(!describe(host)?.device_aware);
//! # Ok::<(), arraybridge::BridgeError>(())
//! ```

use crate::error::{BackendError, BridgeError, ErrorClass, Result};
use std::fmt;
use std::str::FromStr;

/// Closed set of supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendId {
    /// Host memory. Also the neutral bridge format.
    Host,
    /// `candle-core` tensors (CPU or CUDA device).
    Candle,
    /// CUDA array runtimes.
    Cuda,
    /// ROCm/HIP array runtimes.
    Rocm,
    /// Apple Metal array runtimes.
    Metal,
    /// OpenCL array runtimes.
    OpenCl,
}

impl BackendId {
    /// All backends, in descriptor table order.
    pub const ALL: [BackendId; 6] = [
        Self::Host,
        Self::Candle,
        Self::Cuda,
        Self::Rocm,
        Self::Metal,
        Self::OpenCl,
    ];

    /// Lowercase name used for parsing, display and log fields.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Candle => "candle",
            Self::Cuda => "cuda",
            Self::Rocm => "rocm",
            Self::Metal => "metal",
            Self::OpenCl => "opencl",
        }
    }

    /// Whether buffers of this backend may live in device memory.
    #[must_use]
    pub fn is_device(self) -> bool {
        !matches!(self, Self::Host)
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendId {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|id| id.name() == wanted)
            .ok_or_else(|| BridgeError::unknown_backend(s))
    }
}

/// One rule for recognising an out-of-memory failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomMatcher {
    /// Structural match on the error class.
    Class(ErrorClass),
    /// Case-insensitive substring of the error message.
    Text(&'static str),
}

impl OomMatcher {
    /// Whether this rule matches `err`.
    #[must_use]
    pub fn matches(&self, err: &BackendError) -> bool {
        match self {
            Self::Class(class) => err.class == *class,
            Self::Text(pattern) => contains_ignore_case(&err.message, pattern),
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

/// Capabilities of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendDescriptor {
    /// Backend this descriptor governs.
    pub id: BackendId,
    /// Can export/import shared-memory views without copying.
    pub supports_zero_copy: bool,
    /// Has explicit execution streams worth pooling per thread.
    pub supports_streams: bool,
    /// Exposes an allocator cache that can be released on demand.
    pub supports_cache_clear: bool,
    /// Accepts a device index when allocating.
    pub device_aware: bool,
    /// Ordered OOM recognition rules.
    pub oom_matchers: &'static [OomMatcher],
}

impl BackendDescriptor {
    /// Whether `err` is an out-of-memory failure for this backend.
    ///
    /// Matches if the error class equals one of the listed classes, or the
    /// message contains one of the listed patterns.
    #[must_use]
    pub fn is_oom(&self, err: &BackendError) -> bool {
        self.oom_matchers.iter().any(|m| m.matches(err))
    }
}

static DESCRIPTORS: [BackendDescriptor; 6] = [
    BackendDescriptor {
        id: BackendId::Host,
        supports_zero_copy: true,
        supports_streams: false,
        supports_cache_clear: false,
        device_aware: false,
        oom_matchers: &[
            OomMatcher::Class(ErrorClass::OutOfMemory),
            OomMatcher::Text("memory allocation of"),
        ],
    },
    BackendDescriptor {
        id: BackendId::Candle,
        supports_zero_copy: false,
        // Candle owns its CUDA stream internally.
        supports_streams: false,
        supports_cache_clear: false,
        device_aware: true,
        oom_matchers: &[
            OomMatcher::Class(ErrorClass::OutOfMemory),
            OomMatcher::Text("CUDA_ERROR_OUT_OF_MEMORY"),
            OomMatcher::Text("out of memory"),
        ],
    },
    BackendDescriptor {
        id: BackendId::Cuda,
        supports_zero_copy: true,
        supports_streams: true,
        supports_cache_clear: true,
        device_aware: true,
        oom_matchers: &[
            OomMatcher::Class(ErrorClass::OutOfMemory),
            OomMatcher::Text("out of memory"),
            OomMatcher::Text("cudaErrorMemoryAllocation"),
            OomMatcher::Text("CUDA_ERROR_OUT_OF_MEMORY"),
        ],
    },
    BackendDescriptor {
        id: BackendId::Rocm,
        supports_zero_copy: true,
        supports_streams: true,
        supports_cache_clear: true,
        device_aware: true,
        oom_matchers: &[
            OomMatcher::Class(ErrorClass::OutOfMemory),
            OomMatcher::Text("hipErrorOutOfMemory"),
            OomMatcher::Text("out of memory"),
        ],
    },
    BackendDescriptor {
        id: BackendId::Metal,
        supports_zero_copy: false,
        supports_streams: true,
        supports_cache_clear: true,
        device_aware: true,
        oom_matchers: &[
            OomMatcher::Class(ErrorClass::ResourceExhausted),
            OomMatcher::Text("insufficient memory"),
            OomMatcher::Text("out of memory"),
        ],
    },
    BackendDescriptor {
        id: BackendId::OpenCl,
        supports_zero_copy: false,
        supports_streams: true,
        supports_cache_clear: true,
        device_aware: true,
        oom_matchers: &[
            OomMatcher::Class(ErrorClass::AllocationFailure),
            OomMatcher::Text("CL_MEM_OBJECT_ALLOCATION_FAILURE"),
            OomMatcher::Text("CL_OUT_OF_RESOURCES"),
            OomMatcher::Text("out of memory"),
        ],
    },
];

/// Look up the descriptor for a backend.
///
/// # Errors
///
/// Returns [`BridgeError::UnknownBackend`] if the table has no entry for `id`.
pub fn describe(id: BackendId) -> Result<&'static BackendDescriptor> {
    DESCRIPTORS
        .iter()
        .find(|d| d.id == id)
        .ok_or_else(|| BridgeError::unknown_backend(id.name()))
}

/// Look up a descriptor by backend name (e.g. `"cuda"`).
///
/// # Errors
///
/// Returns [`BridgeError::UnknownBackend`] for names outside [`BackendId`].
pub fn describe_name(name: &str) -> Result<&'static BackendDescriptor> {
    describe(name.parse()?)
}

/// Iterate over every registered descriptor.
pub fn descriptors() -> impl Iterator<Item = &'static BackendDescriptor> {
    DESCRIPTORS.iter()
}
