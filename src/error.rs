// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Error types for backend conversion and recovery.
//!
//! Two layers of errors exist:
//!
//! - [`BackendError`] is what a backend implementation raises. It is a tagged
//!   variant (an [`ErrorClass`] plus the backend's own message) so that the
//!   descriptor table can classify it structurally or by text.
//! - [`BridgeError`] is what callers of this crate see. It always carries the
//!   backends involved and, for OOM, the number of attempts made.
//!
//! ## Error Hierarchy
//!
//! ```text
//! BridgeError
//! ├── UnknownBackend        - Backend name has no descriptor
//! ├── UnsupportedConversion - No viable path between two backends
//! ├── BackendUnavailable    - Backend runtime/device cannot be initialized
//! ├── OutOfMemory           - OOM that survived every retry
//! ├── ConversionFailure     - Any other backend error during data movement
//! ├── InvalidConfig         - Configuration validation failures
//! ├── ShapeMismatch         - Buffer shape incompatibilities
//! ├── DTypeMismatch         - Buffers with different element types
//! └── EmptyBatch            - Stacking an empty sequence
//! ```

use crate::backend::BackendId;
use crate::dtype::DType;
use std::fmt;
use thiserror::Error;

/// Result type alias for arraybridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Structural category of a backend-raised error.
///
/// Backends that raise a precise typed error map it to the matching class;
/// backends that only surface generic errors use [`ErrorClass::Runtime`] and
/// rely on text matchers in their descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Typed out-of-memory error (e.g. a CUDA allocator failure).
    OutOfMemory,
    /// Resource exhaustion reported by a runtime scheduler.
    ResourceExhausted,
    /// Device-side buffer allocation failure (OpenCL style).
    AllocationFailure,
    /// The backend cannot perform the requested operation or layout.
    Unsupported,
    /// The backend runtime or device could not be initialized.
    Unavailable,
    /// Generic runtime failure.
    Runtime,
}

impl ErrorClass {
    /// Short name used in messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::OutOfMemory => "out_of_memory",
            Self::ResourceExhausted => "resource_exhausted",
            Self::AllocationFailure => "allocation_failure",
            Self::Unsupported => "unsupported",
            Self::Unavailable => "unavailable",
            Self::Runtime => "runtime",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error raised by a backend implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct BackendError {
    /// Structural category.
    pub class: ErrorClass,
    /// Backend-provided message, matched case-insensitively by descriptors.
    pub message: String,
}

impl BackendError {
    /// Create an error with an explicit class.
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Create a typed out-of-memory error.
    pub fn oom(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::OutOfMemory, message)
    }

    /// Create a generic runtime error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Runtime, message)
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unsupported, message)
    }

    /// Create a runtime-unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unavailable, message)
    }
}

impl From<candle_core::Error> for BackendError {
    fn from(err: candle_core::Error) -> Self {
        match err {
            candle_core::Error::UnsupportedDTypeForOp(..) => Self::unsupported(err.to_string()),
            // Candle surfaces CUDA allocation failures as generic errors; the
            // descriptor's text matchers decide whether this is an OOM.
            other => Self::runtime(other.to_string()),
        }
    }
}

/// Errors surfaced to callers of the bridge.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    /// Backend name has no descriptor.
    #[error("unknown backend: {name}")]
    UnknownBackend {
        /// Name that failed to resolve.
        name: String,
    },

    /// No zero-copy or fallback path exists for the pair.
    #[error("unsupported conversion {source_backend} -> {target}: {reason}")]
    UnsupportedConversion {
        /// Backend the buffer lives on.
        source_backend: BackendId,
        /// Requested backend.
        target: BackendId,
        /// Why the path is not viable.
        reason: String,
    },

    /// Backend runtime or device cannot be initialized.
    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable {
        /// Backend that failed to initialize.
        backend: BackendId,
        /// Description of the failure.
        reason: String,
    },

    /// Out of memory after the retry budget was exhausted.
    #[error(
        "out of memory on {backend} during {source_backend} -> {target} after {attempts} attempt(s): {error}"
    )]
    OutOfMemory {
        /// Backend whose descriptor classified the error.
        backend: BackendId,
        /// Source backend of the operation.
        source_backend: BackendId,
        /// Target backend of the operation.
        target: BackendId,
        /// Total attempts made, including the first.
        attempts: usize,
        /// The final OOM error, unchanged.
        error: BackendError,
    },

    /// Any other backend error during data movement.
    #[error("conversion {source_backend} -> {target} failed on {backend}: {error}")]
    ConversionFailure {
        /// Source backend of the operation.
        source_backend: BackendId,
        /// Target backend of the operation.
        target: BackendId,
        /// Backend the error is attributed to.
        backend: BackendId,
        /// The original error, unchanged.
        error: BackendError,
    },

    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Buffer shape mismatch.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape received.
        actual: Vec<usize>,
    },

    /// Buffers with different element types where one was required.
    #[error("dtype mismatch: expected {expected}, got {actual}")]
    DTypeMismatch {
        /// Expected dtype.
        expected: DType,
        /// Actual dtype received.
        actual: DType,
    },

    /// Stacking requires at least one buffer.
    #[error("cannot stack an empty sequence of buffers")]
    EmptyBatch,
}

impl BridgeError {
    /// Create an unknown backend error.
    pub fn unknown_backend(name: impl Into<String>) -> Self {
        Self::UnknownBackend { name: name.into() }
    }

    /// Create an unsupported conversion error.
    pub fn unsupported(source: BackendId, target: BackendId, reason: impl Into<String>) -> Self {
        Self::UnsupportedConversion {
            source_backend: source,
            target,
            reason: reason.into(),
        }
    }

    /// Create a backend unavailable error.
    pub fn unavailable(backend: BackendId, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend,
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a shape mismatch error.
    pub fn shape_mismatch(expected: impl Into<Vec<usize>>, actual: impl Into<Vec<usize>>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether this error is an exhausted out-of-memory failure.
    #[must_use]
    pub fn is_oom(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Number of attempts recorded on an OOM error.
    #[must_use]
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Self::OutOfMemory { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// The underlying backend error, if the failure came from a backend.
    #[must_use]
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Self::OutOfMemory { error, .. } | Self::ConversionFailure { error, .. } => Some(error),
            _ => None,
        }
    }
}
