// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Traits implemented at the crate's seams.
//!
//! - [`Backend`] - one array runtime plugged into the bridge
//! - [`ValidatableConfig`] - configuration validation interface
//!
//! ## Implementing a backend
//!
//! A backend needs only two operations to take part in every conversion:
//! [`to_host`](Backend::to_host) and [`from_host`](Backend::from_host). The
//! host bridge format makes every pair of backends reachable through those
//! two hops. Everything else is optional:
//!
//! 1. **Zero-copy**: implement [`export_shared`](Backend::export_shared) /
//!    [`import_shared`](Backend::import_shared) and set
//!    `supports_zero_copy` in the descriptor.
//! 2. **Streams**: implement [`create_stream`](Backend::create_stream); the
//!    pool calls it once per thread.
//! 3. **OOM recovery**: implement [`clear_cache`](Backend::clear_cache) to
//!    release allocator caches between retries.
//! 4. **Errors**: raise [`BackendError`] with the most precise
//!    [`ErrorClass`](crate::ErrorClass) available; generic errors with an
//!    informative message are matched by the descriptor's text patterns.

use crate::backend::BackendId;
use crate::buffer::{Buffer, HostArray};
use crate::dtype::DType;
use crate::error::{BackendError, Result};
use crate::exchange::SharedTensor;
use crate::rescale::{preserve_host_dtype, RescalePolicy};
use crate::stream::{Stream, StreamHandle};
use std::fmt;

/// One array runtime.
///
/// Every method that touches backend memory receives the calling thread's
/// [`Stream`] for this backend explicitly. Operations must not leave a
/// partially written result behind when they fail: the OOM supervisor
/// re-executes them from scratch.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Identity of this backend; must match the registration key.
    fn id(&self) -> BackendId;

    /// Whether buffers of `dtype` can be represented at all.
    fn supports_dtype(&self, dtype: DType) -> bool {
        let _ = dtype;
        true
    }

    /// Copy a buffer of this backend into the host bridge format.
    ///
    /// # Errors
    ///
    /// Backend-specific failures, including OOM on a staging allocation.
    fn to_host(&self, buffer: &Buffer, stream: &Stream) -> std::result::Result<HostArray, BackendError>;

    /// Create a buffer of this backend from the host bridge format.
    ///
    /// `device` is honoured by device-aware backends.
    ///
    /// # Errors
    ///
    /// Backend-specific failures, including OOM.
    fn from_host(
        &self,
        array: &HostArray,
        device: Option<usize>,
        stream: &Stream,
    ) -> std::result::Result<Buffer, BackendError>;

    /// Describe a buffer as a shared view without copying.
    ///
    /// # Errors
    ///
    /// The default refuses with [`ErrorClass::Unsupported`](crate::ErrorClass::Unsupported).
    fn export_shared(
        &self,
        buffer: &Buffer,
        stream: &Stream,
    ) -> std::result::Result<SharedTensor, BackendError> {
        let _ = (buffer, stream);
        Err(BackendError::unsupported(format!(
            "{} cannot export shared views",
            self.id()
        )))
    }

    /// Adopt a shared view without copying.
    ///
    /// # Errors
    ///
    /// The default refuses with [`ErrorClass::Unsupported`](crate::ErrorClass::Unsupported).
    fn import_shared(
        &self,
        view: SharedTensor,
        device: Option<usize>,
        stream: &Stream,
    ) -> std::result::Result<Buffer, BackendError> {
        let _ = (view, device, stream);
        Err(BackendError::unsupported(format!(
            "{} cannot import shared views",
            self.id()
        )))
    }

    /// Create a fresh execution stream for the calling thread.
    ///
    /// # Errors
    ///
    /// The default refuses; only called when the descriptor declares stream
    /// support.
    fn create_stream(&self) -> std::result::Result<StreamHandle, BackendError> {
        Err(BackendError::unsupported(format!(
            "{} has no explicit streams",
            self.id()
        )))
    }

    /// Release allocator caches. Must be idempotent.
    fn clear_cache(&self) {}

    /// Rescale a float buffer into integer `dtype` using `policy`.
    ///
    /// The default applies the law on the host bridge and copies the result
    /// back; backends with native clamp/cast primitives may override it.
    ///
    /// # Errors
    ///
    /// Failures from the host round trip.
    fn rescale(
        &self,
        buffer: &Buffer,
        dtype: DType,
        policy: RescalePolicy,
        stream: &Stream,
    ) -> std::result::Result<Buffer, BackendError> {
        rescale_via_host(self, buffer, dtype, policy, stream)
    }
}

/// Apply the rescale law through the host bridge format.
///
/// This is the default [`Backend::rescale`]; overriding backends can fall back
/// to it for inputs their native primitive does not handle.
///
/// # Errors
///
/// Failures from the host round trip.
pub fn rescale_via_host<B: Backend + ?Sized>(
    backend: &B,
    buffer: &Buffer,
    dtype: DType,
    policy: RescalePolicy,
    stream: &Stream,
) -> std::result::Result<Buffer, BackendError> {
    let host = backend.to_host(buffer, stream)?;
    let scaled = preserve_host_dtype(&host, dtype, policy);
    backend.from_host(&scaled, buffer.device(), stream)
}

/// Configuration validation trait.
///
/// # Example
///
/// ```rust
/// use arraybridge::{BridgeError, Result, ValidatableConfig};
///
/// #[derive(Clone)]
/// struct TileConfig {
///     tile: usize,
/// }
///
/// impl ValidatableConfig for TileConfig {
///     fn validate(&self) -> Result<()> {
///         if self.tile == 0 {
///             return Err(BridgeError::invalid_config("tile must be > 0"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait ValidatableConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::InvalidConfig` if validation fails.
    fn validate(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BridgeError, ErrorClass};

    #[derive(Clone)]
    struct TestConfig {
        value: i32,
    }

    impl ValidatableConfig for TestConfig {
        fn validate(&self) -> Result<()> {
            if self.value < 0 {
                return Err(BridgeError::invalid_config("value must be non-negative"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_validatable_config() {
        assert!(TestConfig { value: 10 }.validate().is_ok());
        assert!(TestConfig { value: -1 }.validate().is_err());
    }

    #[derive(Debug)]
    struct HostOnly;

    impl Backend for HostOnly {
        fn id(&self) -> BackendId {
            BackendId::Host
        }

        fn to_host(&self, buffer: &Buffer, _: &Stream) -> std::result::Result<HostArray, BackendError> {
            buffer
                .storage::<HostArray>()
                .cloned()
                .ok_or_else(|| BackendError::runtime("not a host buffer"))
        }

        fn from_host(
            &self,
            array: &HostArray,
            _: Option<usize>,
            _: &Stream,
        ) -> std::result::Result<Buffer, BackendError> {
            Ok(Buffer::host(array.clone()))
        }
    }

    #[test]
    fn test_default_methods() {
        let backend = HostOnly;
        let stream = Stream::default_for(BackendId::Host);
        assert_eq!(
            backend.create_stream().unwrap_err().class,
            ErrorClass::Unsupported
        );

        let buffer = Buffer::host(HostArray::from_vec(vec![2], vec![0.0f64, 1.0]).unwrap());
        assert!(backend.export_shared(&buffer, &stream).is_err());

        let rescaled = backend.rescale(&buffer, DType::U8, RescalePolicy::Stretch, &stream).unwrap();
        assert_eq!(rescaled.dtype(), DType::U8);
        let host = backend.to_host(&rescaled, &stream).unwrap();
        assert_eq!(host.to_vec::<u8>().unwrap(), vec![0, 255]);
    }
}
