// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! High-level API.
//!
//! [`Bridge`] bundles a backend registry, the conversion engine with its
//! stream pool, and the configured policies. It is `Send + Sync` and meant to
//! be shared by reference (or cloned) across the worker threads of a
//! pipeline.
//!
//! ## Example
//!
//! ```rust
//! use arraybridge::{BackendId, Bridge, BridgeConfig, Buffer, HostArray};
//!
//! let bridge = Bridge::new(BridgeConfig::new().with_cpu())?;
//!
//! let input = Buffer::host(HostArray::from_vec(vec![2, 2], vec![1.0f32, 2.0, 3.0, 4.0])?);
//! let tensor = bridge.convert(&input, BackendId::Candle, None)?;
//! let back = bridge.to_host(&tensor)?;
//! assert_eq!(back.to_vec::<f32>(), Some(vec![1.0, 2.0, 3.0, 4.0]));
//! # Ok::<(), arraybridge::BridgeError>(())
//! ```

use crate::backend::BackendId;
use crate::buffer::{Buffer, HostArray};
use crate::convert::ConversionEngine;
use crate::device::DeviceConfig;
use crate::dtype::DType;
use crate::error::{BackendError, BridgeError, Result};
use crate::recovery::{DEFAULT_MAX_RETRIES, MAX_RETRY_LIMIT};
use crate::registry::BackendRegistry;
use crate::rescale::RescalePolicy;
use crate::stack;
use crate::stream::{Stream, StreamPool};
use crate::traits::ValidatableConfig;
use std::sync::Arc;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Configuration for [`Bridge`].
///
/// ## Environment Variables
///
/// Read by [`BridgeConfig::from_env`] (which is also the `Default`):
///
/// - `ARRAYBRIDGE_MAX_OOM_RETRIES` - retries after the first OOM (0..=16)
/// - `ARRAYBRIDGE_ZERO_COPY` - `0`/`false` disables the zero-copy stage
/// - `ARRAYBRIDGE_RESCALE` - `stretch` or `saturate`
/// - plus the device variables of [`DeviceConfig::from_env`]
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Device selection for the Candle backend.
    pub device: DeviceConfig,
    /// Retries after the first OOM.
    pub max_oom_retries: usize,
    /// Try zero-copy exchange before the host fallback.
    pub zero_copy: bool,
    /// Float-to-integer write-back policy.
    pub rescale_policy: RescalePolicy,
    /// Log the resolved configuration at `info` on construction.
    pub verbose: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl BridgeConfig {
    /// Configuration with built-in defaults, ignoring the environment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            device: DeviceConfig::new(),
            max_oom_retries: DEFAULT_MAX_RETRIES,
            zero_copy: true,
            rescale_policy: RescalePolicy::default(),
            verbose: false,
        }
    }

    /// Built-in defaults overridden by `ARRAYBRIDGE_*` variables.
    ///
    /// Unparsable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self {
            device: DeviceConfig::from_env(),
            ..Self::new()
        };
        if let Ok(raw) = std::env::var("ARRAYBRIDGE_MAX_OOM_RETRIES") {
            match raw.trim().parse::<usize>() {
                Ok(retries) => config.max_oom_retries = retries,
                Err(_) => tracing::warn!(value = %raw, "ignoring ARRAYBRIDGE_MAX_OOM_RETRIES"),
            }
        }
        if let Ok(raw) = std::env::var("ARRAYBRIDGE_ZERO_COPY") {
            config.zero_copy = !(raw == "0" || raw.eq_ignore_ascii_case("false"));
        }
        if let Ok(raw) = std::env::var("ARRAYBRIDGE_RESCALE") {
            match raw.parse() {
                Ok(policy) => config.rescale_policy = policy,
                Err(err) => tracing::warn!(%err, "ignoring ARRAYBRIDGE_RESCALE"),
            }
        }
        config
    }

    /// Set the OOM retry budget.
    #[must_use]
    pub fn with_max_oom_retries(mut self, retries: usize) -> Self {
        self.max_oom_retries = retries;
        self
    }

    /// Enable or disable the zero-copy stage.
    #[must_use]
    pub fn with_zero_copy(mut self, enabled: bool) -> Self {
        self.zero_copy = enabled;
        self
    }

    /// Set the rescale policy.
    #[must_use]
    pub fn with_rescale_policy(mut self, policy: RescalePolicy) -> Self {
        self.rescale_policy = policy;
        self
    }

    /// Replace the device configuration.
    #[must_use]
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    /// Force the Candle backend onto the CPU.
    #[must_use]
    pub fn with_cpu(mut self) -> Self {
        self.device = self.device.with_force_cpu(true);
        self
    }

    /// Set verbose mode.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl ValidatableConfig for BridgeConfig {
    fn validate(&self) -> Result<()> {
        if self.max_oom_retries > MAX_RETRY_LIMIT {
            return Err(BridgeError::invalid_config(format!(
                "max_oom_retries must be <= {MAX_RETRY_LIMIT}, got {}",
                self.max_oom_retries
            )));
        }
        if self.device.force_cpu && self.device.require_cuda {
            return Err(BridgeError::invalid_config(
                "force_cpu and require_cuda are mutually exclusive",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// BRIDGE
// =============================================================================

/// Converts buffers between registered backends.
///
/// | Operation | Description |
/// |-----------|-------------|
/// | [`convert`](Self::convert) | move a buffer to another backend |
/// | [`convert_preserving`](Self::convert_preserving) | convert, then restore the input dtype |
/// | [`preserve_dtype`](Self::preserve_dtype) | rescale a float result into an integer dtype |
/// | [`run_scoped`](Self::run_scoped) | run work with the thread's stream and OOM retries |
/// | [`with_oom_recovery`](Self::with_oom_recovery) | OOM retries only |
/// | [`call_on`](Self::call_on) | convert, run, restore dtype |
/// | [`stack`](Self::stack) / [`unstack`](Self::unstack) | batch helpers |
#[derive(Debug, Clone)]
pub struct Bridge {
    config: BridgeConfig,
    engine: ConversionEngine,
}

impl Bridge {
    /// Bridge with the built-in host and Candle backends.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let registry = BackendRegistry::with_defaults(config.device.clone());
        Self::with_registry(config, registry)
    }

    /// Bridge over an explicit registry.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidConfig`] if `config` fails validation.
    pub fn with_registry(config: BridgeConfig, registry: BackendRegistry) -> Result<Self> {
        config.validate()?;
        let engine = ConversionEngine::new(Arc::new(registry))
            .with_zero_copy(config.zero_copy)
            .with_max_retries(config.max_oom_retries);

        if config.verbose {
            tracing::info!(
                backends = ?engine.registry().ids(),
                zero_copy = config.zero_copy,
                max_oom_retries = config.max_oom_retries,
                rescale = ?config.rescale_policy,
                "arraybridge initialized"
            );
        }
        Ok(Self { config, engine })
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Registered backend implementations.
    #[must_use]
    pub fn registry(&self) -> &BackendRegistry {
        self.engine.registry()
    }

    /// Per-thread stream pool.
    #[must_use]
    pub fn streams(&self) -> &StreamPool {
        self.engine.streams()
    }

    /// Convert `buffer` to `target`. See [`ConversionEngine::convert`].
    ///
    /// # Errors
    ///
    /// `UnsupportedConversion`, `BackendUnavailable`, `OutOfMemory` or
    /// `ConversionFailure`.
    pub fn convert(&self, buffer: &Buffer, target: BackendId, device: Option<usize>) -> Result<Buffer> {
        self.engine.convert(buffer, target, device)
    }

    /// Convert, then rescale back into the input's dtype if the target
    /// produced a float buffer for an integer input.
    ///
    /// # Errors
    ///
    /// As [`convert`](Self::convert).
    pub fn convert_preserving(
        &self,
        buffer: &Buffer,
        target: BackendId,
        device: Option<usize>,
    ) -> Result<Buffer> {
        let converted = self.convert(buffer, target, device)?;
        self.preserve_dtype(&converted, buffer.dtype())
    }

    /// Rescale a float `result` into integer `original` using the configured
    /// policy; any other pairing returns `result` unchanged.
    ///
    /// # Errors
    ///
    /// `UnsupportedConversion` if the result's backend cannot hold
    /// `original`, otherwise as [`run_scoped`](Self::run_scoped).
    pub fn preserve_dtype(&self, result: &Buffer, original: DType) -> Result<Buffer> {
        self.engine
            .preserve_dtype(result, original, self.config.rescale_policy)
    }

    /// Copy any buffer into the host bridge format.
    ///
    /// # Errors
    ///
    /// As [`convert`](Self::convert).
    pub fn to_host(&self, buffer: &Buffer) -> Result<HostArray> {
        self.engine.to_host(buffer)
    }

    /// Calling thread's stream for `backend`.
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` if the backend is not registered or its stream
    /// cannot be created.
    pub fn acquire_stream(&self, backend: BackendId) -> Result<Stream> {
        self.engine.acquire_stream(backend)
    }

    /// Run `op` with the calling thread's stream for `backend`, retrying on
    /// OOM after clearing the backend's cache.
    ///
    /// `op` is re-executed from scratch on each attempt.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` once `max_retries` is exhausted, otherwise the mapped
    /// first non-OOM error.
    pub fn run_scoped<T, F>(&self, backend: BackendId, max_retries: usize, op: F) -> Result<T>
    where
        F: FnMut(&Stream) -> std::result::Result<T, BackendError>,
    {
        self.engine.run_scoped(backend, max_retries, op)
    }

    /// Run `op` under OOM supervision for `backend`.
    ///
    /// # Errors
    ///
    /// As [`run_scoped`](Self::run_scoped).
    pub fn with_oom_recovery<T, F>(&self, backend: BackendId, max_retries: usize, op: F) -> Result<T>
    where
        F: FnMut() -> std::result::Result<T, BackendError>,
    {
        self.engine.with_oom_recovery(backend, max_retries, op)
    }

    /// Run `op` on `backend`: convert `input` there (keeping its device),
    /// run `op` with stream and OOM discipline, then restore the input dtype
    /// on the result.
    ///
    /// # Errors
    ///
    /// Any error from the three stages.
    pub fn call_on<F>(&self, input: &Buffer, backend: BackendId, mut op: F) -> Result<Buffer>
    where
        F: FnMut(&Buffer, &Stream) -> std::result::Result<Buffer, BackendError>,
    {
        let staged = self.convert(input, backend, input.device())?;
        let result = self.run_scoped(backend, self.config.max_oom_retries, |stream| {
            op(&staged, stream)
        })?;
        self.preserve_dtype(&result, input.dtype())
    }

    /// Stack buffers along a new leading axis on `target`.
    ///
    /// # Errors
    ///
    /// `EmptyBatch`, `ShapeMismatch`, `DTypeMismatch`, or a conversion error.
    pub fn stack(&self, parts: &[Buffer], target: BackendId, device: Option<usize>) -> Result<Buffer> {
        stack::stack(&self.engine, parts, target, device)
    }

    /// Split a buffer along its leading axis into buffers on `target`.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` for scalars, or a conversion error.
    pub fn unstack(&self, buffer: &Buffer, target: BackendId, device: Option<usize>) -> Result<Vec<Buffer>> {
        stack::unstack(&self.engine, buffer, target, device)
    }

    /// Summary of the bridge's setup.
    #[must_use]
    pub fn info(&self) -> BridgeInfo {
        BridgeInfo {
            version: crate::VERSION.to_string(),
            backends: self.registry().ids(),
            zero_copy: self.config.zero_copy,
            max_oom_retries: self.config.max_oom_retries,
            rescale_policy: self.config.rescale_policy,
        }
    }
}

/// Information about a [`Bridge`].
#[derive(Debug, Clone)]
pub struct BridgeInfo {
    /// Crate version
    pub version: String,
    /// Registered backends
    pub backends: Vec<BackendId>,
    /// Whether zero-copy is attempted
    pub zero_copy: bool,
    /// OOM retry budget
    pub max_oom_retries: usize,
    /// Rescale policy in effect
    pub rescale_policy: RescalePolicy,
}
