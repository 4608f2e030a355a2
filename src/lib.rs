// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! # arraybridge
//!
//! Move in-memory arrays between CPU and GPU array backends without
//! corrupting data, leaking device memory, or bringing down a long-running
//! multi-threaded pipeline when a device runs out of memory mid-conversion.
//!
//! ## Design
//!
//! **Descriptor-driven**: every backend is described once in a static table
//! (zero-copy, streams, cache clearing, device awareness, OOM signatures).
//! Conversions are dispatched from those descriptors instead of per-pair code.
//!
//! **Zero-copy first**: when both sides can share memory the engine exchanges
//! a [`SharedTensor`]; otherwise it copies through the host bridge format
//! ([`HostArray`]).
//!
//! **OOM is recoverable**: failures are classified per backend, caches are
//! cleared, and the whole operation is retried within a bounded budget.
//!
//! ## Modules
//!
//! - [`backend`] - backend ids and the descriptor table
//! - [`buffer`] - buffer handles and the host bridge format
//! - [`convert`] - the conversion engine
//! - [`recovery`] - OOM supervisor
//! - [`stream`] - per-thread stream pool
//! - [`rescale`] - float-to-integer write-back
//! - [`facade`] - [`Bridge`] and [`BridgeConfig`]
//!
//! ## Quick Start
//!
//! ```rust
//! use arraybridge::{BackendId, Bridge, BridgeConfig, Buffer, HostArray, Result};
//!
//! fn main() -> Result<()> {
//!     let bridge = Bridge::new(BridgeConfig::from_env().with_cpu())?;
//!
//!     let image = Buffer::host(HostArray::from_vec(vec![2, 2], vec![0u16, 100, 200, 65535])?);
//!     let batch = bridge.stack(&[image.clone(), image], BackendId::Candle, None);
//!     // candle has no u16 storage
//!     assert!(batch.is_err());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `cuda` - Enable CUDA placement for the Candle backend
//!
//! ## Custom backends
//!
//! Implement [`Backend`] and register it:
//!
//! ```rust,ignore
//! let registry = BackendRegistry::builder()
//!     .with_defaults(DeviceConfig::from_env())
//!     .register(BackendId::Cuda, Arc::new(MyCudaBackend::new()?))
//!     .try_build()?;
//! let bridge = Bridge::with_registry(BridgeConfig::from_env(), registry)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod buffer;
pub mod candle_backend;
pub mod convert;
pub mod device;
pub mod dtype;
pub mod error;
pub mod exchange;
pub mod facade;
pub mod host;
pub mod logging;
pub mod memory;
pub mod recovery;
pub mod registry;
pub mod rescale;
pub mod stack;
pub mod stream;
pub mod traits;

// Re-exports for convenience
pub use backend::{describe, describe_name, descriptors, BackendDescriptor, BackendId, OomMatcher};
pub use buffer::{Buffer, HostArray, HostData, HostElement};
pub use candle_backend::CandleBackend;
pub use convert::ConversionEngine;
pub use device::{get_device, warn_if_cpu, DeviceConfig};
pub use dtype::{bytes_per_element, DType, DtypeKind};
pub use error::{BackendError, BridgeError, ErrorClass, Result};
pub use exchange::{DeviceKind, DeviceLocation, SharedTensor};
pub use facade::{Bridge, BridgeConfig, BridgeInfo};
pub use host::HostBackend;
pub use logging::{init_logging, LogConfig, LogLevel};
pub use memory::{estimate_tensor_bytes, MemoryTracker};
pub use recovery::{ConversionAttempt, DEFAULT_MAX_RETRIES, MAX_RETRY_LIMIT};
pub use registry::{BackendRegistry, BackendRegistryBuilder};
pub use rescale::RescalePolicy;
pub use stream::{Stream, StreamHandle, StreamPool};
pub use traits::{Backend, ValidatableConfig};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
