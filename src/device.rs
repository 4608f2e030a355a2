// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! CUDA-first device selection for the Candle backend.
//!
//! GPU is always preferred. Falling back to CPU emits a one-time warning so
//! users notice they are not getting device execution, unless the
//! configuration requires CUDA, in which case the fallback becomes a
//! [`BridgeError::BackendUnavailable`].
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `ARRAYBRIDGE_FORCE_CPU` | `1`/`true`: place candle buffers in host memory |
//! | `ARRAYBRIDGE_CUDA_DEVICE` | default ordinal for conversions without a device index |
//! | `ARRAYBRIDGE_REQUIRE_CUDA` | `1`/`true`: no CPU fallback |
//!
//! ```rust
//! use arraybridge::{get_device, DeviceConfig};
//!
//! let cpu_only = DeviceConfig::new().with_force_cpu(true);
//! assert!(get_device(&cpu_only, Some(2))?.is_cpu());
//! # Ok::<(), arraybridge::BridgeError>(())
//! ```

use crate::backend::BackendId;
use crate::error::{BridgeError, Result};
use candle_core::Device;
use std::sync::Once;

/// Where candle buffers are placed.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    /// Preferred CUDA device ordinal when none is requested explicitly.
    pub cuda_device: usize,
    /// Never touch CUDA.
    pub force_cpu: bool,
    /// Fail instead of falling back to CPU.
    pub require_cuda: bool,
}

fn env_flag(var: &str) -> bool {
    std::env::var(var).is_ok_and(|val| val == "1" || val.eq_ignore_ascii_case("true"))
}

impl DeviceConfig {
    /// Ordinal 0, CUDA preferred, CPU fallback allowed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default ordinal.
    #[must_use]
    pub fn with_cuda_device(mut self, ordinal: usize) -> Self {
        self.cuda_device = ordinal;
        self
    }

    /// See [`force_cpu`](Self::force_cpu).
    #[must_use]
    pub fn with_force_cpu(mut self, force: bool) -> Self {
        self.force_cpu = force;
        self
    }

    /// Refuse the CPU fallback.
    #[must_use]
    pub fn with_require_cuda(mut self, require: bool) -> Self {
        self.require_cuda = require;
        self
    }

    /// Build configuration from `ARRAYBRIDGE_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self {
            force_cpu: env_flag("ARRAYBRIDGE_FORCE_CPU"),
            require_cuda: env_flag("ARRAYBRIDGE_REQUIRE_CUDA"),
            ..Self::default()
        };
        if let Some(ordinal) = std::env::var("ARRAYBRIDGE_CUDA_DEVICE")
            .ok()
            .and_then(|val| val.trim().parse::<usize>().ok())
        {
            config.cuda_device = ordinal;
        }
        config
    }
}

/// Get a Candle device according to configuration, preferring CUDA.
///
/// `requested` overrides the configured ordinal (it is the device index a
/// conversion asked for).
///
/// # Errors
///
/// Returns [`BridgeError::BackendUnavailable`] when CUDA is required but not
/// usable, or when CPU is both forced and CUDA required.
pub fn get_device(config: &DeviceConfig, requested: Option<usize>) -> Result<Device> {
    if config.force_cpu {
        if config.require_cuda {
            return Err(BridgeError::unavailable(
                BackendId::Candle,
                "configuration both forces CPU and requires CUDA",
            ));
        }
        tracing::debug!("candle: CPU device forced via configuration");
        return Ok(Device::Cpu);
    }

    let ordinal = requested.unwrap_or(config.cuda_device);
    match Device::cuda_if_available(ordinal) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::debug!(ordinal, "candle: using CUDA device");
            Ok(device)
        }
        Ok(Device::Cpu) if !config.require_cuda => {
            warn_if_cpu(&Device::Cpu);
            Ok(Device::Cpu)
        }
        Ok(Device::Cpu) => Err(BridgeError::unavailable(
            BackendId::Candle,
            format!("CUDA device {ordinal} required but not available"),
        )),
        Ok(other) => Ok(other),
        Err(err) if config.require_cuda => Err(BridgeError::unavailable(
            BackendId::Candle,
            format!("CUDA device {ordinal}: {err}"),
        )),
        Err(err) => {
            tracing::debug!(ordinal, %err, "candle: CUDA initialization failed");
            warn_if_cpu(&Device::Cpu);
            Ok(Device::Cpu)
        }
    }
}

/// Warn once per process when `device` is the CPU.
pub fn warn_if_cpu(device: &Device) {
    static CPU_NOTICE: Once = Once::new();

    if device.is_cpu() {
        CPU_NOTICE.call_once(|| {
            tracing::warn!(
                "candle: CPU device in use; buffers converted to the candle backend \
                 stay in host memory. Set ARRAYBRIDGE_FORCE_CPU=1 to make this explicit."
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_prefer_cuda_zero() {
        let config = DeviceConfig::new();
        assert_eq!(
            (config.cuda_device, config.force_cpu, config.require_cuda),
            (0, false, false)
        );
        let tuned = config.with_cuda_device(3).with_require_cuda(true);
        assert_eq!(tuned.cuda_device, 3);
        assert!(tuned.require_cuda);
    }

    #[test]
    fn test_forced_cpu_ignores_requested_ordinal() {
        let config = DeviceConfig::new().with_force_cpu(true);
        assert!(get_device(&config, Some(7)).unwrap().is_cpu());
        assert!(get_device(&config, None).unwrap().is_cpu());
    }

    #[test]
    fn test_contradictory_config_is_unavailable() {
        let config = DeviceConfig::new()
            .with_force_cpu(true)
            .with_require_cuda(true);
        let err = get_device(&config, None).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::BackendUnavailable {
                backend: BackendId::Candle,
                ..
            }
        ));
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_require_cuda_without_cuda_support() {
        let config = DeviceConfig::new().with_require_cuda(true);
        assert!(get_device(&config, None).is_err());
    }
}
