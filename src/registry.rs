// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Backend implementation registry.
//!
//! Descriptors say what a backend *can* do; the registry holds the code that
//! does it. Registration is explicit: a [`BackendRegistry`] is built once from
//! a table of `Arc<dyn Backend>` and is immutable afterwards, so lookups need
//! no locking.

use crate::backend::{describe, BackendDescriptor, BackendId};
use crate::candle_backend::CandleBackend;
use crate::device::DeviceConfig;
use crate::error::{BridgeError, Result};
use crate::host::HostBackend;
use crate::traits::Backend;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Immutable map from [`BackendId`] to its implementation.
#[derive(Clone)]
pub struct BackendRegistry {
    backends: HashMap<BackendId, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Start an empty registry.
    #[must_use]
    pub fn builder() -> BackendRegistryBuilder {
        BackendRegistryBuilder::default()
    }

    /// Registry with the built-in host and Candle backends.
    #[must_use]
    pub fn with_defaults(device: DeviceConfig) -> Self {
        Self::builder()
            .with_defaults(device)
            .build()
    }

    /// Implementation registered for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::BackendUnavailable`] if nothing is registered.
    pub fn get(&self, id: BackendId) -> Result<&Arc<dyn Backend>> {
        self.backends
            .get(&id)
            .ok_or_else(|| BridgeError::unavailable(id, "no implementation registered"))
    }

    /// Implementation and descriptor for `id`.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get) and [`describe`].
    pub fn resolve(&self, id: BackendId) -> Result<(&Arc<dyn Backend>, &'static BackendDescriptor)> {
        Ok((self.get(id)?, describe(id)?))
    }

    /// Whether an implementation is registered for `id`.
    #[must_use]
    pub fn contains(&self, id: BackendId) -> bool {
        self.backends.contains_key(&id)
    }

    /// Registered backend ids in [`BackendId::ALL`] order.
    #[must_use]
    pub fn ids(&self) -> Vec<BackendId> {
        BackendId::ALL
            .into_iter()
            .filter(|id| self.backends.contains_key(id))
            .collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults(DeviceConfig::from_env())
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.ids())
            .finish()
    }
}

/// Builder for [`BackendRegistry`].
#[derive(Default)]
pub struct BackendRegistryBuilder {
    backends: HashMap<BackendId, Arc<dyn Backend>>,
    error: Option<BridgeError>,
}

impl BackendRegistryBuilder {
    /// Register the host backend and a Candle backend using `device`.
    #[must_use]
    pub fn with_defaults(self, device: DeviceConfig) -> Self {
        self.register(BackendId::Host, Arc::new(HostBackend::new()))
            .register(BackendId::Candle, Arc::new(CandleBackend::new(device)))
    }

    /// Register `backend` under `id`, replacing any earlier registration.
    ///
    /// A mismatch between `id` and `backend.id()` is reported by
    /// [`try_build`](Self::try_build).
    #[must_use]
    pub fn register(mut self, id: BackendId, backend: Arc<dyn Backend>) -> Self {
        if backend.id() != id && self.error.is_none() {
            self.error = Some(BridgeError::invalid_config(format!(
                "backend registered as {id} reports id {}",
                backend.id()
            )));
        }
        self.backends.insert(id, backend);
        self
    }

    /// Finish the registry.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidConfig`] if any registration key did not
    /// match the implementation's id.
    pub fn try_build(self) -> Result<BackendRegistry> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(BackendRegistry {
                backends: self.backends,
            }),
        }
    }

    /// Finish the registry, dropping any mismatched registrations.
    #[must_use]
    pub fn build(self) -> BackendRegistry {
        let backends = self
            .backends
            .into_iter()
            .filter(|(id, backend)| {
                let ok = backend.id() == *id;
                if !ok {
                    tracing::warn!(backend = %id, "dropping backend registered under a foreign id");
                }
                ok
            })
            .collect();
        BackendRegistry { backends }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_register_host_and_candle() {
        let registry = BackendRegistry::with_defaults(DeviceConfig::new().with_force_cpu(true));
        assert_eq!(registry.ids(), vec![BackendId::Host, BackendId::Candle]);
        assert_eq!(registry.get(BackendId::Host).unwrap().id(), BackendId::Host);
    }

    #[test]
    fn test_missing_backend_is_unavailable() {
        let registry = BackendRegistry::builder().build();
        let err = registry.get(BackendId::Cuda).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::BackendUnavailable {
                backend: BackendId::Cuda,
                ..
            }
        ));
    }

    #[test]
    fn test_mismatched_id_is_rejected() {
        let err = BackendRegistry::builder()
            .register(BackendId::Rocm, Arc::new(HostBackend::new()))
            .try_build()
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig(_)));

        let registry = BackendRegistry::builder()
            .register(BackendId::Rocm, Arc::new(HostBackend::new()))
            .build();
        assert!(!registry.contains(BackendId::Rocm));
    }
}
