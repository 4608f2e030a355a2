// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Out-of-memory recovery.
//!
//! Device backends signal OOM in different ways: a dedicated error class on
//! some, only a message string on others. The supervisor runs an operation,
//! classifies each failure with the descriptor of the backend that raised it
//! (falling back to the other candidates), and on an OOM match clears that
//! backend's allocator cache and runs the
//! operation again from scratch. Non-OOM failures are returned on the first
//! attempt. The final OOM is returned unchanged along with the attempt count.

use crate::backend::{BackendDescriptor, BackendId};
use crate::error::{BackendError, BridgeError, ErrorClass};
use crate::traits::Backend;

/// Retries after the first attempt when none are configured.
pub const DEFAULT_MAX_RETRIES: usize = 2;

/// Upper bound accepted for the retry budget.
pub const MAX_RETRY_LIMIT: usize = 16;

/// Diagnostic record of one attempt. Logged, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionAttempt {
    /// Backend the data comes from.
    pub source: BackendId,
    /// Backend the data goes to.
    pub target: BackendId,
    /// 0 for the first attempt.
    pub retry: usize,
}

/// A backend error together with the backend that raised it.
#[derive(Debug, Clone)]
pub struct Fault {
    /// Backend whose operation failed.
    pub backend: BackendId,
    /// The error as raised.
    pub error: BackendError,
}

impl Fault {
    /// Attribute `error` to `backend`.
    pub fn new(backend: BackendId, error: BackendError) -> Self {
        Self { backend, error }
    }
}

/// Backend consulted when classifying a failure.
#[derive(Clone, Copy)]
pub struct OomCandidate<'a> {
    /// Implementation whose cache is cleared on a match.
    pub backend: &'a dyn Backend,
    /// Descriptor whose matchers classify the error.
    pub descriptor: &'static BackendDescriptor,
}

impl<'a> OomCandidate<'a> {
    /// Pair an implementation with its descriptor.
    pub fn new(backend: &'a dyn Backend, descriptor: &'static BackendDescriptor) -> Self {
        Self { backend, descriptor }
    }

    fn clear_cache(&self) {
        if self.descriptor.supports_cache_clear {
            self.backend.clear_cache();
            tracing::debug!(
                target: "arraybridge::oom",
                backend = %self.descriptor.id,
                "cleared allocator cache"
            );
        }
    }
}

/// Terminal failure of a supervised operation.
#[derive(Debug, Clone)]
pub struct RecoveryFailure {
    /// Last failure observed.
    pub fault: Fault,
    /// Attempts made, including the first.
    pub attempts: usize,
    /// Backend whose descriptor classified the failure as OOM, if any.
    pub oom_backend: Option<BackendId>,
}

impl RecoveryFailure {
    /// A failure that happened outside the retry loop.
    pub fn once(fault: Fault) -> Self {
        Self {
            fault,
            attempts: 1,
            oom_backend: None,
        }
    }

    /// Map onto the public error for an operation from `source` to `target`.
    #[must_use]
    pub fn into_bridge_error(self, source: BackendId, target: BackendId) -> BridgeError {
        let Fault { backend, error } = self.fault;
        if let Some(oom_backend) = self.oom_backend {
            return BridgeError::OutOfMemory {
                backend: oom_backend,
                source_backend: source,
                target,
                attempts: self.attempts,
                error,
            };
        }
        match error.class {
            ErrorClass::Unsupported => BridgeError::unsupported(source, target, error.message),
            ErrorClass::Unavailable => BridgeError::unavailable(backend, error.message),
            _ => BridgeError::ConversionFailure {
                source_backend: source,
                target,
                backend,
                error,
            },
        }
    }
}

/// Run `op` under OOM supervision.
///
/// A failure is classified by the descriptor of the backend that raised it
/// first, then by the remaining `candidates` in order. The backend whose
/// descriptor matched has its cache cleared before the next attempt.
/// `max_retries` is clamped to [`MAX_RETRY_LIMIT`], so at most
/// `max_retries + 1` attempts are made.
///
/// # Errors
///
/// Returns the first non-OOM failure, or the last OOM once retries are
/// exhausted.
pub fn run_with_recovery<T, F>(
    candidates: &[OomCandidate<'_>],
    source: BackendId,
    target: BackendId,
    max_retries: usize,
    mut op: F,
) -> Result<T, RecoveryFailure>
where
    F: FnMut(&ConversionAttempt) -> Result<T, Fault>,
{
    let max_retries = max_retries.min(MAX_RETRY_LIMIT);
    let mut retry = 0;
    loop {
        let attempt = ConversionAttempt {
            source,
            target,
            retry,
        };
        tracing::debug!(
            target: "arraybridge::oom",
            source = %attempt.source,
            target = %attempt.target,
            retry = attempt.retry,
            "attempt"
        );

        let fault = match op(&attempt) {
            Ok(value) => {
                if retry > 0 {
                    tracing::info!(
                        target: "arraybridge::oom",
                        %source,
                        %target,
                        attempts = retry + 1,
                        "recovered from out-of-memory"
                    );
                }
                return Ok(value);
            }
            Err(fault) => fault,
        };

        let Some(candidate) = classify(candidates, &fault) else {
            return Err(RecoveryFailure {
                fault,
                attempts: retry + 1,
                oom_backend: None,
            });
        };

        let oom_backend = candidate.descriptor.id;
        if retry >= max_retries {
            tracing::error!(
                target: "arraybridge::oom",
                backend = %oom_backend,
                %source,
                %target,
                attempts = retry + 1,
                error = %fault.error,
                "out of memory, retries exhausted"
            );
            return Err(RecoveryFailure {
                fault,
                attempts: retry + 1,
                oom_backend: Some(oom_backend),
            });
        }

        tracing::warn!(
            target: "arraybridge::oom",
            backend = %oom_backend,
            %source,
            %target,
            retry = retry + 1,
            max_retries,
            error = %fault.error,
            "out of memory, clearing cache and retrying"
        );
        candidate.clear_cache();
        retry += 1;
    }
}

/// Candidate that owns an OOM `fault`: the raising backend if its descriptor
/// matches, otherwise the first other candidate that does.
fn classify<'c, 'a>(candidates: &'c [OomCandidate<'a>], fault: &Fault) -> Option<&'c OomCandidate<'a>> {
    let (raising, others): (Vec<&'c OomCandidate<'a>>, Vec<_>) = candidates
        .iter()
        .partition(|c| c.descriptor.id == fault.backend);
    raising
        .into_iter()
        .chain(others)
        .find(|c| c.descriptor.is_oom(&fault.error))
}
