// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Per-thread execution streams.
//!
//! Device runtimes serialize every operation issued on their default stream.
//! When several worker threads drive the same device, that default stream
//! turns concurrent work into a queue. The [`StreamPool`] hands each thread
//! its own stream per backend instead:
//!
//! - created lazily on the first [`acquire`](StreamPool::acquire) from a
//!   thread for a backend, then reused for the rest of that thread's life;
//! - never handed to another thread;
//! - released when the owning thread exits (or on explicit teardown).
//!
//! Backends whose descriptor does not declare stream support get the
//! [`Stream::default_for`] sentinel, which scopes nothing.
//!
//! The pool is an explicit owned map keyed by thread id. The map's write lock
//! is only taken when a thread inserts its first slot or leaves; every later
//! acquire from that thread takes the read lock plus its own uncontended slot
//! lock.

use crate::backend::{BackendDescriptor, BackendId};
use crate::error::BackendError;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, ThreadId};

/// Backend-native stream object (e.g. a wrapped `cudaStream_t`).
pub type StreamHandle = Arc<dyn Any + Send + Sync>;

/// Execution context for one (thread, backend) pair, or the default sentinel.
///
/// Equality is identity: two `Stream` values are equal only if they refer to
/// the same pooled stream.
#[derive(Clone)]
pub struct Stream {
    backend: BackendId,
    /// 0 is reserved for the default sentinel.
    id: u64,
    owner: Option<ThreadId>,
    handle: Option<StreamHandle>,
}

impl Stream {
    /// The default (unscoped) stream of `backend`.
    #[must_use]
    pub fn default_for(backend: BackendId) -> Self {
        Self {
            backend,
            id: 0,
            owner: None,
            handle: None,
        }
    }

    /// Backend this stream belongs to.
    #[must_use]
    pub fn backend(&self) -> BackendId {
        self.backend
    }

    /// Pool-unique identifier (0 for the default sentinel).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this is the default sentinel.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.id == 0
    }

    /// Thread that owns this stream.
    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Downcast the backend-native handle.
    #[must_use]
    pub fn handle<T: Any>(&self) -> Option<&T> {
        self.handle.as_ref()?.downcast_ref::<T>()
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.backend == other.backend && self.id == other.id
    }
}

impl Eq for Stream {}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("backend", &self.backend)
            .field("id", &self.id)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Streams owned by one thread. Only that thread touches the inner map.
#[derive(Default)]
struct ThreadSlot {
    streams: Mutex<HashMap<BackendId, Stream>>,
}

struct PoolInner {
    threads: RwLock<HashMap<ThreadId, Arc<ThreadSlot>>>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn remove_thread(&self, thread: ThreadId) -> usize {
        let removed = self
            .threads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&thread);
        removed.map_or(0, |slot| {
            slot.streams
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        })
    }
}

/// Registered on each thread that owns a slot; drops the slot at thread exit.
struct ThreadExitHook {
    thread: ThreadId,
    pools: Vec<Weak<PoolInner>>,
}

impl Drop for ThreadExitHook {
    fn drop(&mut self) {
        for pool in self.pools.drain(..).filter_map(|p| p.upgrade()) {
            let released = pool.remove_thread(self.thread);
            tracing::trace!(
                target: "arraybridge::stream",
                released,
                "released streams of exiting thread"
            );
        }
    }
}

thread_local! {
    static EXIT_HOOK: RefCell<Option<ThreadExitHook>> = const { RefCell::new(None) };
}

fn register_exit_hook(pool: &Arc<PoolInner>) {
    // During thread teardown the hook may already be gone; the slot is then
    // reclaimed by `clear` or when the pool itself drops.
    let _ = EXIT_HOOK.try_with(|hook| {
        let mut hook = hook.borrow_mut();
        let pools = &mut hook
            .get_or_insert_with(|| ThreadExitHook {
                thread: thread::current().id(),
                pools: Vec::new(),
            })
            .pools;
        pools.retain(|p| p.strong_count() > 0);
        let weak = Arc::downgrade(pool);
        if !pools.iter().any(|p| p.ptr_eq(&weak)) {
            pools.push(weak);
        }
    });
}

/// Pools the calling thread's exit hook will release.
#[cfg(test)]
fn hooked_pool_count() -> usize {
    EXIT_HOOK.with(|hook| hook.borrow().as_ref().map_or(0, |h| h.pools.len()))
}

/// Pool of per-thread streams.
///
/// Cloning the pool clones a handle to the same map.
#[derive(Clone)]
pub struct StreamPool {
    inner: Arc<PoolInner>,
}

impl Default for StreamPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                threads: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Get the calling thread's stream for the backend `descriptor` governs.
    ///
    /// `create` is called at most once per (thread, backend) and only when
    /// the descriptor declares stream support.
    ///
    /// # Errors
    ///
    /// Propagates the error from `create` unchanged; nothing is cached on
    /// failure, so the next acquire retries creation.
    pub fn acquire<F>(&self, descriptor: &BackendDescriptor, create: F) -> Result<Stream, BackendError>
    where
        F: FnOnce() -> Result<StreamHandle, BackendError>,
    {
        if !descriptor.supports_streams {
            return Ok(Stream::default_for(descriptor.id));
        }

        let thread = thread::current().id();
        let slot = self.slot_for(thread);
        let mut streams = slot.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stream) = streams.get(&descriptor.id) {
            return Ok(stream.clone());
        }

        let handle = create()?;
        let stream = Stream {
            backend: descriptor.id,
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            owner: Some(thread),
            handle: Some(handle),
        };
        tracing::debug!(
            target: "arraybridge::stream",
            backend = %descriptor.id,
            stream_id = stream.id,
            ?thread,
            "created per-thread stream"
        );
        streams.insert(descriptor.id, stream.clone());
        Ok(stream)
    }

    fn slot_for(&self, thread: ThreadId) -> Arc<ThreadSlot> {
        if let Some(slot) = self
            .inner
            .threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&thread)
        {
            return Arc::clone(slot);
        }

        let mut threads = self
            .inner
            .threads
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = threads.entry(thread).or_insert_with(|| {
            register_exit_hook(&self.inner);
            Arc::new(ThreadSlot::default())
        });
        Arc::clone(slot)
    }

    /// Release every stream owned by the calling thread.
    ///
    /// Returns the number of streams released.
    pub fn release_current_thread(&self) -> usize {
        self.inner.remove_thread(thread::current().id())
    }

    /// Release every stream of every thread.
    pub fn clear(&self) {
        self.inner
            .threads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of threads currently holding streams.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.inner
            .threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of live streams across all threads.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.inner
            .threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|slot| {
                slot.streams
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len()
            })
            .sum()
    }
}

impl fmt::Debug for StreamPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPool")
            .field("threads", &self.thread_count())
            .finish()
    }
}
