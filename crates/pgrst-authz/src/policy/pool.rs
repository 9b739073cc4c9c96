//! Bounded pool of reusable execution contexts.
//!
//! Creating a script runtime is expensive compared to running a short policy
//! function, so the script backend keeps a fixed number of runtimes and
//! leases them out per request.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ ExecutionPool<T>                             │
//! │   ├── permits: Semaphore(size)               │
//! │   ├── slots:   Mutex<Slots<T>>               │
//! │   └── factory: Fn() -> T                     │
//! └──────────────────────────────────────────────┘
//!            │ acquire().await
//!            ▼
//! ┌──────────────────────────────────────────────┐
//! │ Lease<T>                                     │
//! │   1. Permit taken (waits if all leased)      │
//! │   2. Context popped from idle                │
//! │   3. Used through Deref/DerefMut             │
//! │   4. Drop: recycle if worn out, push back    │
//! │   5. Permit released                         │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Idle contexts and the count of leased ones change under the same lock, so
//! every [`PoolStats`] snapshot satisfies `available + leased == size`.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The factory failed to create a context.
    #[error("Failed to create execution context: {0}")]
    Create(String),

    /// The pool has been closed.
    #[error("Execution pool is closed")]
    Closed,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Fixed number of contexts.
    pub size: usize,
    /// Contexts currently idle.
    pub available: usize,
    /// Contexts currently leased.
    pub leased: usize,
    /// Contexts created over the pool's lifetime, replacements included.
    pub created: u64,
    /// Contexts replaced after reaching the use threshold.
    pub retired: u64,
    /// Successful acquisitions.
    pub acquisitions: u64,
}

type Factory<T> = Box<dyn Fn() -> Result<T, PoolError> + Send + Sync>;

struct Pooled<T> {
    value: T,
    uses: u32,
}

struct Slots<T> {
    idle: Vec<Pooled<T>>,
    leased: usize,
}

/// A fixed-size pool of execution contexts.
pub struct ExecutionPool<T> {
    size: usize,
    max_uses: u32,
    permits: Arc<Semaphore>,
    slots: Mutex<Slots<T>>,
    factory: Factory<T>,
    created: AtomicU64,
    retired: AtomicU64,
    acquisitions: AtomicU64,
}

impl<T: Send + 'static> ExecutionPool<T> {
    /// Create a pool and eagerly build all `size` contexts.
    ///
    /// A context is replaced once it has served `max_uses` leases.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Create` if any context fails to build.
    pub fn new<F>(size: usize, max_uses: u32, factory: F) -> Result<Arc<Self>, PoolError>
    where
        F: Fn() -> Result<T, PoolError> + Send + Sync + 'static,
    {
        let size = size.max(1);
        let mut idle = Vec::with_capacity(size);
        for _ in 0..size {
            idle.push(Pooled {
                value: factory()?,
                uses: 0,
            });
        }

        tracing::debug!(size, max_uses, "Execution pool created");

        Ok(Arc::new(Self {
            size,
            max_uses: max_uses.max(1),
            permits: Arc::new(Semaphore::new(size)),
            slots: Mutex::new(Slots { idle, leased: 0 }),
            factory: Box::new(factory),
            created: AtomicU64::new(size as u64),
            retired: AtomicU64::new(0),
            acquisitions: AtomicU64::new(0),
        }))
    }

    /// Lease a context, waiting until one is available.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Closed` if the pool was closed, or
    /// `PoolError::Create` if a missing context could not be rebuilt.
    pub async fn acquire(self: &Arc<Self>) -> Result<Lease<T>, PoolError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        self.lease(permit)
    }

    /// Lease a context without waiting.
    ///
    /// Returns `Ok(None)` when every context is leased.
    ///
    /// # Errors
    ///
    /// Same as [`acquire`](Self::acquire).
    pub fn try_acquire(self: &Arc<Self>) -> Result<Option<Lease<T>>, PoolError> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => self.lease(permit).map(Some),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(PoolError::Closed),
        }
    }

    fn lease(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Result<Lease<T>, PoolError> {
        let popped = {
            let mut slots = self.lock_slots();
            slots.leased += 1;
            slots.idle.pop()
        };
        let mut entry = match popped {
            Some(entry) => entry,
            // Holding a permit guarantees an idle context unless a lease was
            // leaked through a panic; rebuild to keep the pool at full size.
            None => match (self.factory)() {
                Ok(value) => {
                    self.created.fetch_add(1, Ordering::Relaxed);
                    Pooled { value, uses: 0 }
                }
                Err(e) => {
                    self.lock_slots().leased -= 1;
                    return Err(e);
                }
            },
        };
        entry.uses += 1;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);

        Ok(Lease {
            entry: Some(entry),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    fn give_back(&self, mut entry: Pooled<T>) {
        if entry.uses >= self.max_uses {
            match (self.factory)() {
                Ok(value) => {
                    entry = Pooled { value, uses: 0 };
                    self.created.fetch_add(1, Ordering::Relaxed);
                    self.retired.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(max_uses = self.max_uses, "Recycled execution context");
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Failed to recycle execution context, keeping the old one"
                    );
                }
            }
        }
        let mut slots = self.lock_slots();
        slots.idle.push(entry);
        slots.leased = slots.leased.saturating_sub(1);
    }

    /// Stop handing out leases. Outstanding leases are unaffected.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let slots = self.lock_slots();
        PoolStats {
            size: self.size,
            available: slots.idle.len(),
            leased: slots.leased,
            created: self.created.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots<T>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Execution pool mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// An exclusively leased context. Returned to the pool on drop.
pub struct Lease<T: Send + 'static> {
    entry: Option<Pooled<T>>,
    pool: Arc<ExecutionPool<T>>,
    // Released after `Drop::drop` has pushed the context back.
    _permit: OwnedSemaphorePermit,
}

impl<T: Send + 'static> Lease<T> {
    /// Number of leases this context has served, this one included.
    #[must_use]
    pub fn use_count(&self) -> u32 {
        self.entry.as_ref().map_or(0, |entry| entry.uses)
    }

    /// Return the context to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl<T: Send + 'static> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.entry {
            Some(entry) => &entry.value,
            None => unreachable!("lease accessed after release"),
        }
    }
}

impl<T: Send + 'static> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.entry {
            Some(entry) => &mut entry.value,
            None => unreachable!("lease accessed after release"),
        }
    }
}

impl<T: Send + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.give_back(entry);
        }
    }
}
