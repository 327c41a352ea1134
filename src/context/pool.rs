use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use tracing::trace;

/// Objects that can be recycled through a [`ContextPool`].
pub trait Poolable: Default + Send + 'static {
    /// Drops per-dispatch state so the object can be handed out again.
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances constructed because the pool was empty.
    pub created: usize,
    /// Instances currently waiting in the pool.
    pub retained: usize,
    pub capacity: usize,
}

/// Bounded free list. Renting never waits: an empty or contended pool
/// constructs a new instance, a full or contended pool drops the returned one.
pub struct ContextPool<T: Poolable> {
    retained: Mutex<Vec<T>>,
    capacity: usize,
    created: AtomicUsize,
}

impl<T: Poolable> ContextPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            retained: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            created: AtomicUsize::new(0),
        }
    }

    /// Pops a retained instance, or constructs one when the pool is empty
    /// or another thread holds it.
    pub fn rent(&self) -> T {
        let recycled = match self.retained.try_lock() {
            Ok(mut retained) => retained.pop(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().pop(),
            Err(TryLockError::WouldBlock) => None,
        };
        recycled.unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            T::default()
        })
    }

    /// Resets `item` and keeps it if there is room and the pool is not
    /// contended. Never fails and never waits.
    pub fn give_back(&self, mut item: T) {
        item.reset();
        let retained = match self.retained.try_lock() {
            Ok(retained) => Some(retained),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        if let Some(mut retained) = retained {
            if retained.len() < self.capacity {
                retained.push(item);
                return;
            }
        }
        trace!("Pool full or contended, dropping returned instance");
    }

    pub fn stats(&self) -> PoolStats {
        let retained = self
            .retained
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            retained,
            capacity: self.capacity,
        }
    }
}

/// Exclusive checkout from a [`ContextPool`], returned on drop.
pub struct Lease<T: Poolable> {
    item: Option<T>,
    pool: Arc<ContextPool<T>>,
}

impl<T: Poolable> Lease<T> {
    pub fn rent(pool: &Arc<ContextPool<T>>) -> Self {
        Self {
            item: Some(pool.rent()),
            pool: Arc::clone(pool),
        }
    }
}

impl<T: Poolable> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `drop` takes the item.
        match &self.item {
            Some(item) => item,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<T: Poolable> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<T: Poolable> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.give_back(item);
        }
    }
}
