//! Bounded object pools shared by every thread in the process.
//!
//! Completion slots and state boxes are recycled through [`Pool<T>`], a LIFO stack guarded by a
//! spin lock. Every critical section is a single `push` or `pop`, so a blocking mutex would only
//! add a syscall to the uncontended path. A pool never grows past
//! [`Config::max_pool_size`](crate::Config::max_pool_size); objects returned to a full pool are
//! dropped.
//!
//! Pools are keyed by the type they store. [`pool_of`] hands out the `'static` pool for a type,
//! creating it on first use. The registry leaks one pool per distinct type, which is bounded by
//! the number of concrete future types in the program.
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use ahash::RandomState;
use lazy_static::lazy_static;
use spin::{Mutex, RwLock};

use crate::config::Config;

/// A type-erased view of a pool, used for process-wide statistics.
trait ErasedPool: Any + Send + Sync {
    fn cached(&self) -> usize;
    fn clear(&self);
    fn as_any(&self) -> &dyn Any;
}

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<TypeId, &'static dyn ErasedPool, RandomState>> =
        RwLock::new(HashMap::with_hasher(RandomState::new()));
}

/// A bounded LIFO stack of reusable objects.
pub(crate) struct Pool<T> {
    items: Mutex<Vec<T>>,
    limit: Option<usize>,
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("cached", &self.len())
            .field("limit", &self.limit())
            .finish()
    }
}

impl<T> Pool<T> {
    /// A pool bounded by the process-wide configuration.
    pub(crate) fn new() -> Self {
        Pool {
            items: Mutex::new(Vec::new()),
            limit: None,
        }
    }

    /// A pool with its own bound, independent of the process configuration.
    #[cfg(test)]
    pub(crate) fn with_limit(limit: usize) -> Self {
        Pool {
            items: Mutex::new(Vec::with_capacity(limit)),
            limit: Some(limit),
        }
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
            .unwrap_or_else(|| Config::current().max_pool_size())
    }

    /// Take the most recently returned object, if any.
    pub(crate) fn pop(&self) -> Option<T> {
        self.items.lock().pop()
    }

    /// Return an object to the pool. Returns `false` if the pool was full and the object was
    /// dropped instead.
    pub(crate) fn push(&self, item: T) -> bool {
        let limit = self.limit();
        let mut items = self.items.lock();
        if items.len() < limit {
            items.push(item);
            return true;
        }
        drop(items);
        log::trace!("pool full ({} objects), dropping returned object", limit);
        drop(item);
        false
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Drop every cached object. The objects are dropped outside of the lock.
    pub(crate) fn clear(&self) {
        let drained = std::mem::take(&mut *self.items.lock());
        drop(drained);
    }
}

impl<T: Send + 'static> ErasedPool for Pool<T> {
    fn cached(&self) -> usize {
        self.len()
    }

    fn clear(&self) {
        Pool::clear(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The process-wide pool holding objects of type `T`.
pub(crate) fn pool_of<T: Send + 'static>() -> &'static Pool<T> {
    let key = TypeId::of::<T>();
    let erased = {
        let registry = REGISTRY.read();
        registry.get(&key).copied()
    };
    let erased = match erased {
        Some(pool) => pool,
        None => {
            let mut registry = REGISTRY.write();
            *registry.entry(key).or_insert_with(|| {
                let pool: &'static dyn ErasedPool = Box::leak(Box::new(Pool::<T>::new()));
                pool
            })
        }
    };
    erased
        .as_any()
        .downcast_ref::<Pool<T>>()
        .expect("pool registry entry does not match its type key")
}

/// Total number of idle objects across every pool in the process.
pub fn cached_objects() -> usize {
    REGISTRY.read().values().map(|pool| pool.cached()).sum()
}

/// Drop every idle object from every pool in the process.
pub fn clear_pools() {
    let pools: Vec<&'static dyn ErasedPool> = REGISTRY.read().values().copied().collect();
    for pool in pools {
        pool.clear();
    }
}
