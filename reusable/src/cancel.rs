//! Cooperative cancellation.
//!
//! A [`CancellationSource`] hands out [`CancellationToken`]s. Operations check a token before they
//! start and register a callback on it while they wait; canceling the source runs every
//! registered callback once.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use smallvec::SmallVec;
use spin::Mutex;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Callbacks {
    next_id: u64,
    entries: SmallVec<[(u64, Callback); 4]>,
}

struct Inner {
    canceled: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

/// The owner side of a cancellation signal.
pub struct CancellationSource {
    inner: Arc<Inner>,
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl CancellationSource {
    pub fn new() -> Self {
        CancellationSource {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                callbacks: Mutex::new(Callbacks {
                    next_id: 0,
                    entries: SmallVec::new(),
                }),
            }),
        }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Signal cancellation. Registered callbacks run on this thread, in registration order.
    /// Canceling twice has no further effect.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries = std::mem::take(&mut self.inner.callbacks.lock().entries);
        log::trace!("canceling, {} callbacks registered", entries.len());
        for (_, callback) in entries {
            callback();
        }
    }
}

/// The observer side of a cancellation signal. Cheap to clone.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Option<Arc<Inner>>,
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl CancellationToken {
    /// A token that is never canceled.
    pub fn none() -> Self {
        CancellationToken { inner: None }
    }

    pub fn is_canceled(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.canceled.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Run `callback` when the token is canceled. If it already is, `callback` runs right away.
    /// Dropping the returned [`Registration`] unregisters the callback.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return Registration::empty(),
        };
        let mut callbacks = inner.callbacks.lock();
        if inner.canceled.load(Ordering::Acquire) {
            drop(callbacks);
            callback();
            return Registration::empty();
        }
        let id = callbacks.next_id;
        callbacks.next_id += 1;
        callbacks.entries.push((id, Box::new(callback)));
        Registration {
            inner: Arc::downgrade(inner),
            id,
        }
    }
}

/// Keeps a callback registered on a [`CancellationToken`].
#[must_use = "dropping a registration unregisters its callback"]
pub struct Registration {
    inner: Weak<Inner>,
    id: u64,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

impl Registration {
    fn empty() -> Self {
        Registration {
            inner: Weak::new(),
            id: 0,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let removed = {
                let mut callbacks = inner.callbacks.lock();
                let id = self.id;
                callbacks
                    .entries
                    .iter()
                    .position(|(entry, _)| *entry == id)
                    .map(|index| callbacks.entries.remove(index))
            };
            // The callback may own arbitrary state; drop it outside of the lock.
            drop(removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_cancel_runs_callbacks_once() {
        let source = CancellationSource::new();
        let token = source.token();
        let (count, callback) = counter();
        let _registration = token.register(callback);
        assert!(!token.is_canceled());
        source.cancel();
        source.cancel();
        assert!(token.is_canceled());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_after_cancel_runs_immediately() {
        let source = CancellationSource::new();
        source.cancel();
        let (count, callback) = counter();
        let _registration = source.token().register(callback);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_registration_does_not_run() {
        let source = CancellationSource::new();
        let (count, callback) = counter();
        drop(source.token().register(callback));
        source.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_none_token() {
        let token = CancellationToken::none();
        let (count, callback) = counter();
        let _registration = token.register(callback);
        assert!(!token.is_canceled());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
