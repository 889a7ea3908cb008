//! Running `async` blocks as pooled futures.
//!
//! [`pooled`] (or [`FutureFactory::start`]) drives a state machine until its first suspension
//! on the calling thread. If it finishes without suspending, the result is handed back inline
//! and nothing is taken from a pool. Otherwise the machine is parked in a recycled
//! [`StateBox`](state_box::StateBox) and a completion slot is checked out to carry its result.
//! Both go back to their pools when the machine completes and its result has been taken.
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::dispatch;
use crate::pool::pool_of;
use crate::slot::{CompletionSlot, Outcome};
use crate::{Error, PooledFuture, Result};

mod state_box;

use state_box::StateBox;

/// Drive `machine` as a pooled future.
///
/// ```
/// use futures_lite::future::block_on;
///
/// let fut = reusable::pooled(async { Ok(21 * 2) });
/// assert!(fut.is_ready());
/// assert_eq!(block_on(fut).unwrap(), 42);
/// ```
pub fn pooled<F, T>(machine: F) -> PooledFuture<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    FutureFactory::create().start(machine)
}

/// Number of idle completion slots pooled for results of type `T`.
pub fn cached_slots<T: Send + 'static>() -> usize {
    pool_of::<Arc<CompletionSlot<T>>>().len()
}

/// Drop every idle completion slot pooled for results of type `T`.
pub fn clear_slot_pool<T: Send + 'static>() {
    pool_of::<Arc<CompletionSlot<T>>>().clear()
}

/// The per-invocation builder behind a pooled future.
///
/// A factory starts empty. A result set before the first suspension is stored inline; the
/// first suspension checks a slot out of the pool, and every later result goes through it.
pub struct FutureFactory<T> {
    slot: Option<(Arc<CompletionSlot<T>>, u64)>,
    inline: Option<Outcome<T>>,
}

impl<T> fmt::Debug for FutureFactory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureFactory")
            .field("slot", &self.slot)
            .field("inline", &self.inline)
            .finish()
    }
}

impl<T: Send + 'static> Default for FutureFactory<T> {
    fn default() -> Self {
        Self::create()
    }
}

impl<T: Send + 'static> FutureFactory<T> {
    pub fn create() -> Self {
        FutureFactory {
            slot: None,
            inline: None,
        }
    }

    /// Run `machine` up to its first suspension and return the future for its result.
    pub fn start<F>(self, machine: F) -> PooledFuture<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        StateBox::launch(self, machine)
    }

    pub fn set_result(&mut self, value: T) -> Result<()> {
        self.complete(Outcome::Value(value))
    }

    /// Complete with an error. An error always travels through a slot.
    pub fn set_exception(&mut self, err: Error) -> Result<()> {
        self.complete(Outcome::Error(err))
    }

    pub(crate) fn complete(&mut self, outcome: Outcome<T>) -> Result<()> {
        if self.slot.is_none() {
            if self.inline.is_some() {
                return Err(Error::InvalidOperation("a result has already been set"));
            }
            if let Outcome::Value(_) = outcome {
                self.inline = Some(outcome);
                return Ok(());
            }
            self.await_on_suspend();
        }
        match &self.slot {
            Some((slot, generation)) if slot.try_complete(Some(*generation), outcome) => Ok(()),
            _ => Err(Error::InvalidOperation("a result has already been set")),
        }
    }

    /// Prepare for an asynchronous completion: check a slot out of the pool and capture the
    /// ambient execution context for the continuation. Idempotent.
    pub fn await_on_suspend(&mut self) {
        if self.slot.is_some() {
            return;
        }
        let slot = CompletionSlot::checkout();
        let generation = slot.generation();
        if let Err(err) = slot.set_context(generation, dispatch::current()) {
            log::warn!("freshly checked out slot rejected its context: {}", err);
        }
        self.slot = Some((slot, generation));
    }

    /// The future of this invocation was dropped before the machine completed it.
    pub(crate) fn is_abandoned(&self) -> bool {
        match &self.slot {
            Some((slot, generation)) => slot.is_claimed(*generation),
            None => false,
        }
    }

    /// The future for this invocation. An inline result moves into the returned future.
    pub fn future(&mut self) -> PooledFuture<T> {
        if let Some(outcome) = self.inline.take() {
            return PooledFuture::from_outcome(outcome);
        }
        match &self.slot {
            Some((slot, generation)) => PooledFuture::pending(Arc::clone(slot), *generation),
            None => PooledFuture::from_error(Error::InvalidOperation(
                "the operation neither completed nor suspended",
            )),
        }
    }
}
