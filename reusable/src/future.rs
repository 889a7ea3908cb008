use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::dispatch::{self, ContextHandle, ContinuationDispatcher};
use crate::slot::{CancelHandle, CompletionSlot, Continuation, Outcome};
use crate::{Error, Result};

enum Inner<T> {
    /// Completed synchronously; no slot was ever involved.
    Completed(Option<Outcome<T>>),
    /// Backed by one generation of a completion slot.
    Pending {
        slot: Arc<CompletionSlot<T>>,
        generation: u64,
    },
}

/// How the holder of a pending future asked to be notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interest {
    None,
    /// A continuation passed to [`PooledFuture::on_ready`].
    Callback,
    /// The waker of the task polling the future.
    Waker,
}

/// A future whose backing storage is recycled once its result has been taken.
///
/// A `PooledFuture` must be awaited (or have [`get_result`](Self::get_result) called) at most
/// once, and at most one continuation may be registered on it, either by polling it or through
/// [`on_ready`](Self::on_ready). Breaking either rule fails with [`Error::InvalidReuse`].
///
/// Dropping a future withdraws the waker its polling task registered. A future returned by
/// [`pooled`](crate::pooled) also owns its operation: dropping it before the result is taken
/// cancels the operation, and the suspended state machine is dropped without being polled again.
/// A result produced before the drop is dropped with it. A continuation registered through
/// `on_ready` is left in place.
pub struct PooledFuture<T: Send + 'static> {
    inner: Inner<T>,
    interest: Interest,
    /// Wakes the state machine producing the result.
    owner: Option<Waker>,
}

impl<T: Send + 'static> Unpin for PooledFuture<T> {}

impl<T: Send + 'static> fmt::Debug for PooledFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Completed(outcome) => f
                .debug_struct("PooledFuture")
                .field("completed", outcome)
                .finish(),
            Inner::Pending { slot, generation } => f
                .debug_struct("PooledFuture")
                .field("slot", slot)
                .field("generation", generation)
                .field("interest", &self.interest)
                .finish(),
        }
    }
}

impl<T: Send + 'static> PooledFuture<T> {
    /// A future that is already complete with `value`.
    pub fn from_value(value: T) -> Self {
        Self::from_outcome(Outcome::Value(value))
    }

    /// A future that is already complete with `err`.
    pub fn from_error(err: Error) -> Self {
        Self::from_outcome(Outcome::Error(err))
    }

    pub(crate) fn from_outcome(outcome: Outcome<T>) -> Self {
        PooledFuture {
            inner: Inner::Completed(Some(outcome)),
            interest: Interest::None,
            owner: None,
        }
    }

    pub(crate) fn pending(slot: Arc<CompletionSlot<T>>, generation: u64) -> Self {
        PooledFuture {
            inner: Inner::Pending { slot, generation },
            interest: Interest::None,
            owner: None,
        }
    }

    /// Make this future the owner of the operation `machine` wakes, see the type documentation.
    pub(crate) fn owned_by(mut self, machine: Waker) -> Self {
        if let Inner::Pending { .. } = self.inner {
            self.owner = Some(machine);
        }
        self
    }

    /// The result can be taken right now without suspending.
    ///
    /// A future that forces asynchronous continuations is never ready, even after its result
    /// has arrived; see [`is_completed`](Self::is_completed).
    pub fn is_ready(&self) -> bool {
        match &self.inner {
            Inner::Completed(outcome) => outcome.is_some(),
            Inner::Pending { slot, generation } => slot.is_ready(*generation),
        }
    }

    /// The result has arrived and has not been taken yet.
    pub fn is_completed(&self) -> bool {
        match &self.inner {
            Inner::Completed(outcome) => outcome.is_some(),
            Inner::Pending { slot, generation } => slot.has_value(*generation),
        }
    }

    /// Register the continuation to run once the result is available. If it already is, the
    /// continuation is dispatched immediately.
    pub fn on_ready(&mut self, continuation: Continuation) -> Result<()> {
        if self.interest != Interest::None {
            return Err(Error::InvalidReuse("a continuation is already registered"));
        }
        match &self.inner {
            Inner::Completed(None) => {
                return Err(Error::InvalidReuse("the result was already retrieved"));
            }
            Inner::Completed(Some(_)) => {
                ContinuationDispatcher::new(dispatch::current(), false).dispatch(continuation)
            }
            Inner::Pending { slot, generation } => slot.on_ready(*generation, continuation)?,
        }
        self.interest = Interest::Callback;
        Ok(())
    }

    /// Take the result. Fails with [`Error::InvalidOperation`] if it has not arrived yet, and
    /// with [`Error::InvalidReuse`] if it was already taken.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of the asynchronous work that produced this future, if it panicked.
    pub fn get_result(&mut self) -> Result<T> {
        match &mut self.inner {
            Inner::Completed(outcome) => match outcome.take() {
                Some(outcome) => outcome.into_result(),
                None => Err(Error::InvalidReuse("the result was already retrieved")),
            },
            Inner::Pending { slot, generation } => slot.get_result(*generation),
        }
    }

    /// Resume the awaiting code on `context` instead of the context captured when the work
    /// suspended. `None` resumes without any context.
    pub fn continue_on(self, context: Option<ContextHandle>) -> Self {
        if let Inner::Pending { slot, generation } = &self.inner {
            // A stale generation surfaces as InvalidReuse when awaited.
            let _ = slot.set_context(*generation, context);
        }
        self
    }

    /// Block the current thread until the result is available and take it.
    ///
    /// Must not be called from a thread the result depends on, such as the only thread of the
    /// execution context the producer resumes on.
    pub fn wait(self) -> Result<T> {
        futures_lite::future::block_on(self)
    }

    pub(crate) fn cancel_handle(&self) -> Option<CancelHandle<T>> {
        match &self.inner {
            Inner::Completed(_) => None,
            Inner::Pending { slot, generation } => {
                Some(CancelHandle::new(Arc::clone(slot), *generation))
            }
        }
    }
}

impl PooledFuture<()> {
    /// A future that is already complete with `()`.
    pub fn completed() -> Self {
        Self::from_value(())
    }
}

impl<T: Send + 'static> Future for PooledFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let (slot, generation) = match &mut this.inner {
            Inner::Completed(outcome) => {
                return match outcome.take() {
                    Some(outcome) => Poll::Ready(outcome.into_result()),
                    None => Poll::Ready(Err(Error::InvalidReuse("polled after completion"))),
                };
            }
            Inner::Pending { slot, generation } => (Arc::clone(slot), *generation),
        };

        match this.interest {
            Interest::Callback => Poll::Ready(Err(Error::InvalidReuse(
                "a callback continuation is already registered",
            ))),
            Interest::None => {
                if slot.is_ready(generation) {
                    return Poll::Ready(slot.get_result(generation));
                }
                if let Err(err) =
                    slot.on_ready(generation, Continuation::Waker(cx.waker().clone()))
                {
                    return Poll::Ready(Err(err));
                }
                this.interest = Interest::Waker;
                Poll::Pending
            }
            Interest::Waker => {
                if slot.has_value(generation) {
                    return Poll::Ready(slot.get_result(generation));
                }
                match slot.update_waker(generation, cx.waker()) {
                    Ok(()) => Poll::Pending,
                    Err(err) => Poll::Ready(Err(err)),
                }
            }
        }
    }
}

impl<T: Send + 'static> Drop for PooledFuture<T> {
    fn drop(&mut self) {
        let (slot, generation) = match &self.inner {
            Inner::Pending { slot, generation } => (slot, *generation),
            Inner::Completed(_) => return,
        };
        // Every step below is a no-op once the result of `generation` was taken.
        match self.interest {
            Interest::Callback => return,
            Interest::Waker => slot.unregister(generation),
            Interest::None => {}
        }
        match self.owner.take() {
            Some(machine) => {
                let canceled = slot.try_cancel(generation);
                slot.discard(generation);
                if canceled {
                    // The machine finds its result claimed and is dropped instead of polled.
                    machine.wake();
                }
            }
            None if self.interest == Interest::Waker => slot.discard(generation),
            None => {}
        }
    }
}
