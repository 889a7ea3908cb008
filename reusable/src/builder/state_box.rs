//! The recyclable home of a suspended state machine.
//!
//! A [`StateBox`] owns one machine and the [`FutureFactory`] that will receive its result. The box
//! is its own waker: waking it polls the machine again, on whichever thread delivered the wake.
//! Once the machine finishes, the box is emptied and pushed back to the pool of its exact machine
//! type, ready for the next invocation of the same `async` code.
//!
//! ### Polling Rules
//!
//! 1. Only the thread that moved the box from `IDLE` to `RUNNING` touches the machine or the
//!    factory.
//! 2. A wake that finds the box `RUNNING` sets `NOTIFIED` and returns. The running thread sees the
//!    flag when it tries to go back to `IDLE` and polls once more.
//! 3. A wake that finds no machine is stale (it belongs to a finished invocation) and is ignored.
//! 4. A machine whose future was dropped finds its result slot claimed. It is dropped in place of
//!    its next poll and the box is recycled.
use std::cell::UnsafeCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use super::FutureFactory;
use crate::pool::pool_of;
use crate::slot::Outcome;
use crate::{PooledFuture, Result};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;

enum Step {
    Pending,
    Done,
    Vacant,
}

pub(crate) struct StateBox<F, T> {
    state: AtomicU8,
    machine: UnsafeCell<Option<F>>,
    factory: UnsafeCell<FutureFactory<T>>,
}

// The cells are only touched by the thread holding RUNNING.
unsafe impl<F: Send, T: Send> Send for StateBox<F, T> {}
unsafe impl<F: Send, T: Send> Sync for StateBox<F, T> {}

impl<F, T> StateBox<F, T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    fn checkout() -> Arc<Self> {
        match pool_of::<Arc<Self>>().pop() {
            Some(state_box) => state_box,
            None => {
                log::trace!("state box pool empty, allocating");
                Arc::new(StateBox {
                    state: AtomicU8::new(IDLE),
                    machine: UnsafeCell::new(None),
                    factory: UnsafeCell::new(FutureFactory::create()),
                })
            }
        }
    }

    /// Install `machine` in a pooled box and drive it to its first suspension.
    pub(crate) fn launch(factory: FutureFactory<T>, machine: F) -> PooledFuture<T> {
        let this = Self::checkout();
        // A stale wake may hold the box for a moment.
        while this
            .state
            .compare_exchange_weak(IDLE, RUNNING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }

        // Safety: RUNNING is held.
        unsafe {
            *this.machine.get() = Some(machine);
            *this.factory.get() = factory;
        }

        let waker = Waker::from(Arc::clone(&this));
        let mut suspended = None;
        loop {
            // Safety: RUNNING is held for the whole loop.
            match unsafe { this.poll_once(&waker) } {
                Step::Done | Step::Vacant => {
                    let fut = match suspended {
                        Some(fut) => fut,
                        None => unsafe { (*this.factory.get()).future() },
                    };
                    this.recycle();
                    return fut;
                }
                Step::Pending => {
                    let fut = match suspended.take() {
                        Some(fut) => fut,
                        None => unsafe {
                            let factory = &mut *this.factory.get();
                            factory.await_on_suspend();
                            factory.future().owned_by(waker.clone())
                        },
                    };
                    if this.release() {
                        return fut;
                    }
                    suspended = Some(fut);
                }
            }
        }
    }

    fn resume(self: &Arc<Self>) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = if current & RUNNING != 0 {
                current | NOTIFIED
            } else {
                RUNNING
            };
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if next == RUNNING => break,
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }

        let waker = Waker::from(Arc::clone(self));
        loop {
            // Safety: RUNNING is held.
            match unsafe { self.poll_once(&waker) } {
                Step::Done => return self.recycle(),
                Step::Vacant => {
                    log::trace!("ignoring a stale wake of a recycled state box");
                    self.state.store(IDLE, Ordering::Release);
                    return;
                }
                Step::Pending => {
                    if self.release() {
                        return;
                    }
                }
            }
        }
    }

    /// Give up RUNNING after a `Pending` poll. Returns `false` if a wake arrived during the poll,
    /// in which case RUNNING is kept and the machine must be polled again.
    fn release(&self) -> bool {
        match self
            .state
            .compare_exchange(RUNNING, IDLE, Ordering::Release, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                self.state.swap(RUNNING, Ordering::AcqRel);
                false
            }
        }
    }

    /// ### Safety
    /// The caller must hold RUNNING.
    unsafe fn poll_once(&self, waker: &Waker) -> Step {
        let slot = &mut *self.machine.get();
        if slot.is_some() && (*self.factory.get()).is_abandoned() {
            log::trace!("dropping a state machine whose future was dropped");
            let machine = slot.take();
            if panic::catch_unwind(AssertUnwindSafe(move || drop(machine))).is_err() {
                log::warn!("an abandoned state machine panicked while being dropped");
            }
            return Step::Done;
        }
        let machine = match slot.as_mut() {
            Some(machine) => machine,
            None => return Step::Vacant,
        };
        // The machine is never moved while it is installed.
        let machine = Pin::new_unchecked(machine);
        let mut cx = Context::from_waker(waker);
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| machine.poll(&mut cx))) {
            Ok(Poll::Pending) => return Step::Pending,
            Ok(Poll::Ready(Ok(value))) => Outcome::Value(value),
            Ok(Poll::Ready(Err(err))) => Outcome::Error(err),
            Err(payload) => {
                log::debug!("pooled state machine panicked, re-raising at its await point");
                Outcome::Panic(payload)
            }
        };
        *slot = None;
        let factory = &mut *self.factory.get();
        if factory.is_abandoned() {
            log::debug!("state machine finished after its future was dropped");
        } else if let Err(err) = factory.complete(outcome) {
            log::warn!("state machine result was dropped: {}", err);
        }
        Step::Done
    }

    fn recycle(self: &Arc<Self>) {
        // Safety: RUNNING is held until the store below.
        unsafe {
            *self.factory.get() = FutureFactory::create();
        }
        self.state.store(IDLE, Ordering::Release);
        pool_of::<Arc<Self>>().push(Arc::clone(self));
    }
}

impl<F, T> Wake for StateBox<F, T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    fn wake(self: Arc<Self>) {
        self.resume()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.resume()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::enter_worker_region;
    use crate::{CompletionSource, Error};
    use futures::executor::block_on;
    use std::sync::atomic::AtomicUsize;

    type Machine = std::pin::Pin<Box<dyn Future<Output = Result<u32>> + Send>>;

    fn boxed<Fut>(fut: Fut) -> Machine
    where
        Fut: Future<Output = Result<u32>> + Send + 'static,
    {
        Box::pin(fut)
    }

    #[test]
    fn test_box_is_reused_across_invocations() {
        struct Marker;
        type Boxed = std::pin::Pin<Box<dyn Future<Output = Result<Marker>> + Send>>;
        let gate = Arc::new(CompletionSource::new());

        for _ in 0..3 {
            let inner = Arc::clone(&gate);
            let machine: Boxed = Box::pin(async move {
                inner.future().await?;
                Ok(Marker)
            });
            let fut = StateBox::launch(FutureFactory::create(), machine);
            assert!(!fut.is_ready());
            enter_worker_region(|| gate.set_result(()).unwrap());
            assert!(block_on(fut).is_ok());
            assert_eq!(pool_of::<Arc<StateBox<Boxed, Marker>>>().len(), 1);
        }
    }

    #[test]
    fn test_spurious_wakes_are_harmless() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let gate = Arc::new(CompletionSource::new());
        let inner = Arc::clone(&gate);
        let mut waker_out = None;
        let (tx, rx) = std::sync::mpsc::channel();
        let fut = StateBox::launch(
            FutureFactory::create(),
            boxed(futures::future::poll_fn(move |cx| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(cx.waker().clone());
                if inner.is_completed() {
                    Poll::Ready(Ok(8))
                } else {
                    Poll::Pending
                }
            })),
        );
        while let Ok(waker) = rx.try_recv() {
            waker_out = Some(waker);
        }
        let waker = waker_out.expect("the machine was polled");
        waker.wake_by_ref();
        waker.wake_by_ref();
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert!(!fut.is_ready());

        gate.set_result(()).unwrap();
        waker.wake_by_ref();
        assert!(fut.is_ready());
        assert_eq!(block_on(fut).unwrap(), 8);

        // The box has been recycled; this wake is stale.
        waker.wake_by_ref();
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_panic_is_captured() {
        let fut = StateBox::launch(
            FutureFactory::create(),
            boxed(async {
                if true {
                    panic!("machine failure");
                }
                Ok(1)
            }),
        );
        assert!(fut.is_ready());
        let caught = panic::catch_unwind(AssertUnwindSafe(|| block_on(fut)));
        let payload = caught.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"machine failure"));
    }

    #[test]
    fn test_error_result() {
        let fut = StateBox::launch(
            FutureFactory::create(),
            boxed(async { Err(Error::faulted("no route to host")) }),
        );
        assert_eq!(
            block_on(fut).unwrap_err().to_string(),
            "no route to host"
        );
    }
}
