use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Waker;

use super::continuation::{replace_waker_ref, Continuation};
use super::state::{Phase, Word, CACHEABLE, CLAIMED, FORCE_ASYNC, HAS_VALUE, TAKEN};
use crate::dispatch::{ContextHandle, ContinuationDispatcher};
use crate::pool::pool_of;
use crate::{Error, Result};

/// What a completed operation produced.
pub(crate) enum Outcome<T> {
    Value(T),
    Error(Error),
    /// The asynchronous work panicked; the payload is re-raised at the await point.
    Panic(Box<dyn Any + Send + 'static>),
}

impl<T> Outcome<T> {
    pub(crate) fn into_result(self) -> Result<T> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Error(err) => Err(err),
            Outcome::Panic(payload) => panic::resume_unwind(payload),
        }
    }
}

impl<T> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Value(_) => f.write_str("Value"),
            Outcome::Error(err) => f.debug_tuple("Error").field(err).finish(),
            Outcome::Panic(_) => f.write_str("Panic"),
        }
    }
}

/// A recyclable single-result rendezvous. See the [module documentation](super).
pub(crate) struct CompletionSlot<T> {
    state: AtomicU64,
    outcome: UnsafeCell<Option<Outcome<T>>>,
    continuation: UnsafeCell<Option<Continuation>>,
    context: UnsafeCell<Option<ContextHandle>>,
}

// The cells are only accessed by the party that owns them according to the state word.
unsafe impl<T: Send> Send for CompletionSlot<T> {}
unsafe impl<T: Send> Sync for CompletionSlot<T> {}

impl<T> fmt::Debug for CompletionSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSlot")
            .field("state", &Word(self.state.load(Ordering::Relaxed)))
            .finish()
    }
}

impl<T: Send + 'static> CompletionSlot<T> {
    pub(crate) fn new(cacheable: bool, force_async: bool) -> Self {
        CompletionSlot {
            state: AtomicU64::new(Word::new(cacheable, force_async).0),
            outcome: UnsafeCell::new(None),
            continuation: UnsafeCell::new(None),
            context: UnsafeCell::new(None),
        }
    }

    /// Take a cacheable slot from the pool, or allocate one if the pool is empty.
    pub(crate) fn checkout() -> Arc<Self> {
        match pool_of::<Arc<Self>>().pop() {
            Some(slot) => slot,
            None => {
                log::trace!("completion slot pool empty, allocating");
                Arc::new(CompletionSlot::new(true, false))
            }
        }
    }

    #[inline]
    fn load(&self) -> Word {
        Word(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn generation(&self) -> u64 {
        self.load().generation()
    }

    fn is_current(word: Word, generation: u64) -> bool {
        word.generation() == generation && !word.has(TAKEN)
    }

    /// The payload of `generation` is published and the consumer may take it synchronously.
    /// A slot forcing asynchronous continuations never reports ready.
    pub(crate) fn is_ready(&self, generation: u64) -> bool {
        let word = self.load();
        Self::is_current(word, generation) && word.has(HAS_VALUE) && !word.has(FORCE_ASYNC)
    }

    /// The payload of `generation` is published, regardless of forcing.
    pub(crate) fn has_value(&self, generation: u64) -> bool {
        let word = self.load();
        Self::is_current(word, generation) && word.has(HAS_VALUE)
    }

    /// The payload of the current generation is published and not being taken.
    pub(crate) fn is_completed(&self) -> bool {
        let word = self.load();
        word.has(HAS_VALUE) && !word.has(TAKEN)
    }

    /// `generation` has been completed by somebody, or has already moved on.
    pub(crate) fn is_claimed(&self, generation: u64) -> bool {
        let word = self.load();
        word.generation() != generation || word.has(CLAIMED)
    }

    /// Attach the execution context the continuation of `generation` should resume on. Has no
    /// effect once a continuation is registered.
    pub(crate) fn set_context(&self, generation: u64, context: Option<ContextHandle>) -> Result<()> {
        let mut current = self.load();
        loop {
            if !Self::is_current(current, generation) {
                return Err(Error::InvalidReuse("the slot was recycled"));
            }
            match current.phase() {
                Phase::Empty => {}
                Phase::Registering => {
                    std::hint::spin_loop();
                    current = self.load();
                    continue;
                }
                _ => return Ok(()),
            }
            match self.state.compare_exchange_weak(
                current.0,
                current.with_phase(Phase::Registering).0,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = Word(actual),
            }
        }

        // Safety: Registering grants exclusive access to the context.
        let previous = unsafe { std::mem::replace(&mut *self.context.get(), context) };
        self.leave_registering(Phase::Empty);
        drop(previous);
        Ok(())
    }

    /// ### Safety
    /// The caller must hold `Registering` or `Firing`.
    unsafe fn dispatcher(&self, word: Word) -> ContinuationDispatcher {
        ContinuationDispatcher::new((*self.context.get()).clone(), word.has(FORCE_ASYNC))
    }

    /// Complete the slot. With `Some(generation)` only that generation is completed. Returns
    /// `false` if the slot was already completed or has moved on.
    pub(crate) fn try_complete(&self, generation: Option<u64>, outcome: Outcome<T>) -> bool {
        let mut current = self.load();
        loop {
            if current.has(CLAIMED) {
                return false;
            }
            if let Some(generation) = generation {
                if current.generation() != generation {
                    return false;
                }
            }
            match self.state.compare_exchange_weak(
                current.0,
                current.with(CLAIMED).0,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = Word(actual),
            }
        }

        // Safety: CLAIMED grants exclusive access to the payload until HAS_VALUE is published.
        unsafe {
            *self.outcome.get() = Some(outcome);
        }
        self.publish();
        true
    }

    pub(crate) fn try_cancel(&self, generation: u64) -> bool {
        self.try_complete(Some(generation), Outcome::Error(Error::Canceled))
    }

    fn publish(&self) {
        let mut current = self.load();
        loop {
            match current.phase() {
                Phase::Empty | Phase::Registering => {
                    match self.state.compare_exchange_weak(
                        current.0,
                        current.with(HAS_VALUE).0,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(actual) => current = Word(actual),
                    }
                }
                Phase::Registered => {
                    match self.state.compare_exchange_weak(
                        current.0,
                        current.with_phase(Phase::Firing).0,
                        Ordering::Acquire,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // Safety: Firing grants exclusive access to the continuation and
                            // the context.
                            let (continuation, dispatcher) = unsafe {
                                ((*self.continuation.get()).take(), self.dispatcher(current))
                            };
                            self.state.store(
                                current.with_phase(Phase::Fired).with(HAS_VALUE).0,
                                Ordering::Release,
                            );
                            if let Some(continuation) = continuation {
                                dispatcher.dispatch(continuation);
                            }
                            return;
                        }
                        Err(actual) => current = Word(actual),
                    }
                }
                Phase::Firing | Phase::Fired => {
                    unreachable!("only the claiming producer fires a continuation")
                }
            }
        }
    }

    /// Register the single continuation of `generation`. If the payload is already published the
    /// continuation is dispatched right away.
    pub(crate) fn on_ready(&self, generation: u64, continuation: Continuation) -> Result<()> {
        let mut current = self.load();
        loop {
            if !Self::is_current(current, generation) {
                return Err(Error::InvalidReuse(
                    "the slot was recycled before the continuation was registered",
                ));
            }
            match current.phase() {
                Phase::Empty => {}
                Phase::Registering => {
                    std::hint::spin_loop();
                    current = self.load();
                    continue;
                }
                _ => return Err(Error::InvalidReuse("a continuation is already registered")),
            }
            match self.state.compare_exchange_weak(
                current.0,
                current.with_phase(Phase::Registering).0,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = Word(actual),
            }
        }

        // Safety: Registering grants exclusive access to the continuation.
        unsafe {
            *self.continuation.get() = Some(continuation);
        }
        self.finish_registration();
        Ok(())
    }

    /// Replace the waker registered for `generation`, used when a future is polled again before
    /// its result arrived. Does nothing if the continuation is already on its way, and fails if
    /// the registered continuation is a callback.
    pub(crate) fn update_waker(&self, generation: u64, waker: &Waker) -> Result<()> {
        let mut current = self.load();
        loop {
            if !Self::is_current(current, generation) {
                return Err(Error::InvalidReuse("the slot was recycled"));
            }
            match current.phase() {
                Phase::Firing | Phase::Fired => return Ok(()),
                Phase::Empty => {
                    return Err(Error::InvalidReuse("no continuation is registered"));
                }
                Phase::Registering => {
                    return Err(Error::InvalidReuse(
                        "a continuation is being registered concurrently",
                    ));
                }
                Phase::Registered => {
                    match self.state.compare_exchange_weak(
                        current.0,
                        current.with_phase(Phase::Registering).0,
                        Ordering::Acquire,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => current = Word(actual),
                    }
                }
            }
        }

        // Safety: Registering grants exclusive access to the continuation.
        let replaced = unsafe { replace_waker_ref(&mut *self.continuation.get(), waker) };
        self.finish_registration();
        if replaced {
            Ok(())
        } else {
            Err(Error::InvalidReuse("a callback continuation is already registered"))
        }
    }

    /// Withdraw the continuation registered for `generation` if it has not fired yet. The
    /// continuation is dropped without running.
    pub(crate) fn unregister(&self, generation: u64) {
        let mut current = self.load();
        loop {
            if !Self::is_current(current, generation) {
                return;
            }
            match current.phase() {
                Phase::Empty | Phase::Fired => return,
                Phase::Registering | Phase::Firing => {
                    std::hint::spin_loop();
                    current = self.load();
                }
                Phase::Registered => {
                    match self.state.compare_exchange_weak(
                        current.0,
                        current.with_phase(Phase::Registering).0,
                        Ordering::Acquire,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => current = Word(actual),
                    }
                }
            }
        }

        // Safety: Registering grants exclusive access to the continuation.
        let continuation = unsafe { (*self.continuation.get()).take() };
        // A payload published meanwhile stays for whoever takes it next.
        self.leave_registering(Phase::Empty);
        drop(continuation);
    }

    // Leave Registering for `phase` without looking at the payload.
    fn leave_registering(&self, phase: Phase) {
        let mut current = self.load();
        loop {
            debug_assert_eq!(current.phase(), Phase::Registering);
            match self.state.compare_exchange_weak(
                current.0,
                current.with_phase(phase).0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = Word(actual),
            }
        }
    }

    // Leave Registering. If the payload was published meanwhile the producer did not see our
    // continuation, so we dispatch it ourselves.
    fn finish_registration(&self) {
        let mut current = self.load();
        loop {
            debug_assert_eq!(current.phase(), Phase::Registering);
            if current.has(HAS_VALUE) {
                // Safety: still Registering.
                let (continuation, dispatcher) =
                    unsafe { ((*self.continuation.get()).take(), self.dispatcher(current)) };
                match self.state.compare_exchange_weak(
                    current.0,
                    current.with_phase(Phase::Fired).0,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        if let Some(continuation) = continuation {
                            dispatcher.dispatch(continuation);
                        }
                        return;
                    }
                    Err(actual) => {
                        unsafe {
                            *self.continuation.get() = continuation;
                        }
                        current = Word(actual);
                    }
                }
                continue;
            }
            match self.state.compare_exchange_weak(
                current.0,
                current.with_phase(Phase::Registered).0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = Word(actual),
            }
        }
    }

    /// Take the result of `generation`, reset the slot for its next use and, if cacheable,
    /// return it to its pool. Errors and panics carried by the result are raised after the
    /// slot has been recycled.
    pub(crate) fn get_result(self: &Arc<Self>, generation: u64) -> Result<T> {
        self.take_outcome(generation)?.into_result()
    }

    /// Take and drop the published result of `generation`, recycling the slot. A result that has
    /// not been published yet is left alone.
    pub(crate) fn discard(self: &Arc<Self>, generation: u64) {
        if self.has_value(generation) {
            if let Ok(outcome) = self.take_outcome(generation) {
                log::trace!("discarding an unclaimed {:?} result", outcome);
            }
        }
    }

    fn take_outcome(self: &Arc<Self>, generation: u64) -> Result<Outcome<T>> {
        let mut current = self.load();
        loop {
            if !Self::is_current(current, generation) {
                return Err(Error::InvalidReuse("the result was already retrieved"));
            }
            if !current.has(HAS_VALUE) {
                return Err(Error::InvalidOperation("the operation has not completed yet"));
            }
            match current.phase() {
                Phase::Empty | Phase::Fired => {}
                Phase::Registering => {
                    std::hint::spin_loop();
                    current = self.load();
                    continue;
                }
                _ => {
                    return Err(Error::InvalidReuse(
                        "the result was requested while a continuation is being registered",
                    ));
                }
            }
            match self.state.compare_exchange_weak(
                current.0,
                current.with(TAKEN).0,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = Word(actual),
            }
        }

        // Safety: TAKEN in phase Empty or Fired leaves every cell to the consumer.
        let outcome = unsafe { (*self.outcome.get()).take() };
        self.reset(current);
        if current.has(CACHEABLE) {
            pool_of::<Arc<Self>>().push(Arc::clone(self));
        }
        outcome.ok_or(Error::InvalidOperation("the slot was published without a result"))
    }

    fn reset(&self, current: Word) {
        // Safety: called by the consumer that set TAKEN.
        let (continuation, context) = unsafe {
            (
                (*self.continuation.get()).take(),
                (*self.context.get()).take(),
            )
        };
        self.state
            .store(current.next_generation().0, Ordering::Release);
        drop(continuation);
        drop(context);
    }
}

/// Cancels one generation of a slot, and nothing else.
pub(crate) struct CancelHandle<T> {
    slot: Arc<CompletionSlot<T>>,
    generation: u64,
}

impl<T: Send + 'static> CancelHandle<T> {
    pub(crate) fn new(slot: Arc<CompletionSlot<T>>, generation: u64) -> Self {
        CancelHandle { slot, generation }
    }

    pub(crate) fn cancel(&self) -> bool {
        self.slot.try_cancel(self.generation)
    }
}
