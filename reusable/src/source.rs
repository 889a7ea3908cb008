use std::fmt;
use std::sync::Arc;

use crate::dispatch;
use crate::slot::{CompletionSlot, Outcome};
use crate::{Error, PooledFuture, Result};

/// A manually completed [`PooledFuture`] producer.
///
/// The source owns a slot that never enters a pool. After the consumer has awaited the current
/// future the slot resets, and the same source can be completed again, handing out a fresh
/// future each time.
pub struct CompletionSource<T> {
    slot: Arc<CompletionSlot<T>>,
}

impl<T> fmt::Debug for CompletionSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSource")
            .field("slot", &self.slot)
            .finish()
    }
}

impl<T: Send + 'static> Default for CompletionSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> CompletionSource<T> {
    pub fn new() -> Self {
        CompletionSource {
            slot: Arc::new(CompletionSlot::new(false, false)),
        }
    }

    /// A source whose continuations never run on the completing thread.
    pub fn with_forced_async() -> Self {
        CompletionSource {
            slot: Arc::new(CompletionSlot::new(false, true)),
        }
    }

    /// The future for the current use of this source. It resumes on the execution context
    /// that is ambient when this is called.
    pub fn future(&self) -> PooledFuture<T> {
        let generation = self.slot.generation();
        // Only a stale generation can fail here, and the fresh one was just read.
        let _ = self.slot.set_context(generation, dispatch::current());
        PooledFuture::pending(Arc::clone(&self.slot), generation)
    }

    /// Whether the current use has been completed and not yet awaited.
    pub fn is_completed(&self) -> bool {
        self.slot.is_completed()
    }

    pub fn set_result(&self, value: T) -> Result<()> {
        self.complete(Outcome::Value(value))
    }

    pub fn set_exception(&self, err: Error) -> Result<()> {
        self.complete(Outcome::Error(err))
    }

    pub fn set_canceled(&self) -> Result<()> {
        self.complete(Outcome::Error(Error::Canceled))
    }

    /// Like [`set_result`](Self::set_result), but returns `false` instead of failing when the
    /// source was already completed.
    pub fn try_set_result(&self, value: T) -> bool {
        self.slot.try_complete(None, Outcome::Value(value))
    }

    pub fn try_set_exception(&self, err: Error) -> bool {
        self.slot.try_complete(None, Outcome::Error(err))
    }

    pub fn try_set_canceled(&self) -> bool {
        self.slot.try_complete(None, Outcome::Error(Error::Canceled))
    }

    fn complete(&self, outcome: Outcome<T>) -> Result<()> {
        if self.slot.try_complete(None, outcome) {
            Ok(())
        } else {
            Err(Error::InvalidOperation("the source was already completed"))
        }
    }
}
