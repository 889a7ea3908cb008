//! The completion slot: the recyclable rendezvous between the code that produces a result and the
//! code that waits for it.
//!
//! ### Safety
//! The types in this module hand out raw access to interior cells after winning a compare-and-swap
//! on the slot's state word. They are not exposed outside the crate; [`PooledFuture`] and
//! [`CompletionSource`] are the safe faces.
//!
//! ### Design
//! A [`CompletionSlot<T>`] lives behind an `Arc` and is reused for many operations. Each use is a
//! *generation*. A handle to a slot pairs the `Arc` with the generation it was issued for, and every
//! operation on the slot first compares that generation with the slot's current one. A stale handle
//! therefore fails with [`Error::InvalidReuse`] instead of observing somebody else's result.
//!
//! The whole state of a generation fits one `u64` (see [`state`]). Two parties negotiate through
//! it: the *producer*, which completes the slot exactly once, and the *consumer*, which registers
//! one continuation and then takes the result exactly once. The continuation moves through these
//! phases:
//!
//! ```ascii
//! +-------------------+   consumer    +-------------------+   consumer    +-------------------+
//! |       Empty       |<------------->|    Registering    |<------------->|    Registered     |
//! +-------------------+               +-------------------+               +-------------------+
//!                                               |                                   |
//!                                               | consumer, value arrived           | producer
//!                                               v                                   v
//!                                     +-------------------+               +-------------------+
//!                                     |       Fired       |<--------------|      Firing       |
//!                                     +-------------------+   producer    +-------------------+
//! ```
//!
//! `Registering` is the consumer's lock on the continuation and context cells. Besides
//! registering, it is taken to attach an execution context (`Empty` and back), to replace a waker
//! (`Registered` and back) and to withdraw a continuation (`Registered` to `Empty`). Nobody waits
//! while holding it, so parties that find it taken spin until it is released.
//!
//! ### Completion Rules
//!
//! 1. A producer first sets `CLAIMED`. Only the thread that set it may write the payload cell, and
//!    it gives up that right by publishing `HAS_VALUE`. A second producer sees `CLAIMED` and fails.
//! 2. If no continuation is `Registered` when the payload is published, the producer touches
//!    nothing else. A consumer still in `Registering` sees `HAS_VALUE` when it tries to move to
//!    `Registered` and dispatches its own continuation.
//! 3. If a continuation is `Registered`, the producer moves to `Firing`, takes the continuation,
//!    publishes `HAS_VALUE` together with `Fired` and only then dispatches. The continuation always
//!    observes the payload.
//! 4. After publishing, the producer never reads the slot again. The consumer may reset it the
//!    moment `HAS_VALUE` is visible.
//!
//! ### Reset Rules
//!
//! 5. The consumer takes the result by setting `TAKEN`, which is only possible while the phase is
//!    `Empty` or `Fired`. No other party touches the cells in those phases.
//! 6. Resetting clears the cells, drops the execution context and stores a word with the next
//!    generation. `CACHEABLE` and `FORCE_ASYNC` survive; everything else is cleared.
//! 7. A cacheable slot goes back to its pool right after the reset, before an error or panic
//!    carried by the result is re-raised to the consumer.
//!
//! [`PooledFuture`]: crate::PooledFuture
//! [`CompletionSource`]: crate::CompletionSource
//! [`Error::InvalidReuse`]: crate::Error::InvalidReuse
mod continuation;
mod shared;
mod state;

pub use continuation::Continuation;
pub(crate) use shared::{CancelHandle, CompletionSlot, Outcome};
