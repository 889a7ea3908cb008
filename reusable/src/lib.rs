//! Pooled, reusable one-shot futures.
//!
//! Deep `async` call chains allocate at every level: each `async fn` that suspends needs a home
//! for its state machine and a place to publish its result. This crate recycles both.
//!
//! * [`pooled`] runs an `async` block as a [`PooledFuture`]. If the block finishes without
//!   suspending, its result is returned inline. Otherwise the block is parked in a state box and
//!   its result travels through a completion slot; both are taken from per-type pools and go back
//!   to them when the result has been consumed.
//! * [`CompletionSource`] is a manually completed future that can be completed, awaited, and
//!   completed again.
//! * [`BoundedAsyncQueue`] is a producer/consumer queue whose waits are pooled futures.
//!
//! A pooled future is a one-shot handle: await it once, register at most one continuation on it,
//! and do not keep it after its result has been taken. Misuse is detected and reported as
//! [`Error::InvalidReuse`].
//!
//! ### Where continuations run
//!
//! A suspended future remembers the [`ExecutionContext`] that was ambient (see [`dispatch::enter`])
//! when it suspended. When its result arrives, the continuation is posted to that context, run
//! inline if that context is already running, or handed to a shared pool of worker threads. See
//! [`ContinuationDispatcher`].
//!
//! ```
//! use futures_lite::future::block_on;
//! use reusable::{pooled, BoundedAsyncQueue};
//!
//! let queue = BoundedAsyncQueue::new(1);
//! let producer = queue.clone();
//! let total = pooled(async move {
//!     let mut total = 0;
//!     for _ in 0..3 {
//!         total += queue.dequeue().await?;
//!     }
//!     Ok(total)
//! });
//! block_on(async {
//!     for i in 1..=3 {
//!         producer.enqueue(i).await.unwrap();
//!     }
//! });
//! assert_eq!(total.wait().unwrap(), 6);
//! ```
#![warn(missing_debug_implementations, rust_2018_idioms)]

mod builder;
mod cancel;
mod config;
pub mod dispatch;
mod error;
mod future;
mod pool;
mod queue;
mod slot;
mod source;

pub use crate::builder::{cached_slots, clear_slot_pool, pooled, FutureFactory};
pub use crate::cancel::{CancellationSource, CancellationToken, Registration};
pub use crate::config::Config;
pub use crate::dispatch::{
    ContextHandle, ContinuationDispatcher, ExecutionContext, Route, WorkItem,
};
pub use crate::error::{Error, Result};
pub use crate::future::PooledFuture;
pub use crate::pool::{cached_objects, clear_pools};
pub use crate::queue::{BoundedAsyncQueue, QueueState};
pub use crate::slot::Continuation;
pub use crate::source::CompletionSource;
