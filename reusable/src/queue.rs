//! An async producer/consumer queue built on pooled futures.
//!
//! Producers and consumers wait on two reusable signals, one for "an item is available" and one
//! for "space is available". Both signals force asynchronous continuations, so a producer never
//! runs a consumer's code on its own stack and vice versa.
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::cancel::CancellationToken;
use crate::{pooled, CompletionSource, Error, PooledFuture, Result};

/// Lifecycle of a [`BoundedAsyncQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting items.
    Open,
    /// No more items are accepted; buffered items can still be dequeued.
    Closing,
    /// No more items are accepted and the buffer is empty.
    Closed,
}

struct Shared<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    adding_completed: AtomicBool,
    item_available: CompletionSource<()>,
    space_available: CompletionSource<()>,
}

/// A FIFO queue whose `enqueue` waits while it is full and whose `dequeue` waits while it is
/// empty. A capacity of zero means unbounded.
///
/// At most one enqueue and one dequeue may be in flight at a time.
pub struct BoundedAsyncQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedAsyncQueue<T> {
    fn clone(&self) -> Self {
        BoundedAsyncQueue {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for BoundedAsyncQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedAsyncQueue")
            .field("capacity", &self.shared.capacity)
            .field("count", &self.shared.items.lock().len())
            .field(
                "adding_completed",
                &self.shared.adding_completed.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl<T: Send + 'static> Default for BoundedAsyncQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T: Send + 'static> BoundedAsyncQueue<T> {
    /// A queue holding at most `capacity` items. Zero means unbounded.
    pub fn new(capacity: usize) -> Self {
        BoundedAsyncQueue {
            shared: Arc::new(Shared {
                capacity,
                items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                adding_completed: AtomicBool::new(false),
                item_available: CompletionSource::with_forced_async(),
                space_available: CompletionSource::with_forced_async(),
            }),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_bounded(&self) -> bool {
        self.shared.capacity > 0
    }

    pub fn count(&self) -> usize {
        self.shared.items.lock().len()
    }

    pub fn is_adding_completed(&self) -> bool {
        self.shared.adding_completed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> QueueState {
        if !self.is_adding_completed() {
            QueueState::Open
        } else if self.count() == 0 {
            QueueState::Closed
        } else {
            QueueState::Closing
        }
    }

    /// Stop accepting items. Pending and future dequeues drain the buffer, then fail with
    /// [`Error::InvalidOperation`]. Calling this again has no effect.
    pub fn complete_adding(&self) {
        if self.shared.adding_completed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("queue closed for adding");
        self.shared.item_available.try_set_result(());
    }

    pub fn enqueue(&self, value: T) -> PooledFuture<()> {
        self.enqueue_with_cancel(value, CancellationToken::none())
    }

    /// Add `value` to the back of the queue, waiting for space if the queue is full.
    ///
    /// Fails with [`Error::Canceled`] if `token` is canceled before the item is stored (the item
    /// is dropped), or with [`Error::InvalidOperation`] if adding has been completed. Dropping
    /// the returned future while it waits for space drops the item without storing it.
    pub fn enqueue_with_cancel(&self, value: T, token: CancellationToken) -> PooledFuture<()> {
        let shared = Arc::clone(&self.shared);
        pooled(async move {
            let mut value = Some(value);
            loop {
                if token.is_canceled() {
                    return Err(Error::Canceled);
                }
                if shared.adding_completed.load(Ordering::Acquire) {
                    return Err(Error::InvalidOperation("the queue is not accepting items"));
                }
                let signal = {
                    let mut items = shared.items.lock();
                    if shared.capacity == 0 || items.len() < shared.capacity {
                        if let Some(value) = value.take() {
                            items.push_back(value);
                        }
                        let len = items.len();
                        drop(items);
                        if len == 1 {
                            shared.item_available.try_set_result(());
                        }
                        return Ok(());
                    }
                    shared.space_available.future()
                };
                wait(signal, &token).await?;
            }
        })
    }

    pub fn dequeue(&self) -> PooledFuture<T> {
        self.dequeue_with_cancel(CancellationToken::none())
    }

    /// Remove the item at the front of the queue, waiting for one if the queue is empty.
    ///
    /// Fails with [`Error::Canceled`] if `token` is canceled first, or with
    /// [`Error::InvalidOperation`] once adding has been completed and the queue is drained.
    /// Dropping the returned future while it waits gives up the wait without consuming an item;
    /// an item it had already removed is dropped with it.
    pub fn dequeue_with_cancel(&self, token: CancellationToken) -> PooledFuture<T> {
        let shared = Arc::clone(&self.shared);
        pooled(async move {
            loop {
                if token.is_canceled() {
                    return Err(Error::Canceled);
                }
                let signal = {
                    let mut items = shared.items.lock();
                    if let Some(value) = items.pop_front() {
                        let len = items.len();
                        drop(items);
                        if shared.capacity > 0 && len + 1 == shared.capacity {
                            shared.space_available.try_set_result(());
                        }
                        return Ok(value);
                    }
                    if shared.adding_completed.load(Ordering::Acquire) {
                        return Err(Error::InvalidOperation(
                            "the queue is empty and not accepting items",
                        ));
                    }
                    shared.item_available.future()
                };
                wait(signal, &token).await?;
            }
        })
    }
}

// Await a signal, completing it with a cancellation if the token fires first.
async fn wait(signal: PooledFuture<()>, token: &CancellationToken) -> Result<()> {
    let _registration = signal
        .cancel_handle()
        .map(|handle| token.register(move || {
            handle.cancel();
        }));
    signal.await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CancellationSource;
    use futures::executor::block_on;
    use std::time::Duration;

    #[test]
    fn test_fifo() {
        let queue = BoundedAsyncQueue::unbounded();
        block_on(async {
            for i in 0..10 {
                queue.enqueue(i).await.unwrap();
            }
            for i in 0..10 {
                assert_eq!(queue.dequeue().await.unwrap(), i);
            }
        });
        assert_eq!(queue.count(), 0);
        assert!(!queue.is_bounded());
    }

    #[test]
    fn test_dequeue_waits_for_enqueue() {
        let queue = BoundedAsyncQueue::new(4);
        let pending = queue.dequeue();
        assert!(!pending.is_ready());
        assert!(block_on(queue.enqueue(9)).is_ok());
        assert_eq!(block_on(pending).unwrap(), 9);
    }

    #[test]
    fn test_capacity_one_back_pressure() {
        let queue = BoundedAsyncQueue::new(1);
        assert!(queue.enqueue(1).is_ready());
        let second = queue.enqueue(2);
        assert!(!second.is_ready());
        assert_eq!(queue.count(), 1);

        assert_eq!(block_on(queue.dequeue()).unwrap(), 1);
        block_on(second).unwrap();
        assert_eq!(queue.count(), 1);
        assert_eq!(block_on(queue.dequeue()).unwrap(), 2);
    }

    #[test]
    fn test_complete_adding() {
        let queue = BoundedAsyncQueue::new(2);
        block_on(queue.enqueue(1)).unwrap();
        queue.complete_adding();
        queue.complete_adding();
        assert_eq!(queue.state(), QueueState::Closing);
        assert!(block_on(queue.enqueue(2))
            .unwrap_err()
            .is_invalid_operation());
        assert_eq!(block_on(queue.dequeue()).unwrap(), 1);
        assert_eq!(queue.state(), QueueState::Closed);
        assert!(block_on(queue.dequeue())
            .unwrap_err()
            .is_invalid_operation());
    }

    #[test]
    fn test_complete_adding_wakes_waiting_consumer() {
        let queue = BoundedAsyncQueue::<u8>::new(2);
        let pending = queue.dequeue();
        assert!(!pending.is_ready());
        queue.complete_adding();
        assert!(block_on(pending).unwrap_err().is_invalid_operation());
    }

    #[test]
    fn test_pre_canceled_dequeue_fails_synchronously() {
        let queue = BoundedAsyncQueue::<u8>::new(2);
        let source = CancellationSource::new();
        source.cancel();
        let mut fut = queue.dequeue_with_cancel(source.token());
        assert!(fut.is_ready());
        assert!(fut.get_result().unwrap_err().is_canceled());
    }

    #[test]
    fn test_cancel_pending_dequeue() {
        let queue = BoundedAsyncQueue::<u8>::new(2);
        let source = CancellationSource::new();
        let pending = queue.dequeue_with_cancel(source.token());
        assert!(!pending.is_ready());
        source.cancel();
        assert!(block_on(pending).unwrap_err().is_canceled());

        // The queue keeps working after a canceled wait.
        block_on(queue.enqueue(3)).unwrap();
        assert_eq!(block_on(queue.dequeue()).unwrap(), 3);
    }

    #[test]
    fn test_cancel_pending_enqueue_drops_item() {
        let queue = BoundedAsyncQueue::new(1);
        block_on(queue.enqueue(1)).unwrap();
        let source = CancellationSource::new();
        let pending = queue.enqueue_with_cancel(2, source.token());
        source.cancel();
        assert!(block_on(pending).unwrap_err().is_canceled());
        assert_eq!(queue.count(), 1);
        assert_eq!(block_on(queue.dequeue()).unwrap(), 1);
    }

    #[test]
    fn test_threaded_producer_consumer() {
        const ITEMS: u64 = 2_000;
        let queue = BoundedAsyncQueue::new(fastrand::usize(1..8));
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                block_on(async {
                    for i in 0..ITEMS {
                        queue.enqueue(i).await.unwrap();
                        if fastrand::u8(..) < 8 {
                            std::thread::sleep(Duration::from_micros(50));
                        }
                    }
                    queue.complete_adding();
                })
            })
        };
        let received = block_on(async {
            let mut received = Vec::new();
            loop {
                match queue.dequeue().await {
                    Ok(value) => received.push(value),
                    Err(err) => {
                        assert!(err.is_invalid_operation());
                        break received;
                    }
                }
            }
        });
        producer.join().unwrap();
        assert_eq!(received, (0..ITEMS).collect::<Vec<_>>());
    }

    #[test]
    fn test_dropped_dequeue_leaves_item_buffered() {
        let queue = BoundedAsyncQueue::new(4);
        let abandoned = queue.dequeue();
        assert!(!abandoned.is_ready());
        drop(abandoned);

        block_on(queue.enqueue(7)).unwrap();
        assert_eq!(queue.count(), 1);
        assert_eq!(block_on(queue.dequeue()).unwrap(), 7);

        let pending = queue.dequeue();
        block_on(queue.enqueue(8)).unwrap();
        assert_eq!(block_on(pending).unwrap(), 8);
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn test_dropped_enqueue_does_not_store_item() {
        let queue = BoundedAsyncQueue::new(1);
        block_on(queue.enqueue(1)).unwrap();
        let abandoned = queue.enqueue(2);
        assert!(!abandoned.is_ready());
        drop(abandoned);

        assert_eq!(block_on(queue.dequeue()).unwrap(), 1);
        block_on(queue.enqueue(3)).unwrap();
        assert_eq!(queue.count(), 1);
        assert_eq!(block_on(queue.dequeue()).unwrap(), 3);
    }

    #[test]
    fn test_cancel_races_enqueue() {
        for _ in 0..500 {
            let queue = BoundedAsyncQueue::new(2);
            let source = CancellationSource::new();
            let pending = queue.dequeue_with_cancel(source.token());
            let producer = {
                let queue = queue.clone();
                std::thread::spawn(move || block_on(queue.enqueue(1u32)).unwrap())
            };
            let canceler = std::thread::spawn(move || source.cancel());
            producer.join().unwrap();
            canceler.join().unwrap();

            match block_on(pending) {
                Ok(value) => {
                    assert_eq!(value, 1);
                    assert_eq!(queue.count(), 0);
                }
                Err(err) => {
                    assert!(err.is_canceled());
                    assert_eq!(queue.count(), 1);
                }
            }
        }
    }
}
