//! Decides where a continuation runs once its result is available.
//!
//! Every continuation carries the [`ExecutionContext`] that was ambient when it suspended, if
//! any. The [`ContinuationDispatcher`] then picks, in order:
//!
//! 1. no context, already on a worker thread, not forced: run inline.
//! 2. the captured context is the ambient one, not forced: run inline.
//! 3. a context was captured: post the continuation to it.
//! 4. otherwise: hand it to the shared worker pool.
//!
//! A context becomes ambient for the duration of [`enter`]. Items posted to a context run inside
//! that context's scope, so code resumed there captures it again on its next suspension.
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use scoped_tls::scoped_thread_local;

use crate::slot::Continuation;

mod workers;

/// An executor that accepts continuations, such as a UI loop or a single-threaded runtime.
pub trait ExecutionContext: Send + Sync + 'static {
    /// Queue `work` for execution. Implementations must not run it before returning.
    fn post(&self, work: WorkItem);
}

/// A shared reference to an execution context.
pub type ContextHandle = Arc<dyn ExecutionContext>;

scoped_thread_local!(static CURRENT: ContextHandle);

thread_local! {
    static WORKER_REGION: Cell<bool> = Cell::new(false);
}

/// Run `f` with `context` as the ambient execution context of this thread.
pub fn enter<R>(context: &ContextHandle, f: impl FnOnce() -> R) -> R {
    CURRENT.set(context, f)
}

/// The ambient execution context of this thread, if any.
pub fn current() -> Option<ContextHandle> {
    if CURRENT.is_set() {
        Some(CURRENT.with(|current| Arc::clone(current)))
    } else {
        None
    }
}

fn is_current(context: &ContextHandle) -> bool {
    CURRENT.is_set() && CURRENT.with(|current| same_context(current, context))
}

fn same_context(a: &ContextHandle, b: &ContextHandle) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Whether the current thread is running worker-pool work.
pub fn is_worker_thread() -> bool {
    WORKER_REGION.with(|region| region.get())
}

/// Run `f` as if on a worker thread: continuations without a context may run inline inside it.
/// Threads of the shared pool run all of their work inside this region; executors that own
/// their threads can use it for the same effect.
pub fn enter_worker_region<R>(f: impl FnOnce() -> R) -> R {
    let previous = WORKER_REGION.with(|region| region.replace(true));
    let _restore = scopeguard::guard(previous, |previous| {
        WORKER_REGION.with(|region| region.set(previous))
    });
    f()
}

/// A continuation on its way to an execution context.
pub struct WorkItem {
    continuation: Continuation,
    context: Option<ContextHandle>,
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("continuation", &self.continuation)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

impl WorkItem {
    fn new(continuation: Continuation, context: Option<ContextHandle>) -> Self {
        WorkItem {
            continuation,
            context,
        }
    }

    /// Run the continuation, with the posting context ambient.
    pub fn run(self) {
        let WorkItem {
            continuation,
            context,
        } = self;
        match context {
            Some(context) => enter(&context, move || continuation.invoke()),
            None => continuation.invoke(),
        }
    }
}

/// How a continuation will be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// On the completing thread, before the completing call returns.
    Inline,
    /// Posted to the captured execution context.
    Context,
    /// Queued on the shared worker pool.
    Workers,
}

/// The routing policy for one continuation.
pub struct ContinuationDispatcher {
    context: Option<ContextHandle>,
    force_async: bool,
}

impl fmt::Debug for ContinuationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationDispatcher")
            .field("has_context", &self.context.is_some())
            .field("force_async", &self.force_async)
            .finish()
    }
}

impl ContinuationDispatcher {
    pub fn new(context: Option<ContextHandle>, force_async: bool) -> Self {
        ContinuationDispatcher {
            context,
            force_async,
        }
    }

    /// Where a continuation dispatched from the current thread would run.
    pub fn route(&self) -> Route {
        match &self.context {
            None if !self.force_async && is_worker_thread() => Route::Inline,
            Some(context) if !self.force_async && is_current(context) => Route::Inline,
            Some(_) => Route::Context,
            None => Route::Workers,
        }
    }

    pub fn dispatch(self, continuation: Continuation) {
        match self.route() {
            Route::Inline => continuation.invoke(),
            Route::Context => {
                if let Some(context) = self.context {
                    let target = Arc::clone(&context);
                    target.post(WorkItem::new(continuation, Some(context)));
                }
            }
            Route::Workers => workers::global().submit(WorkItem::new(continuation, None)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A context that queues posted work until drained.
    #[derive(Default)]
    pub(crate) struct QueueContext {
        pub(crate) posted: AtomicUsize,
        pending: spin::Mutex<Vec<WorkItem>>,
    }

    impl ExecutionContext for QueueContext {
        fn post(&self, work: WorkItem) {
            self.posted.fetch_add(1, Ordering::SeqCst);
            self.pending.lock().push(work);
        }
    }

    impl QueueContext {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(QueueContext::default())
        }

        pub(crate) fn posted(&self) -> usize {
            self.posted.load(Ordering::SeqCst)
        }

        /// Run everything posted so far, including work posted while running.
        pub(crate) fn drain(&self) -> usize {
            let mut ran = 0;
            loop {
                let batch = std::mem::take(&mut *self.pending.lock());
                if batch.is_empty() {
                    return ran;
                }
                for item in batch {
                    item.run();
                    ran += 1;
                }
            }
        }
    }

    fn handle(context: &Arc<QueueContext>) -> ContextHandle {
        Arc::clone(context) as ContextHandle
    }

    #[test]
    fn test_routes() {
        let context = QueueContext::new();
        let ctx = handle(&context);

        assert_eq!(ContinuationDispatcher::new(None, false).route(), Route::Workers);
        enter_worker_region(|| {
            assert_eq!(ContinuationDispatcher::new(None, false).route(), Route::Inline);
            assert_eq!(ContinuationDispatcher::new(None, true).route(), Route::Workers);
        });
        assert_eq!(
            ContinuationDispatcher::new(Some(ctx.clone()), false).route(),
            Route::Context
        );
        enter(&ctx, || {
            assert_eq!(
                ContinuationDispatcher::new(Some(ctx.clone()), false).route(),
                Route::Inline
            );
            assert_eq!(
                ContinuationDispatcher::new(Some(ctx.clone()), true).route(),
                Route::Context
            );
        });
    }

    #[test]
    fn test_posted_work_runs_in_context() {
        let context = QueueContext::new();
        let ctx = handle(&context);
        let seen = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&seen);
        let expected = ctx.clone();

        ContinuationDispatcher::new(Some(ctx.clone()), false).dispatch(Continuation::from_fn(
            move || {
                let ambient = current().expect("posted work runs inside its context");
                assert!(same_context(&ambient, &expected));
                observed.fetch_add(1, Ordering::SeqCst);
            },
        ));
        assert_eq!(context.posted(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(context.drain(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(current().is_none());
    }

    #[test]
    fn test_worker_region_restores_on_exit() {
        assert!(!is_worker_thread());
        enter_worker_region(|| {
            assert!(is_worker_thread());
            enter_worker_region(|| assert!(is_worker_thread()));
            assert!(is_worker_thread());
        });
        assert!(!is_worker_thread());
    }

    #[test]
    fn test_workers_run_dispatched_continuation() {
        let (tx, rx) = std::sync::mpsc::channel();
        ContinuationDispatcher::new(None, false).dispatch(Continuation::from_fn(move || {
            tx.send(is_worker_thread()).unwrap();
        }));
        let on_worker = rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .unwrap();
        assert!(on_worker);
    }
}
