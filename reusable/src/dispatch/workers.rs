//! The shared worker pool that runs continuations without an execution context.
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, Thread};

use concurrent_queue::ConcurrentQueue;
use lazy_static::lazy_static;
use spin::Mutex;

use super::{enter_worker_region, WorkItem};
use crate::config::Config;

lazy_static! {
    static ref WORKERS: Workers = Workers::start(Config::current());
}

pub(super) fn global() -> &'static Workers {
    &WORKERS
}

struct Shared {
    queue: ConcurrentQueue<WorkItem>,
    sleepers: Mutex<Vec<Thread>>,
}

pub(super) struct Workers {
    shared: Arc<Shared>,
    threads: usize,
}

impl Workers {
    fn start(config: &Config) -> Workers {
        let shared = Arc::new(Shared {
            queue: ConcurrentQueue::unbounded(),
            sleepers: Mutex::new(Vec::with_capacity(config.worker_threads())),
        });
        let mut threads = 0;
        for id in 0..config.worker_threads() {
            let worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name(), id))
                .spawn(move || worker_loop(worker));
            match spawned {
                Ok(_) => threads += 1,
                Err(err) => log::warn!("failed to spawn worker thread {}: {}", id, err),
            }
        }
        log::debug!("started {} worker threads", threads);
        Workers { shared, threads }
    }

    pub(super) fn submit(&self, item: WorkItem) {
        if self.threads == 0 {
            log::warn!("no worker thread available, running continuation inline");
            return run_item(item);
        }
        if let Err(err) = self.shared.queue.push(item) {
            return run_item(err.into_inner());
        }
        let sleeper = self.shared.sleepers.lock().pop();
        if let Some(thread) = sleeper {
            thread.unpark();
        }
    }
}

fn run_item(item: WorkItem) {
    if panic::catch_unwind(AssertUnwindSafe(|| item.run())).is_err() {
        log::warn!("a continuation panicked on a worker thread");
    }
}

fn worker_loop(shared: Arc<Shared>) {
    enter_worker_region(|| loop {
        while let Ok(item) = shared.queue.pop() {
            run_item(item);
        }

        let me = thread::current();
        {
            let mut sleepers = shared.sleepers.lock();
            if !sleepers.iter().any(|sleeper| sleeper.id() == me.id()) {
                sleepers.push(me.clone());
            }
        }
        // An item pushed before we registered would never unpark us.
        if !shared.queue.is_empty() {
            shared
                .sleepers
                .lock()
                .retain(|sleeper| sleeper.id() != me.id());
            continue;
        }
        thread::park();
    })
}
