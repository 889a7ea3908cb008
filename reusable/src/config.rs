//! Process-wide configuration.
//!
//! A [`Config`] may be installed once, before the first pooled operation runs. After that the
//! defaults (or the installed values) are frozen for the lifetime of the process.
use spin::Once;

use crate::{Error, Result};

const DEFAULT_MAX_POOL_SIZE: usize = 512;
const DEFAULT_THREAD_NAME: &str = "reusable-worker";

static CONFIG: Once<Config> = Once::new();

/// Tunables shared by every pool and by the worker threads.
#[derive(Debug, Clone)]
pub struct Config {
    max_pool_size: usize,
    worker_threads: usize,
    thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            worker_threads: num_cpus::get().max(1),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound on the number of idle objects kept by each pool. Objects returned to a full
    /// pool are dropped.
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Number of threads backing the shared worker pool. Zero is treated as one.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Name prefix given to the worker threads.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Install this configuration for the whole process.
    ///
    /// Fails with [`Error::InvalidOperation`] if a configuration was already installed, or if
    /// a pooled operation already ran and froze the defaults.
    pub fn install(self) -> Result<()> {
        let mut installed = false;
        let current = CONFIG.call_once(|| {
            installed = true;
            self
        });
        if installed {
            log::debug!(
                "installed configuration: max_pool_size={} worker_threads={}",
                current.max_pool_size,
                current.worker_threads
            );
            Ok(())
        } else {
            Err(Error::InvalidOperation(
                "the configuration must be installed before the first pooled operation",
            ))
        }
    }

    /// The active configuration. Freezes the defaults on first call.
    pub fn current() -> &'static Config {
        CONFIG.call_once(Config::default)
    }
}
