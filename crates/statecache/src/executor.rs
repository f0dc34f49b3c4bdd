//! Drives store operations for callers that cannot `.await`.

use std::future::Future;
use std::io;
use std::sync::{Arc, OnceLock};

use tokio::runtime::{Builder, Runtime};

/// A lazily started tokio runtime used by [`BlockingCached`](crate::BlockingCached).
///
/// The runtime is only built on first use. Executors are cheap to clone and clones share the
/// runtime. The pool size is an implementation detail.
#[derive(Clone, Debug)]
pub struct Executor {
    runtime: Arc<OnceLock<Runtime>>,
    worker_threads: usize,
}

impl Default for Executor {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::new(cpus.clamp(1, 4))
    }
}

impl Executor {
    pub fn new(worker_threads: usize) -> Self {
        Self {
            runtime: Arc::default(),
            worker_threads: worker_threads.max(1),
        }
    }

    /// The executor shared by the whole process.
    pub fn global() -> &'static Executor {
        static GLOBAL: OnceLock<Executor> = OnceLock::new();
        GLOBAL.get_or_init(Executor::default)
    }

    fn runtime(&self) -> io::Result<&Runtime> {
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime);
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .thread_name("statecache-worker")
            .enable_all()
            .build()?;
        tracing::debug!("Started cache executor with {} workers", self.worker_threads);
        // when racing another thread, the losing runtime is dropped right here
        Ok(self.runtime.get_or_init(|| runtime))
    }

    /// Blocks the current thread until `future` is done.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async context.
    pub fn block_on<F: Future>(&self, future: F) -> io::Result<F::Output> {
        Ok(self.runtime()?.block_on(future))
    }
}
