use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{Codec, MsgpackCodec};
use crate::error::CacheError;
use crate::executor::Executor;
use crate::keys::{Args, CallSite, KeyError};
use crate::store::{StoreError, Ttl};

use super::{CacheBuilder, CacheCore};

/// A blocking function memoized in a remote state store.
///
/// Behaves exactly like [`Cached`](super::Cached), but every operation blocks the calling thread.
/// Store operations are driven by an [`Executor`]. None of the methods may be called from within
/// an async context.
pub struct BlockingCached<C = MsgpackCodec> {
    core: Arc<CacheCore<C>>,
    executor: Executor,
}

impl<C> Clone for BlockingCached<C> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            executor: self.executor.clone(),
        }
    }
}

impl<C> std::fmt::Debug for BlockingCached<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingCached")
            .field("core", &self.core)
            .field("executor", &self.executor)
            .finish()
    }
}

impl BlockingCached {
    pub fn builder(call_site: CallSite) -> CacheBuilder {
        CacheBuilder::new(call_site)
    }
}

impl<C: Codec> BlockingCached<C> {
    pub(super) fn from_core(core: CacheCore<C>, executor: Executor) -> Self {
        Self {
            core: Arc::new(core),
            executor,
        }
    }

    /// Returns the cached result for `args`, or computes it with `producer`.
    ///
    /// See [`Cached::call`](super::Cached::call). The owner of a computation runs `producer` on
    /// the calling thread, concurrent callers of the same key block until it is done.
    ///
    /// # Panics
    ///
    /// Panics when `producer` panics, and when called from within an async context.
    pub fn call<T, E, F>(&self, args: Args, producer: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        let core = &self.core;
        if core.bypassed(&args) {
            tracing::trace!("Bypassing cache for {}", core.call_site);
            return producer();
        }
        let Some(key) = core.derive(&args) else {
            return producer();
        };

        if let Some(value) = self.drive(&key, core.lookup(&key)).flatten() {
            return Ok(value);
        }

        core.flights.run_blocking(&key, || {
            let value = producer()?;
            if core.should_store(&args) {
                self.drive(&key, core.write(&key, &value));
            }
            Ok(value)
        })
    }

    /// Removes the entry cached for `args`. See [`Cached::invalidate`](super::Cached::invalidate).
    pub fn invalidate(&self, args: &Args) -> bool {
        match self.core.derive(args) {
            Some(key) => self.drive(&key, self.core.remove(&key)).unwrap_or(false),
            None => false,
        }
    }

    /// The key `args` are cached under.
    pub fn key(&self, args: &Args) -> Result<String, KeyError> {
        self.core.key(args)
    }

    pub fn call_site(&self) -> &CallSite {
        &self.core.call_site
    }

    pub fn ttl(&self) -> Ttl {
        self.core.ttl
    }

    /// Runs a store operation to completion. A broken executor counts as an unreachable store.
    fn drive<F: Future>(&self, key: &str, future: F) -> Option<F::Output> {
        match self.executor.block_on(future) {
            Ok(output) => Some(output),
            Err(err) => {
                let err = anyhow::Error::new(err).context("cache executor unavailable");
                self.core
                    .report(key, CacheError::Store(StoreError::Connection(err)));
                None
            }
        }
    }
}
