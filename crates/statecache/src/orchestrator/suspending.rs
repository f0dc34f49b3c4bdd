use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{Codec, MsgpackCodec};
use crate::keys::{Args, CallSite, KeyError};
use crate::store::Ttl;

use super::{CacheBuilder, CacheCore};

/// An async function memoized in a remote state store.
///
/// Cloning is cheap, clones share all configuration.
///
/// ```no_run
/// # async fn example(store: statecache::MemoryStateStore) -> anyhow::Result<()> {
/// use statecache::{Args, Cached, call_site};
///
/// let double = Cached::builder(call_site!("double"))
///     .ttl_seconds(300)
///     .build(store)?;
///
/// let value: Result<u64, String> = double
///     .call(Args::new().arg(&21), || async { Ok(42) })
///     .await;
/// # Ok(())
/// # }
/// ```
pub struct Cached<C = MsgpackCodec> {
    core: Arc<CacheCore<C>>,
}

impl<C> Clone for Cached<C> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<C> std::fmt::Debug for Cached<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Cached").field(&self.core).finish()
    }
}

impl Cached {
    pub fn builder(call_site: CallSite) -> CacheBuilder {
        CacheBuilder::new(call_site)
    }
}

impl<C: Codec> Cached<C> {
    pub(super) fn from_core(core: CacheCore<C>) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    /// Returns the cached result for `args`, or computes it with `producer`.
    ///
    /// `producer` is only invoked when the store has no usable entry and no other caller is
    /// already computing the same key. Its errors are returned unchanged and never cached. Store
    /// failures of any kind degrade to running `producer`.
    ///
    /// The computation is spawned onto the current runtime. It finishes and writes its result
    /// even if this future is dropped.
    pub async fn call<T, E, F, Fut>(&self, args: Args, producer: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let core = &self.core;
        if core.bypassed(&args) {
            tracing::trace!("Bypassing cache for {}", core.call_site);
            return producer().await;
        }
        let Some(key) = core.derive(&args) else {
            return producer().await;
        };

        if let Some(value) = core.lookup(&key).await {
            return Ok(value);
        }

        let owner = Arc::clone(core);
        let owned_key = key.clone();
        core.flights
            .run(&key, move || async move {
                let value = producer().await?;
                if owner.should_store(&args) {
                    owner.write(&owned_key, &value).await;
                }
                Ok(value)
            })
            .await
    }

    /// Like [`call`](Self::call), for a computation that blocks.
    ///
    /// `producer` runs on tokio's blocking thread pool.
    ///
    /// # Panics
    ///
    /// Panics when `producer` panics.
    pub async fn call_blocking<T, E, F>(&self, args: Args, producer: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.call(args, move || async move {
            match tokio::task::spawn_blocking(producer).await {
                Ok(outcome) => outcome,
                Err(err) => match err.try_into_panic() {
                    Ok(payload) => std::panic::resume_unwind(payload),
                    Err(err) => panic!("blocking computation did not finish: {err}"),
                },
            }
        })
        .await
    }

    /// Removes the entry cached for `args`.
    ///
    /// Returns `true` if the store acknowledged the delete, `false` if it failed. Failures are
    /// reported to the observer, never raised.
    pub async fn invalidate(&self, args: &Args) -> bool {
        match self.core.derive(args) {
            Some(key) => self.core.remove(&key).await,
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
}
