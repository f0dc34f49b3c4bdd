//! The read-through control flow shared by [`Cached`] and [`BlockingCached`].
//!
//! A call goes through these steps:
//!
//! 1. If the `bypass` predicate holds, the computation runs and nothing else happens.
//! 2. The key is derived. If that fails the computation runs uncached.
//! 3. The store is read. A decodable entry is a hit and is returned right away. Absent entries,
//!    undecodable entries and store failures are all misses.
//! 4. On a miss the computation runs through the [`SingleFlight`] registry, so concurrent misses
//!    of one key compute once. The owner encodes a successful result and writes it back with the
//!    ttl, unless the `condition` predicate rejects the call. Write failures are ignored.
//! 5. The result, or the computation's own error, goes back to every waiting caller.
//!
//! Both front-ends run exactly this flow. [`Cached`] awaits store operations and attached flights,
//! [`BlockingCached`] blocks on them.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{Codec, MsgpackCodec};
use crate::config::{Config, validate_key_prefix};
use crate::error::{CacheError, ConfigError};
use crate::executor::Executor;
use crate::keys::{self, Args, CallSite, DefaultKeyStrategy, KeyError, KeyStrategy};
use crate::observer::{self, CacheObserver, StatsdObserver};
use crate::singleflight::SingleFlight;
use crate::store::{StateStore, Ttl};

mod blocking;
mod suspending;


pub use blocking::BlockingCached;
pub use suspending::Cached;

type Predicate = Arc<dyn Fn(&Args) -> bool + Send + Sync>;

/// Everything a cached function needs, shared by clones of it.
pub(crate) struct CacheCore<C> {
    call_site: CallSite,
    store: Arc<dyn StateStore>,
    codec: C,
    key_strategy: Arc<dyn KeyStrategy>,
    ttl: Ttl,
    condition: Option<Predicate>,
    bypass: Option<Predicate>,
    observer: Arc<dyn CacheObserver>,
    flights: SingleFlight,
}

impl<C> std::fmt::Debug for CacheCore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCore")
            .field("call_site", &self.call_site)
            .field("store", &self.store.name())
            .field("ttl", &self.ttl)
            .field("condition", &self.condition.is_some())
            .field("bypass", &self.bypass.is_some())
            .finish()
    }
}

impl<C: Codec> CacheCore<C> {
    fn key(&self, args: &Args) -> Result<String, KeyError> {
        keys::derive_key(self.key_strategy.as_ref(), &self.call_site, args)
    }

    /// Derives the key, reporting failures against the call site.
    fn derive(&self, args: &Args) -> Option<String> {
        match self.key(args) {
            Ok(key) => Some(key),
            Err(err) => {
                self.report(self.call_site.as_str(), CacheError::KeyDerivation(err));
                None
            }
        }
    }

    fn evaluate(&self, predicate: &Predicate, args: &Args, name: &str) -> Option<bool> {
        match panic::catch_unwind(AssertUnwindSafe(|| predicate(args))) {
            Ok(verdict) => Some(verdict),
            Err(_) => {
                tracing::error!("The {} predicate of {} panicked", name, self.call_site);
                None
            }
        }
    }

    /// Whether the call skips the cache entirely. A panicking predicate does not bypass.
    fn bypassed(&self, args: &Args) -> bool {
        match self.bypass {
            Some(ref bypass) => self.evaluate(bypass, args, "bypass").unwrap_or(false),
            None => false,
        }
    }

    /// Whether a computed result may be written. A panicking predicate prevents the write.
    fn should_store(&self, args: &Args) -> bool {
        match self.condition {
            Some(ref condition) => self.evaluate(condition, args, "condition").unwrap_or(false),
            None => true,
        }
    }

    fn observe(&self, event: impl FnOnce(&dyn CacheObserver)) {
        observer::notify(self.observer.as_ref(), event);
    }

    /// Logs a cache-path failure and hands it to the observer.
    fn report(&self, key: &str, error: CacheError) {
        {
            let stderr: &dyn std::error::Error = &error;
            match error {
                CacheError::Store(_) => {
                    tracing::error!(stderr, key, "Error accessing {} cache", self.store.name())
                }
                _ => tracing::warn!(stderr, key, "Caching {} failed", self.call_site),
            }
        }
        self.observe(|o| o.on_error(key, &error));
    }

    /// Reads and decodes the entry under `key`. Anything but a clean hit is a miss.
    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let start = Instant::now();
        let bytes = match self.store.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.observe(|o| o.on_miss(key, start.elapsed()));
                return None;
            }
            Err(err) => {
                self.report(key, err.into());
                self.observe(|o| o.on_miss(key, start.elapsed()));
                return None;
            }
        };

        match self.codec.decode(&bytes) {
            Ok(value) => {
                self.observe(|o| o.on_hit(key, start.elapsed()));
                Some(value)
            }
            Err(err) => {
                self.report(key, CacheError::Decode(err));
                self.observe(|o| o.on_miss(key, start.elapsed()));
                None
            }
        }
    }

    /// Encodes `value` and writes it under `key`, best-effort.
    async fn write<T: Serialize + Sync>(&self, key: &str, value: &T) {
        let bytes = match self.codec.encode(value) {
            Ok(bytes) => bytes,
            Err(err) => return self.report(key, CacheError::Encode(err)),
        };
        let size = bytes.len();
        match self.store.put(key, bytes, self.ttl).await {
            Ok(()) => self.observe(|o| o.on_write(key, size)),
            Err(err) => self.report(key, err.into()),
        }
    }

    /// Deletes the entry under `key`, best-effort. Returns whether the store confirmed.
    async fn remove(&self, key: &str) -> bool {
        match self.store.delete(key).await {
            Ok(()) => {
                tracing::debug!("Invalidated {}", key);
                true
            }
            Err(err) => {
                self.report(key, err.into());
                false
            }
        }
    }
}

/// Configures a cached function.
///
/// Created by [`Cached::builder`] or [`BlockingCached::builder`]. Settings not made here fall
/// back to the process-wide [`Config`], then to the environment, then to built-in defaults.
pub struct CacheBuilder<C = MsgpackCodec> {
    call_site: CallSite,
    codec: C,
    ttl_seconds: Option<u64>,
    key_prefix: Option<String>,
    key_strategy: Option<Arc<dyn KeyStrategy>>,
    condition: Option<Predicate>,
    bypass: Option<Predicate>,
    observer: Option<Arc<dyn CacheObserver>>,
    flights: Option<SingleFlight>,
    executor: Option<Executor>,
    config: Option<Config>,
}

impl CacheBuilder {
    pub(crate) fn new(call_site: CallSite) -> Self {
        Self {
            call_site,
            codec: MsgpackCodec,
            ttl_seconds: None,
            key_prefix: None,
            key_strategy: None,
            condition: None,
            bypass: None,
            observer: None,
            flights: None,
            executor: None,
            config: None,
        }
    }
}

impl<C: Codec> CacheBuilder<C> {
    /// Time-to-live of written entries. Zero is rejected when building.
    pub fn ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    /// Namespace of the keys. Defaults to the name of the store.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Replaces key derivation entirely. The prefix is then up to the strategy.
    pub fn key_strategy(mut self, strategy: impl KeyStrategy) -> Self {
        self.key_strategy = Some(Arc::new(strategy));
        self
    }

    pub fn codec<C2: Codec>(self, codec: C2) -> CacheBuilder<C2> {
        CacheBuilder {
            call_site: self.call_site,
            codec,
            ttl_seconds: self.ttl_seconds,
            key_prefix: self.key_prefix,
            key_strategy: self.key_strategy,
            condition: self.condition,
            bypass: self.bypass,
            observer: self.observer,
            flights: self.flights,
            executor: self.executor,
            config: self.config,
        }
    }

    /// Only results of calls for which `condition` holds are written to the store.
    pub fn condition(mut self, condition: impl Fn(&Args) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Calls for which `bypass` holds skip the cache and always compute.
    pub fn bypass(mut self, bypass: impl Fn(&Args) -> bool + Send + Sync + 'static) -> Self {
        self.bypass = Some(Arc::new(bypass));
        self
    }

    /// Receives the events of this function. Defaults to [`StatsdObserver`].
    pub fn observer(mut self, observer: impl CacheObserver) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Deduplicates through `flights` instead of [`SingleFlight::global`].
    pub fn single_flight(mut self, flights: SingleFlight) -> Self {
        self.flights = Some(flights);
        self
    }

    /// The executor a [`BlockingCached`] drives the store with. Defaults to [`Executor::global`].
    pub fn executor(mut self, executor: Executor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Process-wide defaults for everything not set on this builder.
    pub fn config(mut self, config: &Config) -> Self {
        self.config = Some(config.clone());
        self
    }

    fn core(
        self,
        store: Arc<dyn StateStore>,
    ) -> Result<(CacheCore<C>, Option<Executor>), ConfigError> {
        let config = self.config.unwrap_or_default();

        let ttl = match self.ttl_seconds {
            Some(secs) => Ttl::from_secs(secs)?,
            None => config.default_ttl()?,
        };

        let prefix = match self.key_prefix {
            Some(ref prefix) => validate_key_prefix(prefix)?.to_owned(),
            None => match config.key_prefix()? {
                Some(prefix) => prefix.to_owned(),
                None => validate_key_prefix(store.name())?.to_owned(),
            },
        };
        let key_strategy = match self.key_strategy {
            Some(strategy) => strategy,
            None => Arc::new(DefaultKeyStrategy::new(prefix)),
        };

        let core = CacheCore {
            call_site: self.call_site,
            store,
            codec: self.codec,
            key_strategy,
            ttl,
            condition: self.condition,
            bypass: self.bypass,
            observer: self
                .observer
                .unwrap_or_else(|| Arc::new(StatsdObserver)),
            flights: self
                .flights
                .unwrap_or_else(|| SingleFlight::global().clone()),
        };
        Ok((core, self.executor))
    }

    /// Builds an async cached function on top of `store`.
    pub fn build(self, store: impl StateStore) -> Result<Cached<C>, ConfigError> {
        let (core, _) = self.core(Arc::new(store))?;
        Ok(Cached::from_core(core))
    }

    /// Builds a blocking cached function on top of `store`.
    pub fn build_blocking(self, store: impl StateStore) -> Result<BlockingCached<C>, ConfigError> {
        let (core, executor) = self.core(Arc::new(store))?;
        let executor = executor.unwrap_or_else(|| Executor::global().clone());
        Ok(BlockingCached::from_core(core, executor))
    }
}
