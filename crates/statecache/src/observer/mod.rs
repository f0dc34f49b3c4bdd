//! Notifications about what the cache did.
//!
//! Observers are passive. They are called synchronously on the cache path, so implementations
//! should be quick. A panicking observer is contained and never disturbs the cached call.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::error::CacheError;

mod collector;

pub use collector::{CacheStats, MetricsCollector, StatKind, StatsSummary};

/// Receives hit, miss, write and error events of cached functions.
pub trait CacheObserver: Send + Sync + 'static {
    /// A value for `key` was found and decoded. `latency` covers the store read and decoding.
    fn on_hit(&self, key: &str, latency: Duration) {
        let _ = (key, latency);
    }

    /// No usable value was found for `key`.
    fn on_miss(&self, key: &str, latency: Duration) {
        let _ = (key, latency);
    }

    /// `size` encoded bytes were written for `key`.
    fn on_write(&self, key: &str, size: usize) {
        let _ = (key, size);
    }

    /// The cache path failed for `key`. The call itself carries on without the cache.
    ///
    /// When the key could not be derived, `key` is the call site.
    fn on_error(&self, key: &str, error: &CacheError) {
        let _ = (key, error);
    }
}

impl<O: CacheObserver + ?Sized> CacheObserver for Arc<O> {
    fn on_hit(&self, key: &str, latency: Duration) {
        (**self).on_hit(key, latency)
    }

    fn on_miss(&self, key: &str, latency: Duration) {
        (**self).on_miss(key, latency)
    }

    fn on_write(&self, key: &str, size: usize) {
        (**self).on_write(key, size)
    }

    fn on_error(&self, key: &str, error: &CacheError) {
        (**self).on_error(key, error)
    }
}

/// Invokes `notify` on `observer`, swallowing any panic.
pub(crate) fn notify(observer: &dyn CacheObserver, notify: impl FnOnce(&dyn CacheObserver)) {
    if panic::catch_unwind(AssertUnwindSafe(|| notify(observer))).is_err() {
        tracing::warn!("Cache observer panicked");
    }
}

/// Ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl CacheObserver for NoopObserver {}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl CacheObserver for LoggingObserver {
    fn on_hit(&self, key: &str, latency: Duration) {
        tracing::debug!(key, ?latency, "cache hit");
    }

    fn on_miss(&self, key: &str, latency: Duration) {
        tracing::debug!(key, ?latency, "cache miss");
    }

    fn on_write(&self, key: &str, size: usize) {
        tracing::debug!(key, size, "cache write");
    }

    fn on_error(&self, key: &str, error: &CacheError) {
        let error: &dyn std::error::Error = error;
        tracing::warn!(key, error, "cache error");
    }
}

/// Reports events to statsd via the [`metric!`](crate::metric) macro.
///
/// Keys are not used as tags, their cardinality is unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsdObserver;

impl CacheObserver for StatsdObserver {
    fn on_hit(&self, _key: &str, latency: Duration) {
        metric!(counter("cache.access") += 1, "hit" => "true");
        metric!(timer("cache.lookup.duration") = latency, "hit" => "true");
    }

    fn on_miss(&self, _key: &str, latency: Duration) {
        metric!(counter("cache.access") += 1, "hit" => "false");
        metric!(timer("cache.lookup.duration") = latency, "hit" => "false");
    }

    fn on_write(&self, _key: &str, size: usize) {
        metric!(counter("cache.write") += 1);
        metric!(histogram("cache.write.bytes") = size as u64);
    }

    fn on_error(&self, _key: &str, error: &CacheError) {
        metric!(counter("cache.error") += 1, "kind" => error.kind());
    }
}

/// Forwards every event to all of its observers, in order.
#[derive(Clone, Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn CacheObserver>>,
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: impl CacheObserver) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn push(&mut self, observer: Arc<dyn CacheObserver>) {
        self.observers.push(observer);
    }

    fn each(&self, f: impl Fn(&dyn CacheObserver)) {
        // one misbehaving observer must not starve the others
        for observer in &self.observers {
            notify(observer.as_ref(), &f);
        }
    }
}

impl CacheObserver for CompositeObserver {
    fn on_hit(&self, key: &str, latency: Duration) {
        self.each(|o| o.on_hit(key, latency));
    }

    fn on_miss(&self, key: &str, latency: Duration) {
        self.each(|o| o.on_miss(key, latency));
    }

    fn on_write(&self, key: &str, size: usize) {
        self.each(|o| o.on_write(key, size));
    }

    fn on_error(&self, key: &str, error: &CacheError) {
        self.each(|o| o.on_error(key, error));
    }
}
