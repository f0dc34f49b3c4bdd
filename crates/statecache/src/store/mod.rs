//! Access to the remote key-value store that holds cached entries.
//!
//! The production backend is the Dapr state API ([`dapr::DaprStateStore`]). An in-process
//! [`memory::MemoryStateStore`] with the same expiry semantics exists for tests and local runs.

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::ConfigError;

pub mod dapr;
pub mod memory;

/// A time-to-live of at least one second.
///
/// Entries never live forever, there is no way to express "no expiration".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ttl(u64);

impl Ttl {
    /// The ttl used when neither the cached function nor the process configure one.
    pub const DEFAULT: Ttl = Ttl(3600);

    pub fn from_secs(secs: u64) -> Result<Self, ConfigError> {
        if secs < 1 {
            return Err(ConfigError::InvalidTtl(secs));
        }
        Ok(Self(secs))
    }

    pub fn as_secs(self) -> u64 {
        self.0
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u64> for Ttl {
    type Error = ConfigError;

    fn try_from(secs: u64) -> Result<Self, Self::Error> {
        Self::from_secs(secs)
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// Errors talking to the state store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("state store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to reach the state store")]
    Connection(#[source] anyhow::Error),
    #[error("unexpected response from the state store")]
    BadResponse(#[source] anyhow::Error),
}

impl StoreError {
    /// A short, stable name of the error kind, used as a metric tag.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Timeout(_) => "timeout",
            StoreError::Connection(_) => "connection",
            StoreError::BadResponse(_) => "bad-response",
        }
    }
}

/// The get/put/delete contract of a remote key-value store.
///
/// Implementations are shared between concurrent calls and must bound every operation in time.
/// They neither cache nor retry.
pub trait StateStore: Send + Sync + 'static {
    /// The name of the store, which is also the default key prefix of functions cached in it.
    fn name(&self) -> &str;

    /// Reads the bytes stored under `key`, `None` if there is no live entry.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>>;

    /// Writes `value` under `key`, to expire after `ttl`.
    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Ttl,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Removes `key`. Removing a missing key succeeds.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;
}

impl<S: StateStore + ?Sized> StateStore for std::sync::Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        (**self).get(key)
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Ttl,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        (**self).put(key, value, ttl)
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        (**self).delete(key)
    }
}
