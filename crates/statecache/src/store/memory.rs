use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;

use super::{StateStore, StoreError, Ttl};

/// Upper bound for the lifetime of an entry, about a hundred years.
const MAX_LIFETIME: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// An entry together with the point in time it expires at.
#[derive(Clone, Debug)]
struct StoredEntry {
    deadline: Instant,
    bytes: Arc<[u8]>,
}

/// A [`moka::Expiry`] that evicts entries at their own [`StoredEntry::deadline`].
struct EntryExpiration;

impl moka::Expiry<String, StoredEntry> for EntryExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredEntry,
        current_time: Instant,
    ) -> Option<Duration> {
        Some(lifetime(value, current_time))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredEntry,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        Some(lifetime(value, current_time))
    }
}

fn lifetime(entry: &StoredEntry, now: Instant) -> Duration {
    entry.deadline.saturating_duration_since(now).min(MAX_LIFETIME)
}

/// A state store living in process memory.
///
/// Honors ttls like the real thing, which makes it a drop-in for tests and local development.
/// Clones share their contents.
#[derive(Clone)]
pub struct MemoryStateStore {
    name: Arc<str>,
    entries: moka::sync::Cache<String, StoredEntry>,
}

impl std::fmt::Debug for MemoryStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStateStore")
            .field("name", &self.name)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl MemoryStateStore {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        let entries = moka::sync::Cache::builder()
            .expire_after(EntryExpiration)
            .build();
        Self {
            name: name.into(),
            entries,
        }
    }

    /// How long the entry under `key` has left to live.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        entry.deadline.checked_duration_since(Instant::now())
    }

    /// Keys of all live entries, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline > now)
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        keys.sort();
        keys
    }

    fn read(&self, key: &str) -> Option<Vec<u8>> {
        let entry = self.entries.get(key)?;
        (entry.deadline > Instant::now()).then(|| entry.bytes.to_vec())
    }
}

impl StateStore for MemoryStateStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        futures::future::ready(Ok(self.read(key))).boxed()
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Ttl,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        let now = Instant::now();
        let deadline = now
            .checked_add(ttl.as_duration())
            .unwrap_or_else(|| now + MAX_LIFETIME);
        let entry = StoredEntry {
            deadline,
            bytes: value.into(),
        };
        self.entries.insert(key.to_owned(), entry);
        futures::future::ready(Ok(())).boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        self.entries.invalidate(key);
        futures::future::ready(Ok(())).boxed()
    }
}
