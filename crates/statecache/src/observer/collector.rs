use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use super::CacheObserver;
use crate::error::CacheError;

const DEFAULT_MAX_SAMPLES: usize = 1000;

/// Counters and recent samples for one key, or for all keys together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
    /// The most recent hit latencies, oldest first.
    pub hit_latencies: VecDeque<Duration>,
    /// The most recent miss latencies, oldest first.
    pub miss_latencies: VecDeque<Duration>,
    /// The most recent encoded write sizes, oldest first.
    pub write_sizes: VecDeque<usize>,
}

impl CacheStats {
    /// Lookups, that is hits and misses.
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_ratio(&self) -> f64 {
        match self.lookups() {
            0 => 0.0,
            lookups => self.hits as f64 / lookups as f64,
        }
    }

    pub fn average_hit_latency(&self) -> Duration {
        average(&self.hit_latencies)
    }

    pub fn average_miss_latency(&self) -> Duration {
        average(&self.miss_latencies)
    }

    pub fn average_write_size(&self) -> f64 {
        if self.write_sizes.is_empty() {
            return 0.0;
        }
        self.write_sizes.iter().sum::<usize>() as f64 / self.write_sizes.len() as f64
    }

    /// Bytes written, as far as the retained samples go.
    pub fn written_bytes(&self) -> usize {
        self.write_sizes.iter().sum()
    }

    fn count(&self, kind: StatKind) -> u64 {
        match kind {
            StatKind::Hits => self.hits,
            StatKind::Misses => self.misses,
            StatKind::Writes => self.writes,
            StatKind::Errors => self.errors,
        }
    }

    fn summary(&self) -> StatsSummary {
        StatsSummary {
            hits: self.hits,
            misses: self.misses,
            writes: self.writes,
            errors: self.errors,
            hit_ratio: self.hit_ratio(),
            average_hit_latency_ms: millis(self.average_hit_latency()),
            average_miss_latency_ms: millis(self.average_miss_latency()),
            average_write_size: self.average_write_size(),
        }
    }
}

fn average(samples: &VecDeque<Duration>) -> Duration {
    match u32::try_from(samples.len()) {
        Ok(0) | Err(_) => Duration::ZERO,
        Ok(len) => samples.iter().sum::<Duration>() / len,
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_micros() as f64 / 1000.0
}

fn push_bounded<T>(samples: &mut VecDeque<T>, sample: T, max: usize) {
    if max == 0 {
        return;
    }
    while samples.len() >= max {
        samples.pop_front();
    }
    samples.push_back(sample);
}

/// The counter to rank keys by in [`MetricsCollector::top_keys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Hits,
    Misses,
    Writes,
    Errors,
}

/// A serializable digest of [`CacheStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSummary {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
    pub hit_ratio: f64,
    pub average_hit_latency_ms: f64,
    pub average_miss_latency_ms: f64,
    pub average_write_size: f64,
}

#[derive(Debug, Default)]
struct Collected {
    overall: CacheStats,
    keys: HashMap<String, CacheStats>,
}

/// An observer aggregating events in memory, per key and overall.
///
/// Only the most recent latency and size samples are kept, 1000 per series unless configured
/// otherwise.
#[derive(Debug)]
pub struct MetricsCollector {
    max_samples: usize,
    stats: Mutex<Collected>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SAMPLES)
    }
}

impl MetricsCollector {
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples,
            stats: Mutex::default(),
        }
    }

    fn record(&self, key: &str, update: impl Fn(&mut CacheStats, usize)) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut stats.overall, self.max_samples);
        match stats.keys.get_mut(key) {
            Some(per_key) => update(per_key, self.max_samples),
            None => {
                let mut per_key = CacheStats::default();
                update(&mut per_key, self.max_samples);
                stats.keys.insert(key.to_owned(), per_key);
            }
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Collected) -> R) -> R {
        let stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&stats)
    }

    /// Statistics over all keys.
    pub fn overall(&self) -> CacheStats {
        self.read(|stats| stats.overall.clone())
    }

    pub fn key_stats(&self, key: &str) -> Option<CacheStats> {
        self.read(|stats| stats.keys.get(key).cloned())
    }

    /// All keys seen so far, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self.read(|stats| stats.keys.keys().cloned().collect::<Vec<_>>());
        keys.sort();
        keys
    }

    /// The `limit` keys with the highest `kind` count, highest first.
    ///
    /// Keys with a zero count are left out, ties are broken by key.
    pub fn top_keys(&self, kind: StatKind, limit: usize) -> Vec<(String, u64)> {
        let mut ranked: Vec<_> = self.read(|stats| {
            stats
                .keys
                .iter()
                .map(|(key, stats)| (key.clone(), stats.count(kind)))
                .filter(|(_, count)| *count > 0)
                .collect()
        });
        ranked.sort_by(|(a_key, a), (b_key, b)| b.cmp(a).then_with(|| a_key.cmp(b_key)));
        ranked.truncate(limit);
        ranked
    }

    pub fn summary(&self) -> StatsSummary {
        self.read(|stats| stats.overall.summary())
    }

    /// Forgets everything.
    pub fn reset(&self) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *stats = Collected::default();
    }

    /// Forgets the per-key statistics of `key`. Overall statistics are kept.
    pub fn reset_key(&self, key: &str) -> bool {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stats.keys.remove(key).is_some()
    }
}

impl CacheObserver for MetricsCollector {
    fn on_hit(&self, key: &str, latency: Duration) {
        self.record(key, |stats, max| {
            stats.hits += 1;
            push_bounded(&mut stats.hit_latencies, latency, max);
        });
    }

    fn on_miss(&self, key: &str, latency: Duration) {
        self.record(key, |stats, max| {
            stats.misses += 1;
            push_bounded(&mut stats.miss_latencies, latency, max);
        });
    }

    fn on_write(&self, key: &str, size: usize) {
        self.record(key, |stats, max| {
            stats.writes += 1;
            push_bounded(&mut stats.write_sizes, size, max);
        });
    }

    fn on_error(&self, key: &str, _error: &CacheError) {
        self.record(key, |stats, _| stats.errors += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyError;

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn aggregates_per_key_and_overall() {
        let collector = MetricsCollector::default();
        collector.on_miss("a", ms(40));
        collector.on_write("a", 100);
        collector.on_hit("a", ms(2));
        collector.on_hit("a", ms(4));
        collector.on_hit("b", ms(6));
        collector.on_write("b", 300);
        collector.on_error("c", &CacheError::KeyDerivation(KeyError::EmptyKey));

        let a = collector.key_stats("a").unwrap();
        assert_eq!((a.hits, a.misses, a.writes, a.errors), (2, 1, 1, 0));
        assert_eq!(a.average_hit_latency(), ms(3));
        assert!((a.hit_ratio() - 2.0 / 3.0).abs() < 1e-9);

        let overall = collector.overall();
        assert_eq!(overall.lookups(), 4);
        assert_eq!(overall.written_bytes(), 400);
        assert_eq!(overall.average_write_size(), 200.0);
        assert_eq!(collector.keys(), ["a", "b", "c"]);

        insta::assert_debug_snapshot!(collector.summary(), @r"
        StatsSummary {
            hits: 3,
            misses: 1,
            writes: 2,
            errors: 1,
            hit_ratio: 0.75,
            average_hit_latency_ms: 4.0,
            average_miss_latency_ms: 40.0,
            average_write_size: 200.0,
        }
        ");
    }

    #[test]
    fn top_keys() {
        let collector = MetricsCollector::default();
        for (key, hits) in [("x", 3), ("y", 5), ("z", 3), ("w", 0)] {
            for _ in 0..hits {
                collector.on_hit(key, ms(1));
            }
            collector.on_miss(key, ms(1));
        }

        assert_eq!(
            collector.top_keys(StatKind::Hits, 2),
            [("y".to_owned(), 5), ("x".to_owned(), 3)]
        );
        assert_eq!(collector.top_keys(StatKind::Hits, 10).len(), 3);
        assert!(collector.top_keys(StatKind::Errors, 10).is_empty());
    }

    #[test]
    fn samples_are_bounded() {
        let collector = MetricsCollector::new(3);
        for i in 1..=5 {
            collector.on_hit("k", ms(i));
        }
        let stats = collector.key_stats("k").unwrap();
        assert_eq!(stats.hits, 5);
        assert_eq!(stats.hit_latencies, [ms(3), ms(4), ms(5)]);
    }

    #[test]
    fn reset() {
        let collector = MetricsCollector::default();
        collector.on_hit("a", ms(1));
        collector.on_hit("b", ms(1));

        assert!(collector.reset_key("a"));
        assert!(!collector.reset_key("a"));
        assert_eq!(collector.keys(), ["b"]);
        assert_eq!(collector.overall().hits, 2);

        collector.reset();
        assert_eq!(collector.overall(), CacheStats::default());
        assert!(collector.keys().is_empty());
    }
}
