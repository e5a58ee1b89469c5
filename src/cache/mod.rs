//! Segmented TTL/LRU cache.
//!
//! [`Cache`] is a process-local key/value store partitioned into named
//! *segments*. Every entry lives under a `(segment, key)` pair, carries an
//! optional expiry, and remembers when it was last read.
//!
//! ## Eviction
//!
//! Before a new key is inserted:
//!
//! 1. if its segment has a capacity limit and is full, the segment's least
//!    recently accessed entry is evicted;
//! 2. if the whole store is at `max_size`, the least recently accessed entry of
//!    any segment is evicted.
//!
//! Overwriting an existing key replaces it in place and evicts nothing.
//!
//! ## Expiry
//!
//! Expired entries are logically absent: [`Cache::get`] treats them as a miss
//! and removes them on the spot. [`Cache::prune`] sweeps the rest.
//!
//! No operation fails. A miss is the only signal.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cadence::cache::{Cache, SetOptions};
//! use cadence::clock::ManualClock;
//! use cadence::config::CacheConfig;
//! use serde_json::json;
//!
//! let clock = Arc::new(ManualClock::new(0));
//! let cache: Cache = Cache::new(&CacheConfig::default(), clock.clone());
//!
//! cache.set("foo", json!("bar"), SetOptions::in_segment("x").ttl(Duration::from_millis(100)));
//! clock.advance(Duration::from_millis(50));
//! assert_eq!(cache.get("foo", "x"), Some(json!("bar")));
//! clock.advance(Duration::from_millis(100));
//! assert_eq!(cache.get("foo", "x"), None);
//! ```

mod store;

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::clock::SharedClock;
use crate::config::CacheConfig;

use store::{EntryKey, Store};

/// Segment used when a caller does not name one.
pub const DEFAULT_SEGMENT: &str = "default";

/// Expiry policy for a single `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ttl {
    /// Use the cache's configured default TTL.
    #[default]
    Default,
    /// Never expire.
    Never,
    /// Expire after the given duration. A zero duration never expires.
    After(Duration),
}

/// Options for [`Cache::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOptions {
    ttl: Ttl,
    segment: String,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self::in_segment(DEFAULT_SEGMENT)
    }
}

impl SetOptions {
    /// Options targeting `segment` with the default TTL.
    pub fn in_segment(segment: impl Into<String>) -> Self {
        Self {
            ttl: Ttl::Default,
            segment: segment.into(),
        }
    }

    /// Expire after `ttl`. `Duration::ZERO` means never.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Ttl::After(ttl);
        self
    }

    /// Keeps the entry until it is deleted or evicted.
    #[must_use]
    pub fn never_expire(mut self) -> Self {
        self.ttl = Ttl::Never;
        self
    }

    /// Segment the entry is stored in.
    pub fn segment(&self) -> &str {
        &self.segment
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_size: usize,
    /// `hits / (hits + misses)`, or `0.0` before the first lookup.
    pub hit_ratio: f64,
    pub segments: BTreeMap<String, SegmentStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentStats {
    pub size: usize,
    pub limit: Option<usize>,
}

/// Bookkeeping timestamps of a live entry, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub created_at: u64,
    pub last_accessed_at: u64,
    pub expires_at: Option<u64>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    sets: u64,
    evictions: u64,
}

struct Inner<V> {
    store: Store<V>,
    counters: Counters,
}

/// Segmented TTL/LRU cache. Values default to [`serde_json::Value`] so one
/// instance can hold the heterogeneous payloads of different segments.
pub struct Cache<V = serde_json::Value> {
    inner: Mutex<Inner<V>>,
    max_size: usize,
    default_ttl: Option<Duration>,
    clock: SharedClock,
}

impl<V: Clone> Cache<V> {
    /// Creates an empty cache with the limits and default TTL from `config`.
    pub fn new(config: &CacheConfig, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner {
                store: Store::new(&config.segment_limits),
                counters: Counters::default(),
            }),
            max_size: config.max_size,
            default_ttl: config.default_ttl(),
            clock,
        }
    }

    // Poisoning is ignored: no mutation leaves the indices inconsistent.
    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expires_at(&self, ttl: Ttl, now: u64) -> Option<u64> {
        let ttl = match ttl {
            Ttl::Default => self.default_ttl?,
            Ttl::Never => return None,
            Ttl::After(d) => d,
        };
        if ttl.is_zero() {
            return None;
        }
        // A deadline past u64 epoch milliseconds is treated as never.
        u64::try_from(ttl.as_millis()).ok().and_then(|ms| now.checked_add(ms))
    }

    /// Returns the value stored under `(segment, key)`.
    ///
    /// A hit refreshes the entry's recency. An expired entry counts as a miss
    /// and is removed.
    pub fn get(&self, key: &str, segment: &str) -> Option<V> {
        let now = self.clock.now_ms();
        let entry_key = EntryKey::new(segment, key);
        let mut guard = self.lock();
        let inner = &mut *guard;

        let expired = match inner.store.get(&entry_key) {
            Some(entry) => entry.is_expired(now),
            None => {
                inner.counters.misses += 1;
                return None;
            }
        };
        if expired {
            inner.store.remove(&entry_key);
            inner.counters.misses += 1;
            return None;
        }

        inner.counters.hits += 1;
        inner.store.touch(&entry_key, now).map(|e| e.value.clone())
    }

    /// Stores `value` and returns it.
    pub fn set(&self, key: &str, value: V, options: SetOptions) -> V {
        let now = self.clock.now_ms();
        let expires_at = self.expires_at(options.ttl, now);
        let entry_key = EntryKey {
            segment: options.segment,
            key: key.to_owned(),
        };
        let mut guard = self.lock();
        let inner = &mut *guard;

        if inner.store.get(&entry_key).is_none() {
            self.make_room(inner, &entry_key.segment);
        }
        inner.store.insert(entry_key, value.clone(), expires_at, now);
        inner.counters.sets += 1;
        value
    }

    // Evicts until there is room, which also restores a limit lowered at
    // runtime. A zero limit leaves the new entry as the only member.
    fn make_room(&self, inner: &mut Inner<V>, segment: &str) {
        if let Some(limit) = inner.store.segment_limit(segment) {
            while inner.store.segment_len(segment) >= limit
                && inner.store.evict_from_segment(segment)
            {
                inner.counters.evictions += 1;
            }
        }
        while inner.store.len() >= self.max_size && inner.store.evict_global() {
            inner.counters.evictions += 1;
        }
    }

    /// Returns the cached value or computes, stores and returns a new one.
    pub fn get_or_insert_with<F>(&self, key: &str, options: SetOptions, f: F) -> V
    where
        F: FnOnce() -> V,
    {
        match self.get(key, options.segment()) {
            Some(value) => value,
            None => self.set(key, f(), options),
        }
    }

    /// Async, fallible variant of [`get_or_insert_with`](Self::get_or_insert_with)
    /// for memoizing database or upstream API results. Errors are returned
    /// unchanged and nothing is cached.
    ///
    /// The lock is not held while `load` runs, so concurrent callers that miss
    /// together may each load; the last one to finish wins.
    pub async fn memoize<F, Fut, E>(&self, key: &str, options: SetOptions, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key, options.segment()) {
            return Ok(value);
        }
        let value = load().await?;
        Ok(self.set(key, value, options))
    }

    /// Returns `true` if a live entry exists. Does not count as an access.
    pub fn contains(&self, key: &str, segment: &str) -> bool {
        let now = self.clock.now_ms();
        self.lock()
            .store
            .get(&EntryKey::new(segment, key))
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Returns timestamps for a live entry without touching it.
    pub fn inspect(&self, key: &str, segment: &str) -> Option<EntryInfo> {
        let now = self.clock.now_ms();
        let inner = self.lock();
        let entry = inner.store.get(&EntryKey::new(segment, key))?;
        if entry.is_expired(now) {
            return None;
        }
        Some(EntryInfo {
            created_at: entry.created_at,
            last_accessed_at: entry.last_accessed_at,
            expires_at: entry.expires_at,
        })
    }

    /// Removes an entry, returning whether one was present.
    pub fn delete(&self, key: &str, segment: &str) -> bool {
        self.lock().store.remove(&EntryKey::new(segment, key)).is_some()
    }

    /// Removes every entry of `segment`, or everything when `None`.
    /// Counters are kept.
    pub fn clear(&self, segment: Option<&str>) -> usize {
        let mut inner = self.lock();
        match segment {
            Some(segment) => inner.store.clear_segment(segment),
            None => inner.store.clear(),
        }
    }

    /// Removes all expired entries and returns how many were dropped.
    pub fn prune(&self) -> usize {
        let now = self.clock.now_ms();
        self.lock().store.prune(now)
    }

    /// Sets or removes a segment's capacity. Takes effect on the next insert.
    pub fn set_segment_limit(&self, segment: &str, limit: Option<usize>) {
        self.lock().store.set_segment_limit(segment, limit);
    }

    /// Number of stored entries, including expired ones not yet removed.
    pub fn len(&self) -> usize {
        self.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segment_len(&self, segment: &str) -> usize {
        self.lock().store.segment_len(segment)
    }

    /// Current size and lifetime hit, miss and eviction counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let c = &inner.counters;
        let lookups = c.hits + c.misses;
        let segments = inner
            .store
            .segments()
            .iter()
            .map(|(name, s)| {
                let stats = SegmentStats {
                    size: s.len(),
                    limit: s.limit,
                };
                (name.clone(), stats)
            })
            .collect();

        CacheStats {
            hits: c.hits,
            misses: c.misses,
            sets: c.sets,
            evictions: c.evictions,
            size: inner.store.len(),
            max_size: self.max_size,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                c.hits as f64 / lookups as f64
            },
            segments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use proptest::collection::vec;
    use proptest::prelude::*;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn cache_with(config: CacheConfig) -> (Cache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (Cache::new(&config, clock.clone()), clock)
    }

    fn small(max_size: usize, limits: &[(&str, usize)]) -> CacheConfig {
        CacheConfig {
            max_size,
            default_ttl_ms: 0,
            segment_limits: limits.iter().map(|(s, l)| (s.to_string(), *l)).collect(),
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn entry_expires_after_ttl_and_counts_a_miss() {
        let (cache, clock) = cache_with(CacheConfig::default());
        cache.set("foo", json!("bar"), SetOptions::in_segment("x").ttl(ms(100)));

        clock.set(50);
        assert_eq!(cache.get("foo", "x"), Some(json!("bar")));
        assert_eq!(cache.stats().misses, 0);

        clock.set(150);
        assert_eq!(cache.get("foo", "x"), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.size, 0, "expired entry is purged on access");
    }

    #[test]
    fn expiry_is_inclusive_of_the_deadline() {
        let (cache, clock) = cache_with(CacheConfig::default());
        cache.set("k", json!(1), SetOptions::default().ttl(ms(10)));
        clock.set(10);
        assert_eq!(cache.get("k", DEFAULT_SEGMENT), None);
    }

    #[test]
    fn zero_ttl_and_never_do_not_expire() {
        let (cache, clock) = cache_with(CacheConfig::default());
        cache.set("zero", json!(0), SetOptions::default().ttl(Duration::ZERO));
        cache.set("never", json!(1), SetOptions::default().never_expire());
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert!(cache.contains("zero", DEFAULT_SEGMENT));
        assert!(cache.contains("never", DEFAULT_SEGMENT));
        assert_eq!(cache.inspect("never", DEFAULT_SEGMENT).unwrap().expires_at, None);
    }

    #[test]
    fn huge_ttl_never_expires() {
        let (cache, clock) = cache_with(CacheConfig {
            default_ttl_ms: u64::MAX,
            ..CacheConfig::default()
        });
        clock.set(1_700_000_000_000);
        cache.set("max", json!(1), SetOptions::default().ttl(Duration::MAX));
        cache.set("default", json!(2), SetOptions::default());
        cache.set("near", json!(3), SetOptions::default().ttl(ms(u64::MAX - 1)));

        for key in ["max", "default", "near"] {
            assert_eq!(cache.inspect(key, DEFAULT_SEGMENT).unwrap().expires_at, None);
            assert!(cache.get(key, DEFAULT_SEGMENT).is_some());
        }
    }

    #[test]
    fn default_ttl_applies_when_unspecified() {
        let (cache, clock) = cache_with(CacheConfig::default());
        cache.set("k", json!(1), SetOptions::default());
        assert_eq!(
            cache.inspect("k", DEFAULT_SEGMENT).unwrap().expires_at,
            Some(300_000)
        );
        clock.set(299_999);
        assert!(cache.get("k", DEFAULT_SEGMENT).is_some());
        clock.set(300_000);
        assert!(cache.get("k", DEFAULT_SEGMENT).is_none());
    }

    #[test]
    fn keys_are_namespaced_by_segment() {
        let (cache, _) = cache_with(CacheConfig::default());
        cache.set("id", json!("recipe"), SetOptions::in_segment("recipes"));
        cache.set("id", json!("ride"), SetOptions::in_segment("strava"));
        assert_eq!(cache.get("id", "recipes"), Some(json!("recipe")));
        assert_eq!(cache.get("id", "strava"), Some(json!("ride")));
        assert!(cache.delete("id", "recipes"));
        assert!(!cache.delete("id", "recipes"));
        assert_eq!(cache.get("id", "strava"), Some(json!("ride")));
    }

    #[test]
    fn segment_limit_evicts_least_recently_accessed_member() {
        let (cache, clock) = cache_with(small(100, &[("weather", 2)]));
        let seg = || SetOptions::in_segment("weather");

        cache.set("a", json!(1), seg());
        clock.advance(ms(1));
        cache.set("b", json!(2), seg());
        clock.advance(ms(1));
        cache.set("other", json!(0), SetOptions::in_segment("recipes"));
        clock.advance(ms(1));
        assert!(cache.get("a", "weather").is_some());
        clock.advance(ms(1));
        cache.set("c", json!(3), seg());

        assert!(cache.contains("a", "weather"));
        assert!(!cache.contains("b", "weather"));
        assert!(cache.contains("c", "weather"));
        assert!(cache.contains("other", "recipes"), "other segments are untouched");
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn global_limit_evicts_least_recently_accessed_anywhere() {
        let (cache, clock) = cache_with(small(3, &[]));
        cache.set("a", json!(1), SetOptions::in_segment("x"));
        clock.advance(ms(1));
        cache.set("b", json!(2), SetOptions::in_segment("y"));
        clock.advance(ms(1));
        cache.set("c", json!(3), SetOptions::in_segment("x"));
        clock.advance(ms(1));
        cache.get("a", "x");
        clock.advance(ms(1));
        cache.set("d", json!(4), SetOptions::in_segment("z"));

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("b", "y"));
        assert!(cache.contains("a", "x"));
        assert!(cache.contains("d", "z"));
    }

    #[test]
    fn zero_capacity_segment_keeps_only_the_newest_entry() {
        let (cache, _) = cache_with(small(100, &[("weather", 0)]));
        cache.set("a", json!(1), SetOptions::in_segment("weather"));
        cache.set("b", json!(2), SetOptions::in_segment("weather"));
        assert_eq!(cache.segment_len("weather"), 1);
        assert!(cache.contains("b", "weather"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn overwrite_does_not_evict() {
        let (cache, _) = cache_with(small(2, &[]));
        cache.set("a", json!(1), SetOptions::default());
        cache.set("b", json!(2), SetOptions::default());
        cache.set("a", json!(10), SetOptions::default());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("a", DEFAULT_SEGMENT), Some(json!(10)));
    }

    #[test]
    fn lowered_limit_is_restored_on_next_insert() {
        let (cache, _) = cache_with(small(100, &[]));
        for i in 0..5 {
            cache.set(&i.to_string(), json!(i), SetOptions::in_segment("s"));
        }
        cache.set_segment_limit("s", Some(2));
        cache.set("new", json!(99), SetOptions::in_segment("s"));
        assert_eq!(cache.segment_len("s"), 2);
        assert!(cache.contains("4", "s"));
        assert!(cache.contains("new", "s"));
    }

    proptest! {
        #[test]
        fn bounds_hold_for_any_operation_sequence(
            ops in vec((0..3usize, 0..40u64, any::<bool>(), 0..3u64), 0..300),
        ) {
            let (cache, clock) = cache_with(small(16, &[("a", 3), ("b", 5)]));
            let segments = ["a", "b", "c"];
            for (segment, key, read, step) in ops {
                let segment = segments[segment];
                if read {
                    cache.get(&key.to_string(), segment);
                } else {
                    cache.set(&key.to_string(), json!(key), SetOptions::in_segment(segment));
                }
                clock.advance(ms(step));

                prop_assert!(cache.len() <= 16);
                prop_assert!(cache.segment_len("a") <= 3);
                prop_assert!(cache.segment_len("b") <= 5);
            }
        }

        #[test]
        fn eviction_takes_the_least_recently_accessed_entry(
            reads in vec(0..8usize, 0..64),
        ) {
            let (cache, clock) = cache_with(small(8, &[]));
            let mut last_access = HashMap::new();
            for key in 0..8usize {
                cache.set(&key.to_string(), json!(key), SetOptions::default());
                last_access.insert(key, clock.now_ms());
                clock.advance(ms(1));
            }
            for key in reads {
                cache.get(&key.to_string(), DEFAULT_SEGMENT);
                last_access.insert(key, clock.now_ms());
                clock.advance(ms(1));
            }
            let oldest = last_access
                .iter()
                .min_by_key(|&(_, at)| *at)
                .map(|(key, _)| *key)
                .unwrap();

            cache.set("new", json!("new"), SetOptions::default());

            prop_assert_eq!(cache.len(), 8);
            prop_assert!(!cache.contains(&oldest.to_string(), DEFAULT_SEGMENT));
            for key in (0..8usize).filter(|&k| k != oldest) {
                prop_assert!(cache.contains(&key.to_string(), DEFAULT_SEGMENT));
            }
        }
    }

    #[test]
    fn clear_segment_removes_exactly_that_segment() {
        let (cache, _) = cache_with(CacheConfig::default());
        cache.set("1", json!(1), SetOptions::in_segment("strava"));
        cache.set("2", json!(2), SetOptions::in_segment("strava"));
        cache.set("1", json!(3), SetOptions::in_segment("weather"));

        assert_eq!(cache.clear(Some("strava")), 2);
        assert_eq!(cache.segment_len("strava"), 0);
        assert!(cache.contains("1", "weather"));
        assert_eq!(cache.clear(Some("strava")), 0);

        cache.clear(None);
        assert!(cache.is_empty());
        cache.clear(None);
    }

    #[test]
    fn prune_sweeps_expired_entries() {
        let (cache, clock) = cache_with(CacheConfig::default());
        cache.set("short", json!(1), SetOptions::default().ttl(ms(10)));
        cache.set("long", json!(2), SetOptions::default().ttl(ms(1_000)));
        clock.set(20);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.prune(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().misses, 0, "pruning is not a lookup");
    }

    #[test]
    fn stats_report_ratio_and_segments() {
        let (cache, _) = cache_with(small(10, &[("weather", 4)]));
        assert_eq!(cache.stats().hit_ratio, 0.0);

        cache.set("k", json!(1), SetOptions::in_segment("weather"));
        cache.get("k", "weather");
        cache.get("k", "weather");
        cache.get("k", "weather");
        cache.get("missing", "weather");

        let stats = cache.stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.hit_ratio, 0.75);
        assert_eq!(stats.max_size, 10);
        assert_eq!(
            stats.segments.get("weather"),
            Some(&SegmentStats { size: 1, limit: Some(4) })
        );
    }

    #[test]
    fn get_refreshes_last_access() {
        let (cache, clock) = cache_with(CacheConfig::default());
        cache.set("k", json!(1), SetOptions::default());
        clock.set(40);
        cache.get("k", DEFAULT_SEGMENT);
        let info = cache.inspect("k", DEFAULT_SEGMENT).unwrap();
        assert_eq!(info.created_at, 0);
        assert_eq!(info.last_accessed_at, 40);
    }

    #[test]
    fn get_or_insert_with_computes_once() {
        let (cache, _) = cache_with(CacheConfig::default());
        let mut calls = 0;
        let first = cache.get_or_insert_with("k", SetOptions::default(), || {
            calls += 1;
            json!("loaded")
        });
        let second = cache.get_or_insert_with("k", SetOptions::default(), || {
            calls += 1;
            json!("again")
        });
        assert_eq!(first, second);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn memoize_caches_successes_only() {
        let (cache, _) = cache_with(CacheConfig::default());
        let failed: Result<Value, &str> = cache
            .memoize("ride", SetOptions::in_segment("strava"), || async { Err("upstream down") })
            .await;
        assert!(failed.is_err());
        assert!(!cache.contains("ride", "strava"));

        let loaded: Result<Value, &str> = cache
            .memoize("ride", SetOptions::in_segment("strava"), || async { Ok(json!({"km": 42})) })
            .await;
        assert_eq!(loaded.unwrap(), json!({"km": 42}));

        let cached: Result<Value, &str> = cache
            .memoize("ride", SetOptions::in_segment("strava"), || async { Err("not called") })
            .await;
        assert_eq!(cached.unwrap(), json!({"km": 42}));
    }

    #[test]
    fn typed_values_are_supported() {
        let clock = Arc::new(ManualClock::new(0));
        let cache: Cache<u32> = Cache::new(&CacheConfig::default(), clock);
        assert_eq!(cache.set("n", 7, SetOptions::default()), 7);
        assert_eq!(cache.get("n", DEFAULT_SEGMENT), Some(7));
    }
}
