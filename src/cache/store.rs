//! Indexed storage behind [`Cache`](super::Cache).
//!
//! `Store` owns the entries plus two recency indices:
//!
//! ```text
//!     entries:  (segment, key) ──► Entry { value, expires_at, last_accessed_at, .. }
//!     global:   (last_accessed_at, seq) ──► (segment, key)      oldest first
//!     segments: segment ──► { limit, (last_accessed_at, seq) ──► key }
//! ```
//!
//! Every touch moves the entry to a fresh `(now, seq)` slot, so the first
//! element of either index is always the least recently accessed entry. `seq`
//! only breaks ties between accesses in the same millisecond.
//!
//! All methods assume the caller holds the cache lock.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

/// Position of an entry in the recency indices.
pub(super) type Recency = (u64, u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(super) struct EntryKey {
    pub segment: String,
    pub key: String,
}

impl EntryKey {
    pub fn new(segment: &str, key: &str) -> Self {
        Self {
            segment: segment.to_owned(),
            key: key.to_owned(),
        }
    }
}

#[derive(Debug)]
pub(super) struct Entry<V> {
    pub value: V,
    /// `None` never expires.
    pub expires_at: Option<u64>,
    pub created_at: u64,
    pub last_accessed_at: u64,
    recency: Recency,
}

impl<V> Entry<V> {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
pub(super) struct Segment {
    pub limit: Option<usize>,
    members: BTreeMap<Recency, String>,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug)]
pub(super) struct Store<V> {
    entries: HashMap<EntryKey, Entry<V>>,
    global: BTreeMap<Recency, EntryKey>,
    segments: BTreeMap<String, Segment>,
    next_seq: u64,
}

impl<V> Store<V> {
    pub fn new<'a>(limits: impl IntoIterator<Item = (&'a String, &'a usize)>) -> Self {
        let segments = limits
            .into_iter()
            .map(|(name, limit)| {
                let segment = Segment {
                    limit: Some(*limit),
                    ..Segment::default()
                };
                (name.clone(), segment)
            })
            .collect();
        Self {
            entries: HashMap::new(),
            global: BTreeMap::new(),
            segments,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &EntryKey) -> Option<&Entry<V>> {
        self.entries.get(key)
    }

    pub fn segments(&self) -> &BTreeMap<String, Segment> {
        &self.segments
    }

    pub fn segment_len(&self, segment: &str) -> usize {
        self.segments.get(segment).map_or(0, Segment::len)
    }

    pub fn segment_limit(&self, segment: &str) -> Option<usize> {
        self.segments.get(segment).and_then(|s| s.limit)
    }

    pub fn set_segment_limit(&mut self, segment: &str, limit: Option<usize>) {
        let seg = self.segments.entry(segment.to_owned()).or_default();
        seg.limit = limit;
        if limit.is_none() && seg.members.is_empty() {
            self.segments.remove(segment);
        }
    }

    fn recency(&mut self, now: u64) -> Recency {
        self.next_seq += 1;
        (now, self.next_seq)
    }

    /// Marks an entry as accessed at `now` and returns it.
    pub fn touch(&mut self, key: &EntryKey, now: u64) -> Option<&Entry<V>> {
        let recency = self.recency(now);
        let entry = self.entries.get_mut(key)?;
        let previous = std::mem::replace(&mut entry.recency, recency);
        entry.last_accessed_at = now;

        self.global.remove(&previous);
        self.global.insert(recency, key.clone());
        if let Some(segment) = self.segments.get_mut(&key.segment) {
            segment.members.remove(&previous);
            segment.members.insert(recency, key.key.clone());
        }
        self.entries.get(key)
    }

    /// Inserts a new entry. The caller has already made room for it.
    pub fn insert(&mut self, key: EntryKey, value: V, expires_at: Option<u64>, now: u64) {
        if self.entries.contains_key(&key) {
            self.remove(&key);
        }
        let recency = self.recency(now);
        self.global.insert(recency, key.clone());
        self.segments
            .entry(key.segment.clone())
            .or_default()
            .members
            .insert(recency, key.key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                created_at: now,
                last_accessed_at: now,
                recency,
            },
        );
    }

    pub fn remove(&mut self, key: &EntryKey) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.global.remove(&entry.recency);
        let drop_segment = match self.segments.get_mut(&key.segment) {
            Some(segment) => {
                segment.members.remove(&entry.recency);
                segment.limit.is_none() && segment.members.is_empty()
            }
            None => false,
        };
        if drop_segment {
            self.segments.remove(&key.segment);
        }
        Some(entry)
    }

    /// Removes the least recently accessed entry of `segment`.
    pub fn evict_from_segment(&mut self, segment: &str) -> bool {
        let oldest = self
            .segments
            .get(segment)
            .and_then(|s| s.members.first_key_value())
            .map(|(_, key)| EntryKey::new(segment, key));
        match oldest {
            Some(key) => {
                debug!(segment = %key.segment, key = %key.key, "evicting segment LRU entry");
                self.remove(&key).is_some()
            }
            None => false,
        }
    }

    /// Removes the least recently accessed entry across all segments.
    pub fn evict_global(&mut self) -> bool {
        let oldest = self.global.first_key_value().map(|(_, key)| key.clone());
        match oldest {
            Some(key) => {
                debug!(segment = %key.segment, key = %key.key, "evicting global LRU entry");
                self.remove(&key).is_some()
            }
            None => false,
        }
    }

    /// Removes every entry of `segment`, returning how many were dropped.
    pub fn clear_segment(&mut self, segment: &str) -> usize {
        let keys: Vec<EntryKey> = match self.segments.get(segment) {
            Some(s) => s.members.values().map(|k| EntryKey::new(segment, k)).collect(),
            None => return 0,
        };
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    /// Removes everything while keeping configured segment limits.
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.global.clear();
        self.segments.retain(|_, s| s.limit.is_some());
        for segment in self.segments.values_mut() {
            segment.members.clear();
        }
        removed
    }

    /// Removes all entries expired at `now`.
    pub fn prune(&mut self, now: u64) -> usize {
        let expired: Vec<EntryKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    #[cfg(test)]
    pub fn oldest(&self) -> Option<&EntryKey> {
        self.global.first_key_value().map(|(_, k)| k)
    }
}
