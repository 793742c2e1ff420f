//! Bounded in-memory caches
//!
//! Both the address cache and the flow cache grow without limit unless a
//! capacity or a TTL is configured. With a capacity, the least recently used
//! entry is evicted on overflow. With a TTL, entries older than the TTL are
//! treated as absent and dropped when touched; untouched expired entries are
//! swept on insert at most once per TTL period.

use ahash::{HashMap, HashMapExt};
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_used: u64,
}

/// Map with optional LRU capacity and TTL expiry
pub struct BoundedCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    capacity: Option<usize>,
    ttl: Option<Duration>,
    /// Logical clock used for recency ordering
    clock: u64,
    next_sweep: Option<Instant>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: Option<usize>, ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            ttl,
            clock: 0,
            next_sweep: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    /// Look up a key, refreshing its recency
    pub fn get(&mut self, key: &K) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => is_expired(self.ttl, entry),
            None => return None,
        };

        if expired {
            self.entries.remove(key);
            return None;
        }

        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.get_mut(key)?;
        entry.last_used = clock;
        Some(entry.value.clone())
    }

    /// Insert or replace a value
    pub fn insert(&mut self, key: K, value: V) {
        if !self.entries.contains_key(&key) {
            self.make_room();
        }

        self.clock += 1;
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                last_used: self.clock,
            },
        );
    }

    /// Insert only when the key is vacant (or expired)
    ///
    /// Returns true when the value was stored.
    pub fn insert_if_absent(&mut self, key: K, value: V) -> bool {
        if self.get(&key).is_some() {
            return false;
        }
        self.insert(key, value);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry
    fn sweep_expired(&mut self) {
        let Some(ttl) = self.ttl else {
            return;
        };
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        self.next_sweep = Some(Instant::now() + ttl);

        let swept = before - self.entries.len();
        if swept > 0 {
            tracing::trace!("Swept {} expired cache entries", swept);
        }
    }

    fn make_room(&mut self) {
        if self.next_sweep.is_some_and(|due| Instant::now() >= due) {
            self.sweep_expired();
        }

        let Some(capacity) = self.capacity else {
            return;
        };

        if self.entries.len() < capacity {
            return;
        }

        // Expired entries go first
        self.sweep_expired();

        while self.entries.len() >= capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());

            match oldest {
                Some(key) => {
                    tracing::trace!("Evicting least recently used cache entry");
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

fn is_expired<V>(ttl: Option<Duration>, entry: &Entry<V>) -> bool {
    ttl.is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl)
}
