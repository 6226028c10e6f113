//! Result cache with LRU eviction.
//!
//! Results are keyed by a canonical encoding of the call arguments. The cache
//! itself is not synchronized; the dispatcher owns it behind a mutex so all
//! reads and writes for one function are serialized.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Caching policy declared for a served function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub enabled: bool,
    /// Maximum number of entries. `0` means no limit.
    pub capacity: usize,
}

impl CachePolicy {
    /// Caching off.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Caching on, holding at most `capacity` results (`0` for unbounded).
    pub fn lru(capacity: usize) -> Self {
        Self {
            enabled: true,
            capacity,
        }
    }
}

/// Canonical cache key for a call.
///
/// The key is the compact JSON text of `[args, kwargs]`. Positional order is
/// kept as sent. `serde_json::Map` is ordered by key, so keyword arguments
/// (and object keys nested anywhere in the values) always serialize in the
/// same order regardless of how the caller built them.
pub fn cache_key(args: &[Value], kwargs: &Map<String, Value>) -> String {
    let mut key = String::from("[");
    key.push_str(&Value::Array(args.to_vec()).to_string());
    key.push(',');
    key.push_str(&Value::Object(kwargs.clone()).to_string());
    key.push(']');
    key
}

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    /// Access tick of the last get or put.
    last_access: u64,
}

/// Bounded least-recently-used map from call key to result.
///
/// Lookups are O(1) and recency updates and evictions O(log n), so large
/// capacities stay cheap under the dispatcher's lock.
#[derive(Debug)]
pub struct ResultCache {
    entries: HashMap<String, CacheEntry>,
    /// Access tick to key, oldest first.
    recency: BTreeMap<u64, String>,
    capacity: Option<usize>,
    tick: u64,
}

impl ResultCache {
    /// Create a cache holding at most `capacity` entries (`0` for unbounded).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            capacity: (capacity > 0).then_some(capacity),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up a result. A hit makes the entry the most recently used.
    pub fn get(&mut self, key: &str) -> Option<Value> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.last_access);
        self.recency.insert(tick, key.to_string());
        entry.last_access = tick;
        Some(entry.value.clone())
    }

    /// Store a result, evicting the least recently used entry if the cache
    /// grows past its capacity.
    pub fn put(&mut self, key: String, value: Value) {
        let tick = self.next_tick();
        let previous = self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                last_access: tick,
            },
        );
        if let Some(previous) = previous {
            self.recency.remove(&previous.last_access);
        }
        self.recency.insert(tick, key);

        if let Some(capacity) = self.capacity {
            while self.entries.len() > capacity {
                self.evict_lru();
            }
        }
    }

    fn evict_lru(&mut self) {
        if let Some((_, key)) = self.recency.pop_first() {
            self.entries.remove(&key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity, `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }
}
