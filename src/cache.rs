//! In-process value cache.
//!
//! Holds recently used values in memory, the set of keys known to exist in
//! storage and the keys confirmed to be absent. Values are kept in an LRU so
//! memory can be trimmed without touching storage.

use crate::keys::is_collection_member_key;
use crate::types::Collection;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;

/// Default number of values kept in memory.
pub const DEFAULT_MAX_CACHED_KEYS: usize = 1000;

struct CacheState {
    /// Values by key, least recently used at the back.
    values: LruCache<String, Value>,

    /// Every key known to exist in storage.
    storage_keys: HashSet<String>,

    /// Whether `storage_keys` has been filled from storage.
    keys_loaded: bool,

    /// Keys confirmed not to exist in storage.
    absent: HashSet<String>,
}

/// Memory cache in front of the storage backend.
pub struct ValueCache {
    state: Mutex<CacheState>,
    max_cached_keys: usize,
}

impl ValueCache {
    /// Create a cache that keeps at most `max_cached_keys` values after
    /// [`ValueCache::evict_least_recently_used`].
    pub fn new(max_cached_keys: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                values: LruCache::unbounded(),
                storage_keys: HashSet::new(),
                keys_loaded: false,
                absent: HashSet::new(),
            }),
            max_cached_keys: max_cached_keys.max(1),
        }
    }

    /// Whether a value for `key` is held in memory.
    pub fn has(&self, key: &str) -> bool {
        self.state.lock().values.contains(key)
    }

    /// Get a cached value, marking it as recently used.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().values.get(key).cloned()
    }

    /// Get a cached value without touching recency.
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.state.lock().values.peek(key).cloned()
    }

    /// Store a value and record the key as existing.
    pub fn set(&self, key: &str, value: Value) {
        let mut state = self.state.lock();
        state.storage_keys.insert(key.to_string());
        state.absent.remove(key);
        state.values.put(key.to_string(), value);
    }

    /// Fill the cache from a storage read unless a write or removal got there
    /// first. Returns whether the cache was updated.
    pub fn fill_if_vacant(&self, key: &str, value: Option<Value>) -> bool {
        let mut state = self.state.lock();
        if state.values.contains(key) || state.absent.contains(key) {
            return false;
        }
        match value {
            Some(value) => {
                state.storage_keys.insert(key.to_string());
                state.values.put(key.to_string(), value);
            }
            None => {
                state.absent.insert(key.to_string());
            }
        }
        true
    }

    /// Forget a key entirely.
    pub fn drop_key(&self, key: &str) {
        let mut state = self.state.lock();
        state.values.pop(key);
        state.storage_keys.remove(key);
    }

    /// All keys known to exist, once they have been loaded from storage.
    pub fn all_keys(&self) -> Option<Vec<String>> {
        let state = self.state.lock();
        if !state.keys_loaded {
            return None;
        }
        let mut keys: Vec<String> = state.storage_keys.iter().cloned().collect();
        keys.sort();
        Some(keys)
    }

    /// Record the keys reported by storage, keeping any written since.
    pub fn set_all_keys<I>(&self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.state.lock();
        state.storage_keys.extend(keys);
        state.keys_loaded = true;
    }

    /// Move a cached value to the most recently used position.
    pub fn mark_accessed(&self, key: &str) {
        self.state.lock().values.promote(key);
    }

    /// Trim memory down to the configured size. Storage is not touched.
    pub fn evict_least_recently_used(&self) -> Vec<String> {
        let mut state = self.state.lock();
        let mut evicted = Vec::new();
        while state.values.len() > self.max_cached_keys {
            match state.values.pop_lru() {
                Some((key, _)) => evicted.push(key),
                None => break,
            }
        }
        evicted
    }

    /// Record that storage has no value for `key`.
    pub fn mark_absent(&self, key: &str) {
        let mut state = self.state.lock();
        state.values.pop(key);
        state.absent.insert(key.to_string());
    }

    pub fn is_absent(&self, key: &str) -> bool {
        self.state.lock().absent.contains(key)
    }

    /// Whether writing `value` would change what is cached.
    pub fn has_value_changed(&self, key: &str, value: &Value) -> bool {
        self.state.lock().values.peek(key) != Some(value)
    }

    /// Cached members of a collection.
    pub fn collection(&self, collection_key: &str) -> Collection {
        let state = self.state.lock();
        state
            .values
            .iter()
            .filter(|(key, _)| is_collection_member_key(collection_key, key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Number of values held in memory.
    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ValueCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHED_KEYS)
    }
}
