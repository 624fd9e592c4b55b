//! Eviction bookkeeping: which keys may be deleted under storage pressure,
//! in what order, and which are currently held by subscribers.

use crate::keys::KeyRegistry;
use crate::types::ConnectionId;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Tracks eviction candidates.
///
/// - the allow-list names exact keys or collection keys that are safe to
///   evict; anything else is never a candidate
/// - the recency list orders candidates, least recently used first
/// - the block-list holds keys a subscriber currently refuses to lose
pub struct EvictionManager {
    keys: KeyRegistry,

    /// Safe eviction patterns.
    allow_list: Vec<String>,

    /// Evictable keys in access order. Only the ordering is used.
    recency: Mutex<LruCache<String, ()>>,

    /// Key -> connections that block its eviction.
    block_list: Mutex<HashMap<String, HashSet<ConnectionId>>>,
}

impl EvictionManager {
    pub fn new(keys: KeyRegistry, allow_list: Vec<String>) -> Self {
        Self {
            keys,
            allow_list,
            recency: Mutex::new(LruCache::unbounded()),
            block_list: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `key` matches an allow-list pattern.
    pub fn is_safe_eviction_key(&self, key: &str) -> bool {
        self.allow_list
            .iter()
            .any(|pattern| self.keys.is_key_match(pattern, key))
    }

    /// Move `key` to the most recently used end of the recency list.
    ///
    /// Collection keys and keys outside the allow-list are ignored.
    pub fn record_access(&self, key: &str) {
        if self.keys.is_collection_key(key) || !self.is_safe_eviction_key(key) {
            return;
        }
        self.recency.lock().put(key.to_string(), ());
    }

    /// Drop `key` from the recency list.
    pub fn forget_access(&self, key: &str) {
        self.recency.lock().pop(key);
    }

    /// Record every allow-listed key among `stored_keys` as accessed.
    pub fn prime<I, S>(&self, stored_keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for key in stored_keys {
            self.record_access(key.as_ref());
        }
    }

    /// Prevent `key` from being evicted while `connection` holds it.
    pub fn block(&self, key: &str, connection: ConnectionId) {
        self.block_list
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(connection);
    }

    /// Release a hold. The entry disappears once nobody holds the key.
    pub fn unblock(&self, key: &str, connection: ConnectionId) {
        let mut block_list = self.block_list.lock();
        if let Some(holders) = block_list.get_mut(key) {
            holders.remove(&connection);
            if holders.is_empty() {
                block_list.remove(key);
            }
        }
    }

    pub fn is_blocked(&self, key: &str) -> bool {
        self.block_list
            .lock()
            .get(key)
            .is_some_and(|holders| !holders.is_empty())
    }

    /// Least recently used key that nobody blocks.
    pub fn key_for_eviction(&self) -> Option<String> {
        self.key_for_eviction_except(&[])
    }

    /// Like [`EvictionManager::key_for_eviction`], never returning a key in
    /// `excluded`.
    pub fn key_for_eviction_except(&self, excluded: &[&str]) -> Option<String> {
        let recency = self.recency.lock();
        let block_list = self.block_list.lock();
        recency
            .iter()
            .rev()
            .map(|(key, _)| key)
            .filter(|key| !excluded.contains(&key.as_str()))
            .find(|key| block_list.get(*key).map_or(true, HashSet::is_empty))
            .cloned()
    }

    /// Recency list, least recently used first.
    pub fn recency_list(&self) -> Vec<String> {
        self.recency
            .lock()
            .iter()
            .rev()
            .map(|(key, _)| key.clone())
            .collect()
    }
}
