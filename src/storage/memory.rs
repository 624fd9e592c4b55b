//! In-memory storage backend.
//!
//! Not durable: everything is lost when the process exits. Useful for tests
//! and for embedding the store where persistence is handled elsewhere. An
//! optional byte quota makes writes fail with `StorageQuotaExceeded` once
//! the serialized size of all entries would exceed it.

use super::StorageProvider;
use crate::error::{Result, StoreError};
use crate::types::DatabaseSize;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of backend calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub item_reads: u64,
    pub multi_reads: u64,
    pub writes: u64,
    pub removals: u64,
}

#[derive(Default)]
struct Counters {
    item_reads: AtomicU64,
    multi_reads: AtomicU64,
    writes: AtomicU64,
    removals: AtomicU64,
}

/// `BTreeMap`-backed storage with an optional byte quota.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Value>>,
    quota_bytes: Option<u64>,
    counters: Counters,
}

impl MemoryStorage {
    /// Unlimited storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that refuses writes beyond `quota_bytes`.
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Storage pre-filled with `entries`, bypassing the quota.
    pub fn with_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            item_reads: self.counters.item_reads.load(Ordering::SeqCst),
            multi_reads: self.counters.multi_reads.load(Ordering::SeqCst),
            writes: self.counters.writes.load(Ordering::SeqCst),
            removals: self.counters.removals.load(Ordering::SeqCst),
        }
    }

    /// Direct read that bypasses the counters.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.read().clone()
    }

    /// Serialized size of all entries.
    pub fn bytes_used(&self) -> u64 {
        self.entries
            .read()
            .iter()
            .map(|(key, value)| entry_size(key, value).unwrap_or(0))
            .sum()
    }

    /// Apply `pairs` if the result fits the quota.
    fn write_all(&self, pairs: &[(String, Value)]) -> Result<()> {
        let mut entries = self.entries.write();

        if let Some(quota) = self.quota_bytes {
            let mut projected: u64 = entries
                .iter()
                .map(|(key, value)| entry_size(key, value).unwrap_or(0))
                .sum();
            for (key, value) in pairs {
                if let Some(old) = entries.get(key) {
                    projected = projected.saturating_sub(entry_size(key, old)?);
                }
                projected += entry_size(key, value)?;
            }
            if projected > quota {
                return Err(StoreError::StorageQuotaExceeded(format!(
                    "write needs {projected} bytes, quota is {quota}"
                )));
            }
        } else {
            for (key, value) in pairs {
                entry_size(key, value)?;
            }
        }

        for (key, value) in pairs {
            entries.insert(key.clone(), value.clone());
        }
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn entry_size(key: &str, value: &Value) -> Result<u64> {
    let encoded = serde_json::to_vec(value).map_err(|e| StoreError::NonSerializableValue {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok((key.len() + encoded.len()) as u64)
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        self.counters.item_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.read().get(key).cloned())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<(String, Option<Value>)>> {
        self.counters.multi_reads.fetch_add(1, Ordering::SeqCst);
        let entries = self.entries.read();
        Ok(keys
            .iter()
            .map(|key| (key.clone(), entries.get(key).cloned()))
            .collect())
    }

    async fn set_item(&self, key: &str, value: &Value) -> Result<()> {
        self.write_all(&[(key.to_string(), value.clone())])
    }

    async fn multi_set(&self, pairs: &[(String, Value)]) -> Result<()> {
        self.write_all(pairs)
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.counters.removals.fetch_add(1, Ordering::SeqCst);
        self.entries.write().remove(key);
        Ok(())
    }

    async fn remove_items(&self, keys: &[String]) -> Result<()> {
        self.counters.removals.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.write();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    async fn get_database_size(&self) -> Result<DatabaseSize> {
        let bytes_used = self.bytes_used();
        let bytes_remaining = match self.quota_bytes {
            Some(quota) => quota.saturating_sub(bytes_used),
            None => u64::MAX - bytes_used,
        };
        Ok(DatabaseSize {
            bytes_used,
            bytes_remaining,
        })
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_and_get() {
        let storage = MemoryStorage::new();
        storage.set_item("a", &json!({"x": 1})).await.unwrap();

        assert_eq!(storage.get_item("a").await.unwrap(), Some(json!({"x": 1})));
        assert_eq!(storage.get_item("b").await.unwrap(), None);
        assert_eq!(storage.stats().item_reads, 2);
    }

    #[tokio::test]
    async fn test_multi_get_preserves_order() {
        let storage = MemoryStorage::with_entries(vec![
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(2)),
        ]);

        let pairs = storage
            .multi_get(&["b".to_string(), "z".to_string(), "a".to_string()])
            .await
            .unwrap();

        assert_eq!(
            pairs,
            vec![
                ("b".to_string(), Some(json!(2))),
                ("z".to_string(), None),
                ("a".to_string(), Some(json!(1))),
            ]
        );
        assert_eq!(storage.stats().multi_reads, 1);
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        // "a" + "1" fits, a long string does not.
        let storage = MemoryStorage::with_quota(8);
        storage.set_item("a", &json!(1)).await.unwrap();

        let result = storage.set_item("b", &json!("a long string value")).await;
        assert!(matches!(result, Err(StoreError::StorageQuotaExceeded(_))));
        assert_eq!(storage.get_item("b").await.unwrap(), None);

        // Overwriting an entry only counts the difference.
        storage.set_item("a", &json!(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_database_size() {
        let storage = MemoryStorage::with_quota(100);
        storage.set_item("ab", &json!("cd")).await.unwrap();

        let size = storage.get_database_size().await.unwrap();
        assert_eq!(size.bytes_used, 6);
        assert_eq!(size.bytes_remaining, 94);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let storage = MemoryStorage::new();
        storage
            .multi_set(&[("a".to_string(), json!(1)), ("b".to_string(), json!(2))])
            .await
            .unwrap();

        storage.remove_item("a").await.unwrap();
        assert_eq!(storage.get_all_keys().await.unwrap(), vec!["b".to_string()]);

        storage.clear().await.unwrap();
        assert!(storage.get_all_keys().await.unwrap().is_empty());
    }
}
