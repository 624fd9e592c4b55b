//! Durable storage seam.
//!
//! The store only needs a handful of key-value primitives from its backend.
//! Backends report quota exhaustion as [`StoreError::StorageQuotaExceeded`]
//! and data they cannot persist as [`StoreError::NonSerializableValue`]; the
//! store's eviction loop depends on that distinction.
//!
//! [`StoreError::StorageQuotaExceeded`]: crate::error::StoreError::StorageQuotaExceeded
//! [`StoreError::NonSerializableValue`]: crate::error::StoreError::NonSerializableValue

mod memory;

pub use memory::{MemoryStorage, StorageStats};

use crate::error::Result;
use crate::types::DatabaseSize;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Read one value. `Ok(None)` when the key does not exist.
    async fn get_item(&self, key: &str) -> Result<Option<Value>>;

    /// Read several values in one round trip, in request order.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<(String, Option<Value>)>>;

    async fn set_item(&self, key: &str, value: &Value) -> Result<()>;

    /// Write several values. Either all of them are written or none.
    async fn multi_set(&self, pairs: &[(String, Value)]) -> Result<()>;

    async fn remove_item(&self, key: &str) -> Result<()>;

    async fn remove_items(&self, keys: &[String]) -> Result<()>;

    async fn get_all_keys(&self) -> Result<Vec<String>>;

    async fn get_database_size(&self) -> Result<DatabaseSize>;

    async fn clear(&self) -> Result<()>;
}
