//! # Reactive Store
//!
//! A reactive key-value layer between a durable storage backend and many
//! concurrent readers and writers that want to hear about changes.
//!
//! ## Core Concepts
//!
//! - **Keys**: standalone keys, collection keys (`report_`) and collection
//!   members (`report_42`)
//! - **Reads**: concurrent reads of one key share a single storage fetch
//! - **Merges**: partial updates queued per key and applied as one write
//! - **Eviction**: allow-listed keys are deleted, least recently used first,
//!   when storage runs out of space
//! - **Subscriptions**: callbacks and managed state slices, notified with
//!   diff-suppressed updates coalesced into batches
//!
//! ## Example
//!
//! ```ignore
//! use reactive_store::{ConnectOptions, MemoryStorage, Store, StoreConfig};
//!
//! let store = Store::open(
//!     StoreConfig {
//!         collection_keys: vec!["report_".into()],
//!         ..Default::default()
//!     },
//!     Arc::new(MemoryStorage::new()),
//! )
//! .await?;
//!
//! store
//!     .connect(ConnectOptions::callback("report_", |value, key| {
//!         println!("{key} changed: {value:?}");
//!     }))
//!     .await?;
//!
//! store.merge("report_1", json!({"total": 10})).await?;
//! ```

pub mod cache;
pub mod debug;
pub mod error;
pub mod eviction;
pub mod keys;
pub mod merge;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod subscriptions;
pub mod tasks;
pub mod types;

// Re-exports
pub use cache::ValueCache;
pub use debug::{DebugSink, MemoryDebugSink, NoopDebugSink, RecordedAction};
pub use error::{Result, StoreError};
pub use eviction::EvictionManager;
pub use keys::{is_collection_member_key, split_collection_member_key, KeyRegistry};
pub use merge::{apply_merge, fast_merge, Compatibility};
pub use scheduler::{BatchTicket, ImmediateBatcher, UpdateBatcher, UpdateScheduler};
pub use storage::{MemoryStorage, StorageProvider, StorageStats};
pub use store::{Store, StoreConfig, StoreHooks};
pub use subscriptions::{
    ConnectOptions, Delivery, KeyCallback, Selector, SliceUpdater, StateTarget,
    SubscriptionManager,
};
pub use tasks::TaskDeduplicator;
pub use types::*;
