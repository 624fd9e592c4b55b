//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use reactive_store::{
    DatabaseSize, MemoryStorage, Result, SliceUpdater, StateMap, StateTarget, StorageProvider,
    StoreError, UpdateBatcher,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Memory storage whose single-key reads yield once, so concurrent readers
/// overlap, and whose failures can be switched on.
#[derive(Default)]
pub struct GatedStorage {
    pub inner: MemoryStorage,
    fail_reads: AtomicBool,
    write_failure: Mutex<Option<StoreError>>,
}

impl GatedStorage {
    pub fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes_with(&self, error: Option<StoreError>) {
        *self.write_failure.lock() = error;
    }

    fn check_write(&self) -> Result<()> {
        match self.write_failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageProvider for GatedStorage {
    async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        tokio::task::yield_now().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::StorageReadFailure(format!("read of {key} failed")));
        }
        self.inner.get_item(key).await
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<(String, Option<Value>)>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::StorageReadFailure("multi-read failed".into()));
        }
        self.inner.multi_get(keys).await
    }

    async fn set_item(&self, key: &str, value: &Value) -> Result<()> {
        self.check_write()?;
        self.inner.set_item(key, value).await
    }

    async fn multi_set(&self, pairs: &[(String, Value)]) -> Result<()> {
        self.check_write()?;
        self.inner.multi_set(pairs).await
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.inner.remove_item(key).await
    }

    async fn remove_items(&self, keys: &[String]) -> Result<()> {
        self.inner.remove_items(keys).await
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        self.inner.get_all_keys().await
    }

    async fn get_database_size(&self) -> Result<DatabaseSize> {
        self.inner.get_database_size().await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }
}

/// A single managed-state component plus the runtime that renders it.
///
/// Every state change outside a batch renders at once; changes inside
/// `batch_updates` render once when the batch ends.
#[derive(Default)]
pub struct TestRuntime {
    batching: AtomicBool,
    dirty: AtomicBool,
    renders: AtomicUsize,
    state: Mutex<StateMap>,
    rendered: Mutex<Vec<StateMap>>,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn slice(&self, name: &str) -> Option<Value> {
        self.state.lock().get(name).cloned()
    }

    /// State as of each render, oldest first.
    pub fn rendered(&self) -> Vec<StateMap> {
        self.rendered.lock().clone()
    }

    fn changed(&self) {
        if self.batching.load(Ordering::SeqCst) {
            self.dirty.store(true, Ordering::SeqCst);
        } else {
            self.render();
        }
    }

    fn render(&self) {
        let snapshot = self.state.lock().clone();
        self.rendered.lock().push(snapshot);
        self.renders.fetch_add(1, Ordering::SeqCst);
    }
}

impl StateTarget for TestRuntime {
    fn state(&self) -> StateMap {
        self.state.lock().clone()
    }

    fn replace_state_slice(&self, name: &str, updater: SliceUpdater) {
        let previous = self.state();
        if let Some(next) = updater(&previous) {
            self.state.lock().insert(name.to_string(), next);
            self.changed();
        }
    }

    fn set_state_slice(&self, name: &str, value: Value) {
        self.state.lock().insert(name.to_string(), value);
        self.changed();
    }
}

impl UpdateBatcher for TestRuntime {
    fn batch_updates(&self, updates: &mut dyn FnMut()) {
        self.batching.store(true, Ordering::SeqCst);
        updates();
        self.batching.store(false, Ordering::SeqCst);
        if self.dirty.swap(false, Ordering::SeqCst) {
            self.render();
        }
    }
}

/// Route store logs to the test harness output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// `(value, key)` pairs seen by a callback subscriber.
pub type Deliveries = std::sync::Arc<Mutex<Vec<(Option<Value>, String)>>>;

pub fn deliveries() -> Deliveries {
    Default::default()
}

/// A callback that appends every delivery to `log`.
pub fn record_into(log: &Deliveries) -> impl Fn(Option<&Value>, &str) + Send + Sync + 'static {
    let log = std::sync::Arc::clone(log);
    move |value, key| log.lock().push((value.cloned(), key.to_string()))
}

/// Deliveries sorted by key, for assertions that ignore member order.
pub fn sorted(log: &Deliveries) -> Vec<(Option<Value>, String)> {
    let mut entries = log.lock().clone();
    entries.sort_by(|a, b| a.1.cmp(&b.1));
    entries
}
