//! Main Store struct tying all components together.

use crate::cache::{ValueCache, DEFAULT_MAX_CACHED_KEYS};
use crate::debug::{DebugSink, NoopDebugSink};
use crate::error::{Result, StoreError};
use crate::eviction::EvictionManager;
use crate::keys::{is_collection_member_key, KeyRegistry};
use crate::merge::{
    apply_merge, check_compatibility, fast_merge, prepare_for_storage, remove_null_values,
    Compatibility, MergeQueue,
};
use crate::scheduler::{BatchTicket, ImmediateBatcher, UpdateBatcher, UpdateScheduler};
use crate::storage::StorageProvider;
use crate::subscriptions::{ConnectOptions, Notification, SubscriptionManager};
use crate::tasks::TaskDeduplicator;
use crate::types::{Collection, ConnectionId, Key, Update};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Default bound on evictions attempted for a single write.
pub const DEFAULT_MAX_EVICTION_RETRIES: usize = 64;

/// Store configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Registered collection keys, e.g. `report_`.
    pub collection_keys: Vec<String>,

    /// Default values. Applied at open (under any stored value) and restored
    /// by [`Store::clear`].
    pub initial_key_states: Map<String, Value>,

    /// Keys or collection keys that may be deleted when storage is full.
    pub safe_eviction_keys: Vec<String>,

    /// Values kept in memory after a trim.
    pub max_cached_keys: usize,

    /// Evictions attempted before a failing write is dropped.
    pub max_eviction_retries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            collection_keys: Vec::new(),
            initial_key_states: Map::new(),
            safe_eviction_keys: Vec::new(),
            max_cached_keys: DEFAULT_MAX_CACHED_KEYS,
            max_eviction_retries: DEFAULT_MAX_EVICTION_RETRIES,
        }
    }
}

impl StoreConfig {
    /// Parse a configuration document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Collaborators supplied by the embedding application.
#[derive(Clone)]
pub struct StoreHooks {
    pub debug_sink: Arc<dyn DebugSink>,

    /// Coalescing primitive of the managed-state runtime.
    pub batcher: Arc<dyn UpdateBatcher>,
}

impl Default for StoreHooks {
    fn default() -> Self {
        Self {
            debug_sink: Arc::new(NoopDebugSink),
            batcher: Arc::new(ImmediateBatcher),
        }
    }
}

/// A storage write that can be re-run after eviction.
enum WriteOp {
    Set { key: Key, value: Value },
    MultiSet(Vec<(Key, Value)>),
}

impl WriteOp {
    fn name(&self) -> &'static str {
        match self {
            WriteOp::Set { .. } => "set",
            WriteOp::MultiSet(_) => "multi_set",
        }
    }

    /// Keys the write touches. These are never evicted to make room for it.
    fn keys(&self) -> Vec<&str> {
        match self {
            WriteOp::Set { key, .. } => vec![key.as_str()],
            WriteOp::MultiSet(pairs) => pairs.iter().map(|(key, _)| key.as_str()).collect(),
        }
    }

    async fn apply(&self, storage: &dyn StorageProvider) -> Result<()> {
        match self {
            WriteOp::Set { key, value } => storage.set_item(key, value).await,
            WriteOp::MultiSet(pairs) => storage.multi_set(pairs).await,
        }
    }
}

struct StoreInner {
    config: StoreConfig,
    keys: KeyRegistry,
    storage: Arc<dyn StorageProvider>,
    cache: Arc<ValueCache>,

    /// In-flight single-key reads, named `get:<key>`.
    reads: TaskDeduplicator<Option<Value>>,

    /// In-flight key listing.
    key_listing: TaskDeduplicator<Vec<String>>,

    eviction: Arc<EvictionManager>,
    merges: MergeQueue,
    subscriptions: Arc<SubscriptionManager>,
    scheduler: Arc<UpdateScheduler>,
    debug_sink: Arc<dyn DebugSink>,
}

/// The reactive store.
///
/// A cheap handle: clones share the same cache, registries and storage.
/// Every write resolves only after its subscribers have been notified.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

const KEY_LISTING_TASK: &str = "getAllKeys";

fn read_task_name(key: &str) -> String {
    format!("get:{key}")
}

fn keyed(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

impl Store {
    /// Open a store over `storage` with default hooks.
    pub async fn open(config: StoreConfig, storage: Arc<dyn StorageProvider>) -> Result<Self> {
        Self::open_with(config, storage, StoreHooks::default()).await
    }

    /// Open a store with custom collaborators.
    pub async fn open_with(
        config: StoreConfig,
        storage: Arc<dyn StorageProvider>,
        hooks: StoreHooks,
    ) -> Result<Self> {
        let keys = KeyRegistry::new(config.collection_keys.iter().cloned());
        let cache = Arc::new(ValueCache::new(config.max_cached_keys));
        let eviction = Arc::new(EvictionManager::new(
            keys.clone(),
            config.safe_eviction_keys.clone(),
        ));
        let scheduler = Arc::new(UpdateScheduler::new(hooks.batcher));
        let subscriptions = Arc::new(SubscriptionManager::new(
            keys.clone(),
            Arc::clone(&cache),
            Arc::clone(&eviction),
            Arc::clone(&scheduler),
        ));

        let store = Self {
            inner: Arc::new(StoreInner {
                config,
                keys,
                storage,
                cache,
                reads: TaskDeduplicator::new(),
                key_listing: TaskDeduplicator::new(),
                eviction,
                merges: MergeQueue::new(),
                subscriptions,
                scheduler,
                debug_sink: hooks.debug_sink,
            }),
        };

        store.initialize_with_defaults().await?;
        store.prime_recency_list().await;

        info!(
            collections = store.inner.config.collection_keys.len(),
            defaults = store.inner.config.initial_key_states.len(),
            "store opened"
        );
        Ok(store)
    }

    /// Load default key states into the cache and write the ones storage
    /// does not hold yet. Stored values win over defaults.
    async fn initialize_with_defaults(&self) -> Result<()> {
        let defaults = &self.inner.config.initial_key_states;
        if defaults.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = defaults.keys().cloned().collect();
        let stored = self.inner.storage.multi_get(&keys).await?;
        let mut missing = Vec::new();
        for (key, stored_value) in stored {
            let Some(default) = defaults.get(&key) else {
                continue;
            };
            let value = match stored_value {
                Some(stored_value) => fast_merge(default, &stored_value, true),
                None => {
                    missing.push((key.clone(), default.clone()));
                    default.clone()
                }
            };
            if value.is_null() {
                continue;
            }
            self.inner.cache.set(&key, value);
        }

        missing.retain(|(_, value)| !value.is_null());
        if !missing.is_empty() {
            debug!(keys = missing.len(), "writing default key states");
            self.persist(WriteOp::MultiSet(missing)).await?;
        }
        Ok(())
    }

    /// Make keys stored by an earlier process eviction candidates.
    async fn prime_recency_list(&self) {
        let keys = self.get_all_keys().await;
        self.inner.eviction.prime(keys);
    }

    // --- Subscriptions ---

    /// Subscribe to a key or collection.
    ///
    /// Unless the options opt out, the current value is delivered before
    /// this returns.
    pub async fn connect(&self, options: ConnectOptions) -> Result<ConnectionId> {
        let inner = &self.inner;
        let key = options.key.clone();
        let is_managed = !options.delivery.is_callback();
        let is_safe_eviction_key = inner.eviction.is_safe_eviction_key(&key);

        if is_managed
            && is_safe_eviction_key
            && !inner.keys.is_collection_key(&key)
            && options.can_evict.is_none()
        {
            return Err(StoreError::InvalidOperation(format!(
                "managed subscriber of evictable key {key} must declare can_evict"
            )));
        }

        let init_with_stored_values = options.init_with_stored_values;
        let wait_for_collection = options.wait_for_collection_callback;
        let can_evict = options.can_evict;
        let id = inner.subscriptions.subscribe(options);

        if is_safe_eviction_key {
            inner.eviction.record_access(&key);
            if can_evict == Some(false) {
                inner.eviction.block(&key, id);
            }
        }

        debug!(connection = %id, key = %key, managed = is_managed, "connected");

        if !init_with_stored_values {
            return Ok(id);
        }

        let matching: Vec<String> = self
            .get_all_keys()
            .await
            .into_iter()
            .filter(|candidate| inner.keys.is_key_match(&key, candidate))
            .collect();
        let is_collection = inner.keys.is_collection_key(&key);

        if matching.is_empty() {
            if !is_collection {
                inner.cache.fill_if_vacant(&key, None);
            }
            let ticket = inner.scheduler.current_ticket();
            self.send_initial(id, key, None, is_managed);
            inner.scheduler.settle(ticket).await;
            return Ok(id);
        }

        if is_collection {
            let values = self.get_many(&matching).await;
            let ticket = inner.scheduler.current_ticket();
            if wait_for_collection || is_managed {
                let members: Collection = values
                    .into_iter()
                    .filter_map(|(member, value)| value.map(|value| (member, value)))
                    .collect();
                self.send_initial(id, key, Some(Value::Object(members)), is_managed);
            } else {
                for (member, value) in values {
                    self.send_initial(id, member, value, false);
                }
            }
            inner.scheduler.settle(ticket).await;
        } else {
            let value = self.get(&key).await;
            let ticket = inner.scheduler.current_ticket();
            self.send_initial(id, key, value, is_managed);
            inner.scheduler.settle(ticket).await;
        }

        inner.cache.evict_least_recently_used();
        Ok(id)
    }

    fn send_initial(&self, id: ConnectionId, key: Key, value: Option<Value>, batched: bool) {
        self.inner.subscriptions.send_to_subscriber(
            id,
            Notification::Initial {
                key,
                value,
                batched,
            },
        );
    }

    /// Remove a subscription and release its eviction hold.
    ///
    /// Returns false if the connection was unknown.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        match self.inner.subscriptions.unsubscribe(id) {
            Some(options) => {
                self.inner.eviction.unblock(&options.key, id);
                debug!(connection = %id, key = %options.key, "disconnected");
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.inner.subscriptions.is_connected(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.subscription_count()
    }

    // --- Reads ---

    /// Read a value. Concurrent reads of the same key share one storage
    /// fetch; storage failures are logged and read as absent.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let inner = &self.inner;
        if let Some(value) = inner.cache.get(key) {
            return Some(value);
        }
        if inner.cache.is_absent(key) {
            return None;
        }

        let store = self.clone();
        let owned = key.to_string();
        inner
            .reads
            .join_or_capture(&read_task_name(key), move || async move {
                store.read_from_storage(&owned).await
            })
            .await
    }

    async fn read_from_storage(&self, key: &str) -> Option<Value> {
        match self.inner.storage.get_item(key).await {
            Ok(value) => {
                if self.inner.cache.fill_if_vacant(key, value.clone()) {
                    value
                } else {
                    // A write or removal landed while the read was in flight.
                    self.inner.cache.peek(key)
                }
            }
            Err(e) => {
                info!(key = %key, error = %e, "storage read failed");
                None
            }
        }
    }

    /// Read several values with at most one storage round trip.
    pub async fn get_many(&self, keys: &[String]) -> BTreeMap<String, Option<Value>> {
        let inner = &self.inner;
        let mut result = BTreeMap::new();
        let mut pending = Vec::new();
        let mut missing = Vec::new();
        let mut seen = HashSet::new();

        for key in keys {
            if !seen.insert(key.as_str()) {
                continue;
            }
            if let Some(value) = inner.cache.get(key) {
                result.insert(key.clone(), Some(value));
            } else if inner.cache.is_absent(key) {
                result.insert(key.clone(), None);
            } else if let Some(task) = inner.reads.pending(&read_task_name(key)) {
                pending.push((key.clone(), task));
            } else {
                missing.push(key.clone());
            }
        }

        let joined = join_all(
            pending
                .into_iter()
                .map(|(key, task)| async move { (key, task.await) }),
        )
        .await;
        result.extend(joined);

        if missing.is_empty() {
            return result;
        }

        match inner.storage.multi_get(&missing).await {
            Ok(pairs) => {
                for (key, value) in pairs {
                    let value = if inner.cache.fill_if_vacant(&key, value.clone()) {
                        value
                    } else {
                        inner.cache.peek(&key)
                    };
                    result.insert(key, value);
                }
            }
            Err(e) => {
                info!(keys = missing.len(), error = %e, "storage multi-read failed");
                for key in missing {
                    result.insert(key, None);
                }
            }
        }
        result
    }

    /// Every key known to exist, sorted.
    pub async fn get_all_keys(&self) -> Vec<String> {
        if let Some(keys) = self.inner.cache.all_keys() {
            return keys;
        }

        let store = self.clone();
        self.inner
            .key_listing
            .join_or_capture(KEY_LISTING_TASK, move || async move {
                match store.inner.storage.get_all_keys().await {
                    Ok(keys) => {
                        store.inner.cache.set_all_keys(keys);
                        store.inner.cache.all_keys().unwrap_or_default()
                    }
                    Err(e) => {
                        info!(error = %e, "failed to list storage keys");
                        Vec::new()
                    }
                }
            })
            .await
    }

    /// Whether a read or key listing with this task name is in flight.
    pub fn has_pending_task(&self, name: &str) -> bool {
        self.inner.reads.has_pending(name) || self.inner.key_listing.has_pending(name)
    }

    // --- Writes ---

    /// Replace the value of `key`. `null` removes the key.
    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        if value.is_null() {
            return self.remove(key).await;
        }

        // A direct set supersedes queued merges.
        if self.inner.merges.take(key).is_some() {
            debug!(key = %key, "set discarded pending merge changes");
        }

        let Some(value) = remove_null_values(Some(value), true).value else {
            return Ok(());
        };
        let has_changed = self.inner.cache.has_value_changed(key, &value);
        let ticket = self.broadcast_update(key, &value, has_changed);

        let written = async {
            if has_changed {
                self.persist(WriteOp::Set {
                    key: key.to_string(),
                    value: value.clone(),
                })
                .await?;
                self.inner
                    .debug_sink
                    .record_action("set", &keyed(key, value), None);
            }
            Ok::<(), StoreError>(())
        }
        .await;
        self.finish_write(ticket, written).await
    }

    /// Replace several keys. `null` entries remove their key.
    pub async fn multi_set(&self, data: Map<String, Value>) -> Result<()> {
        let inner = &self.inner;
        let prepared = prepare_for_storage(
            data.into_iter().map(|(key, value)| (key, Some(value))),
            true,
        );
        let mut ticket = inner.scheduler.current_ticket();

        let mut collections: BTreeMap<String, (Collection, Collection)> = BTreeMap::new();
        for (key, value) in &prepared.pairs {
            inner.merges.take(key);
            match inner.keys.collection_key_for(key) {
                Some(collection_key) => {
                    let (partial, _) = collections
                        .entry(collection_key.to_string())
                        .or_insert_with(|| (Collection::new(), inner.cache.collection(collection_key)));
                    partial.insert(key.clone(), value.clone());
                    inner.cache.set(key, value.clone());
                    inner.eviction.record_access(key);
                }
                None => {
                    let has_changed = inner.cache.has_value_changed(key, value);
                    ticket = self.broadcast_update(key, value, has_changed);
                }
            }
        }
        for (collection_key, (partial, previous)) in collections {
            ticket = self.schedule_notify_collection(&collection_key, partial, previous);
        }
        for key in &prepared.removed {
            inner.merges.take(key);
            inner.cache.drop_key(key);
            inner.cache.mark_absent(key);
            inner.eviction.forget_access(key);
            ticket = self.schedule_subscriber_update(key, None, true);
        }

        let written = async {
            if !prepared.removed.is_empty() {
                inner.storage.remove_items(&prepared.removed).await?;
            }
            if !prepared.pairs.is_empty() {
                let payload = Value::Object(prepared.pairs.iter().cloned().collect());
                self.persist(WriteOp::MultiSet(prepared.pairs)).await?;
                inner.debug_sink.record_action("multi_set", &payload, None);
            }
            Ok::<(), StoreError>(())
        }
        .await;
        self.finish_write(ticket, written).await
    }

    /// Deep-merge `change` into `key`.
    ///
    /// Merges issued for the same key before the first one is applied are
    /// batched into a single write; every caller resolves once it lands.
    pub async fn merge(&self, key: &str, change: Value) -> Result<()> {
        let store = self.clone();
        let owned = key.to_string();
        let operation = self.inner.merges.enqueue(key, change, move || {
            async move { store.apply_queued_merge(&owned).await }.boxed()
        });
        operation.await
    }

    async fn apply_queued_merge(&self, key: &str) -> Result<()> {
        // Let merges issued in the same turn join the queue.
        tokio::task::yield_now().await;

        let existing = self.get(key).await;
        let Some(changes) = self.inner.merges.take(key) else {
            debug!(key = %key, "merge superseded before it ran");
            return Ok(());
        };

        let valid: Vec<Value> = changes
            .into_iter()
            .filter(|change| match check_compatibility(change, existing.as_ref()) {
                Compatibility::Compatible => true,
                Compatibility::Incompatible {
                    existing: existing_kind,
                    change: change_kind,
                } => {
                    error!(
                        key = %key,
                        existing = existing_kind,
                        change = change_kind,
                        "dropping incompatible merge change"
                    );
                    false
                }
            })
            .collect();

        let Some(batched) = apply_merge(None, &valid, false) else {
            info!(key = %key, "no applicable merge changes");
            return Ok(());
        };
        if remove_null_values(Some(batched.clone()), false).was_removed {
            return self.remove(key).await;
        }

        let should_set = existing.is_none() || valid.iter().any(Value::is_null);
        let base = if should_set { None } else { existing.as_ref() };
        let Some(merged) = apply_merge(base, std::slice::from_ref(&batched), true) else {
            return Ok(());
        };

        let has_changed = self.inner.cache.has_value_changed(key, &merged);
        let ticket = self.broadcast_update(key, &merged, has_changed);

        let written = async {
            if has_changed {
                self.persist(WriteOp::Set {
                    key: key.to_string(),
                    value: merged.clone(),
                })
                .await?;
                self.inner.debug_sink.record_action(
                    "merge",
                    &keyed(key, Value::Array(valid)),
                    Some(&keyed(key, merged)),
                );
            }
            Ok::<(), StoreError>(())
        }
        .await;
        self.finish_write(ticket, written).await
    }

    /// Whether merges for `key` are queued and not yet applied.
    pub fn has_pending_merge(&self, key: &str) -> bool {
        self.inner.merges.has_pending(key)
    }

    /// Merge several members of one collection and notify its subscribers
    /// once.
    pub async fn merge_collection(&self, collection_key: &str, collection: Collection) -> Result<()> {
        if collection.is_empty() {
            info!(collection = %collection_key, "merge_collection called with no members");
            return Ok(());
        }
        if let Some(key) = collection
            .keys()
            .find(|key| !is_collection_member_key(collection_key, key))
        {
            return Err(StoreError::InvalidKeyFormat(format!(
                "{key} is not a member of collection {collection_key}"
            )));
        }

        let inner = &self.inner;
        let member_keys: Vec<String> = collection.keys().cloned().collect();
        let existing = self.get_many(&member_keys).await;
        let previous = inner.cache.collection(collection_key);

        let mut partial = Collection::new();
        let mut pairs = Vec::new();
        let mut removed = Vec::new();

        for (key, change) in collection {
            // Changes queued by `merge` are folded in here; their operation
            // finds the queue empty and resolves without writing.
            let queued = inner.merges.take(&key).unwrap_or_default();
            if change.is_null() {
                partial.insert(key.clone(), Value::Null);
                removed.push(key);
                continue;
            }

            let current = inner
                .cache
                .peek(&key)
                .or_else(|| existing.get(&key).cloned().flatten());
            let changes: Vec<Value> = queued
                .into_iter()
                .chain(std::iter::once(change))
                .filter(|change| match check_compatibility(change, current.as_ref()) {
                    Compatibility::Compatible => true,
                    Compatibility::Incompatible {
                        existing: existing_kind,
                        change: change_kind,
                    } => {
                        error!(
                            key = %key,
                            existing = existing_kind,
                            change = change_kind,
                            "dropping incompatible collection member change"
                        );
                        false
                    }
                })
                .collect();
            if changes.is_empty() {
                continue;
            }
            let Some(merged) = apply_merge(current.as_ref(), &changes, true) else {
                continue;
            };
            partial.insert(key.clone(), merged.clone());
            pairs.push((key, merged));
        }

        for (key, value) in &pairs {
            inner.cache.set(key, value.clone());
            inner.eviction.record_access(key);
        }
        for key in &removed {
            inner.cache.drop_key(key);
            inner.cache.mark_absent(key);
            inner.eviction.forget_access(key);
        }

        let payload = Value::Object(partial.clone());
        let ticket = self.schedule_notify_collection(collection_key, partial, previous);

        let written = async {
            if !removed.is_empty() {
                inner.storage.remove_items(&removed).await?;
            }
            if !pairs.is_empty() {
                self.persist(WriteOp::MultiSet(pairs)).await?;
            }
            inner
                .debug_sink
                .record_action("merge_collection", &keyed(collection_key, payload), None);
            Ok::<(), StoreError>(())
        }
        .await;
        self.finish_write(ticket, written).await
    }

    /// Delete `key` from the cache and storage, notifying subscribers.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let inner = &self.inner;
        inner.cache.drop_key(key);
        inner.cache.mark_absent(key);
        inner.eviction.forget_access(key);

        let ticket = self.schedule_subscriber_update(key, None, true);
        let written = inner.storage.remove_item(key).await;
        if written.is_ok() {
            inner.debug_sink.record_action("remove", &keyed(key, Value::Null), None);
        }
        self.finish_write(ticket, written).await
    }

    /// Reset every key to its default state, or remove it if it has none.
    ///
    /// Keys in `keys_to_preserve` keep their value. Pending merges are
    /// discarded.
    pub async fn clear(&self, keys_to_preserve: &[String]) -> Result<()> {
        let inner = &self.inner;
        let defaults = &inner.config.initial_key_states;
        let preserved: HashSet<&str> = keys_to_preserve.iter().map(String::as_str).collect();

        let mut keys = self.get_all_keys().await;
        keys.extend(defaults.keys().cloned());
        keys.sort();
        keys.dedup();

        inner.merges.clear();

        let mut individual: Vec<(String, Option<Value>)> = Vec::new();
        let mut collections: BTreeMap<String, (Collection, Collection)> = BTreeMap::new();
        let mut to_remove = Vec::new();

        for key in keys {
            if preserved.contains(key.as_str()) {
                continue;
            }
            let new_value = defaults.get(&key).cloned();
            if new_value.is_none() {
                to_remove.push(key.clone());
            }

            let old_value = inner.cache.peek(&key);
            if new_value == old_value {
                continue;
            }

            let collection_key = inner.keys.collection_key_for(&key).map(str::to_string);
            if let Some(collection_key) = &collection_key {
                collections
                    .entry(collection_key.clone())
                    .or_insert_with(|| (Collection::new(), inner.cache.collection(collection_key)));
            }

            match &new_value {
                Some(value) => {
                    inner.cache.set(&key, value.clone());
                    if collection_key.is_some() {
                        inner.eviction.record_access(&key);
                    }
                }
                None => {
                    inner.cache.drop_key(&key);
                    inner.cache.mark_absent(&key);
                    inner.eviction.forget_access(&key);
                }
            }

            let group = match &collection_key {
                Some(collection_key) => collections.get_mut(collection_key),
                None => None,
            };
            match group {
                Some((partial, _)) => {
                    partial.insert(key, new_value.unwrap_or(Value::Null));
                }
                None => individual.push((key, new_value)),
            }
        }

        let mut ticket = inner.scheduler.current_ticket();
        for (key, value) in individual {
            ticket = self.schedule_subscriber_update(&key, value, true);
        }
        for (collection_key, (partial, previous)) in collections {
            ticket = self.schedule_notify_collection(&collection_key, partial, previous);
        }

        let restored: Vec<(Key, Value)> = defaults
            .iter()
            .filter(|(key, _)| !preserved.contains(key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let written = async {
            if !to_remove.is_empty() {
                inner.storage.remove_items(&to_remove).await?;
            }
            if !restored.is_empty() {
                self.persist(WriteOp::MultiSet(restored)).await?;
            }
            info!(removed = to_remove.len(), preserved = preserved.len(), "store cleared");
            inner
                .debug_sink
                .record_action("clear", &Value::from(keys_to_preserve.to_vec()), None);
            Ok::<(), StoreError>(())
        }
        .await;
        self.finish_write(ticket, written).await
    }

    /// Apply a batch of operations.
    ///
    /// Clears run first, in order; everything else then runs concurrently so
    /// same-key merges coalesce and managed subscribers see one update.
    pub async fn update(&self, updates: Vec<Update>) -> Result<()> {
        let (clears, rest): (Vec<Update>, Vec<Update>) = updates
            .into_iter()
            .partition(|update| matches!(update, Update::Clear { .. }));

        for update in clears {
            if let Update::Clear { keys_to_preserve } = update {
                self.clear(&keys_to_preserve).await?;
            }
        }

        let operations: Vec<BoxFuture<'_, Result<()>>> = rest
            .into_iter()
            .map(|update| match update {
                Update::Set { key, value } => async move { self.set(&key, value).await }.boxed(),
                Update::Merge { key, value } => {
                    async move { self.merge(&key, value).await }.boxed()
                }
                Update::MergeCollection { key, value } => {
                    async move { self.merge_collection(&key, value).await }.boxed()
                }
                Update::MultiSet { value } => async move { self.multi_set(value).await }.boxed(),
                Update::Clear { keys_to_preserve } => {
                    async move { self.clear(&keys_to_preserve).await }.boxed()
                }
            })
            .collect();

        join_all(operations)
            .await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    // --- Eviction ---

    /// Whether `key` matches a safe eviction pattern.
    pub fn is_safe_eviction_key(&self, key: &str) -> bool {
        self.inner.eviction.is_safe_eviction_key(key)
    }

    /// Keep `key` in storage while `connection` needs it.
    pub fn add_to_eviction_block_list(&self, key: &str, connection: ConnectionId) {
        self.inner.eviction.block(key, connection);
    }

    pub fn remove_from_eviction_block_list(&self, key: &str, connection: ConnectionId) {
        self.inner.eviction.unblock(key, connection);
    }

    /// Eviction candidates, least recently used first.
    pub fn eviction_candidates(&self) -> Vec<String> {
        self.inner.eviction.recency_list()
    }

    /// Run a storage write, evicting keys while storage reports it is full.
    /// Run the managed tier for `ticket`, then hand back the storage outcome.
    /// Subscribers already saw the write, so both tiers settle even when
    /// storage rejected it.
    async fn finish_write(&self, ticket: BatchTicket, written: Result<()>) -> Result<()> {
        self.inner.scheduler.settle(ticket).await;
        written
    }

    async fn persist(&self, op: WriteOp) -> Result<()> {
        let mut attempt = 0;
        loop {
            let error = match op.apply(self.inner.storage.as_ref()).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if !self.evict_and_retry(error, &op, attempt).await? {
                return Ok(());
            }
            attempt += 1;
        }
    }

    /// Free space after a failed write. Returns whether the write should be
    /// tried again; `Ok(false)` drops it.
    async fn evict_and_retry(&self, error: StoreError, op: &WriteOp, attempt: usize) -> Result<bool> {
        let operation = op.name();
        if error.is_fatal_write_error() {
            error!(operation, error = %error, "failed to save to storage, data is not serializable");
            return Err(error);
        }

        info!(operation, attempt, error = %error, "storage write failed, trying to free space");

        if attempt >= self.inner.config.max_eviction_retries {
            error!(operation, attempt, "giving up on storage write after repeated evictions");
            self.report_storage_quota().await;
            return Ok(false);
        }

        let Some(key) = self.inner.eviction.key_for_eviction_except(&op.keys()) else {
            error!(operation, "out of storage, nothing evictable");
            self.report_storage_quota().await;
            return Ok(false);
        };

        info!(key = %key, operation, "evicting key to free storage");
        self.report_storage_quota().await;
        self.remove(&key).await?;
        Ok(true)
    }

    async fn report_storage_quota(&self) {
        match self.inner.storage.get_database_size().await {
            Ok(size) => info!(
                bytes_used = size.bytes_used,
                bytes_remaining = size.bytes_remaining,
                "storage quota"
            ),
            Err(e) => info!(error = %e, "unable to read storage quota"),
        }
    }

    // --- Notification ---

    /// Commit `value` to the cache and queue subscriber deliveries.
    fn broadcast_update(&self, key: &str, value: &Value, has_changed: bool) -> BatchTicket {
        if has_changed {
            self.inner.cache.set(key, value.clone());
        } else {
            self.inner.cache.mark_accessed(key);
        }
        self.schedule_subscriber_update(key, Some(value.clone()), has_changed)
    }

    /// Deliver a key change: callbacks now, managed state in the open batch.
    fn schedule_subscriber_update(&self, key: &str, value: Option<Value>, has_changed: bool) -> BatchTicket {
        let scheduler = &self.inner.scheduler;

        let subscriptions = Arc::clone(&self.inner.subscriptions);
        let callback_key = key.to_string();
        let callback_value = value.clone();
        scheduler.schedule_immediate(Box::new(move || {
            subscriptions.key_changed(&callback_key, callback_value.as_ref(), has_changed, true, false)
        }));

        let subscriptions = Arc::clone(&self.inner.subscriptions);
        let managed_key = key.to_string();
        let ticket = scheduler.schedule_batched(Box::new(move || {
            subscriptions.key_changed(&managed_key, value.as_ref(), has_changed, false, true)
        }));

        scheduler.flush_immediate();
        ticket
    }

    /// Deliver a collection change to both tiers.
    fn schedule_notify_collection(
        &self,
        collection_key: &str,
        partial: Collection,
        previous: Collection,
    ) -> BatchTicket {
        let scheduler = &self.inner.scheduler;

        let subscriptions = Arc::clone(&self.inner.subscriptions);
        let callback_key = collection_key.to_string();
        let callback_partial = partial.clone();
        let callback_previous = previous.clone();
        scheduler.schedule_immediate(Box::new(move || {
            subscriptions.keys_changed(
                &callback_key,
                &callback_partial,
                Some(&callback_previous),
                true,
                false,
            )
        }));

        let subscriptions = Arc::clone(&self.inner.subscriptions);
        let managed_key = collection_key.to_string();
        let ticket = scheduler.schedule_batched(Box::new(move || {
            subscriptions.keys_changed(&managed_key, &partial, Some(&previous), false, true)
        }));

        scheduler.flush_immediate();
        ticket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::MemoryDebugSink;
    use crate::storage::MemoryStorage;
    use parking_lot::Mutex;
    use serde_json::json;

    fn config() -> StoreConfig {
        StoreConfig {
            collection_keys: vec!["report_".to_string()],
            safe_eviction_keys: vec!["report_".to_string()],
            ..StoreConfig::default()
        }
    }

    async fn open(storage: Arc<MemoryStorage>) -> Store {
        Store::open(config(), storage).await.unwrap()
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config = StoreConfig::from_json(
            r#"{"collection_keys": ["report_"], "initial_key_states": {"session": {"loggedIn": false}}}"#,
        )
        .unwrap();

        assert_eq!(config.collection_keys, vec!["report_"]);
        assert_eq!(config.max_cached_keys, DEFAULT_MAX_CACHED_KEYS);
        assert_eq!(config.max_eviction_retries, DEFAULT_MAX_EVICTION_RETRIES);
    }

    #[test]
    fn test_malformed_config_is_a_serialization_error() {
        let result = StoreConfig::from_json(r#"{"max_cached_keys": "many"}"#);
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let storage = Arc::new(MemoryStorage::new());
        let store = open(Arc::clone(&storage)).await;

        store.set("session", json!({"token": "abc", "stale": null})).await.unwrap();

        assert_eq!(store.get("session").await, Some(json!({"token": "abc"})));
        assert_eq!(storage.snapshot()["session"], json!({"token": "abc"}));
    }

    #[tokio::test]
    async fn test_unchanged_set_skips_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let store = open(Arc::clone(&storage)).await;

        store.set("a", json!(1)).await.unwrap();
        store.set("a", json!(1)).await.unwrap();

        assert_eq!(storage.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_set_null_removes() {
        let storage = Arc::new(MemoryStorage::with_entries(vec![("a".to_string(), json!(1))]));
        let store = open(Arc::clone(&storage)).await;

        store.set("a", Value::Null).await.unwrap();

        assert_eq!(store.get("a").await, None);
        assert!(storage.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_defaults_sit_under_stored_values() {
        let storage = Arc::new(MemoryStorage::with_entries(vec![(
            "session".to_string(),
            json!({"token": "abc"}),
        )]));
        let mut config = config();
        config.initial_key_states = serde_json::from_value(json!({
            "session": {"token": null, "loggedIn": false},
            "theme": "dark"
        }))
        .unwrap();

        let store = Store::open(config, storage.clone()).await.unwrap();

        assert_eq!(
            store.get("session").await,
            Some(json!({"token": "abc", "loggedIn": false}))
        );
        assert_eq!(store.get("theme").await, Some(json!("dark")));

        // Only the default that was never stored is written.
        let stored = storage.snapshot();
        assert_eq!(stored.get("theme"), Some(&json!("dark")));
        assert_eq!(stored.get("session"), Some(&json!({"token": "abc"})));
        assert_eq!(storage.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_managed_evictable_key_requires_can_evict() {
        let store = open(Arc::new(MemoryStorage::new())).await;
        let target: Arc<dyn crate::subscriptions::StateTarget> = Arc::new(NullTarget);

        let result = store
            .connect(ConnectOptions::managed("report_1", Arc::clone(&target), "report"))
            .await;
        assert!(matches!(result, Err(StoreError::InvalidOperation(_))));

        let id = store
            .connect(ConnectOptions::managed("report_1", target, "report").can_evict(false))
            .await
            .unwrap();
        store.set("report_1", json!({"x": 1})).await.unwrap();
        assert!(store.eviction_candidates().contains(&"report_1".to_string()));

        assert!(store.disconnect(id));
        assert!(!store.disconnect(id));
    }

    struct NullTarget;

    impl crate::subscriptions::StateTarget for NullTarget {
        fn state(&self) -> crate::types::StateMap {
            crate::types::StateMap::new()
        }

        fn replace_state_slice(&self, _name: &str, _updater: crate::subscriptions::SliceUpdater) {}

        fn set_state_slice(&self, _name: &str, _value: Value) {}
    }

    #[tokio::test]
    async fn test_merge_collection_rejects_foreign_keys() {
        let store = open(Arc::new(MemoryStorage::new())).await;
        let members: Collection = serde_json::from_value(json!({"session": 1})).unwrap();

        let result = store.merge_collection("report_", members).await;
        assert!(matches!(result, Err(StoreError::InvalidKeyFormat(_))));
    }

    #[tokio::test]
    async fn test_debug_sink_records_writes() {
        let sink = Arc::new(MemoryDebugSink::new());
        let hooks = StoreHooks {
            debug_sink: sink.clone(),
            ..StoreHooks::default()
        };
        let store = Store::open_with(config(), Arc::new(MemoryStorage::new()), hooks)
            .await
            .unwrap();

        store.set("a", json!(1)).await.unwrap();
        store.merge("b", json!({"x": 1})).await.unwrap();
        store.remove("a").await.unwrap();

        assert_eq!(sink.labels(), vec!["set", "merge", "remove"]);
        assert_eq!(sink.actions()[1].diff, Some(json!({"b": {"x": 1}})));
    }

    #[tokio::test]
    async fn test_callback_receives_initial_and_updates() {
        let store = open(Arc::new(MemoryStorage::new())).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        store
            .connect(ConnectOptions::callback("session", move |value, _| {
                sink.lock().push(value.cloned());
            }))
            .await
            .unwrap();
        store.set("session", json!(1)).await.unwrap();

        assert_eq!(*seen.lock(), vec![None, Some(json!(1))]);
    }
}
