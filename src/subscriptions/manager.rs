//! Subscription registry and change fan-out.

use crate::cache::ValueCache;
use crate::eviction::EvictionManager;
use crate::keys::{is_collection_member_key, KeyRegistry};
use crate::merge::is_empty_object;
use crate::scheduler::UpdateScheduler;
use crate::types::{Collection, ConnectionId, StateMap};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::types::{ConnectOptions, Delivery, Notification, Selector};

type Registry = Arc<RwLock<BTreeMap<ConnectionId, Arc<Subscription>>>>;

/// Internal subscription state.
struct Subscription {
    options: ConnectOptions,
}

/// Holds active subscriptions and decides who hears about which change.
///
/// Fan-out never holds the registry lock while delivering, so subscribers
/// may connect, disconnect or write from inside a delivery.
pub struct SubscriptionManager {
    /// Active subscriptions in connection order.
    subscriptions: Registry,
    /// Counter for generating connection IDs.
    next_id: AtomicU64,
    keys: KeyRegistry,
    cache: Arc<ValueCache>,
    eviction: Arc<EvictionManager>,
    scheduler: Arc<UpdateScheduler>,
}

impl SubscriptionManager {
    pub fn new(
        keys: KeyRegistry,
        cache: Arc<ValueCache>,
        eviction: Arc<EvictionManager>,
        scheduler: Arc<UpdateScheduler>,
    ) -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
            keys,
            cache,
            eviction,
            scheduler,
        }
    }

    /// Register a subscription.
    pub fn subscribe(&self, options: ConnectOptions) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions
            .write()
            .insert(id, Arc::new(Subscription { options }));
        id
    }

    /// Remove a subscription, returning its options.
    pub fn unsubscribe(&self, id: ConnectionId) -> Option<ConnectOptions> {
        self.subscriptions
            .write()
            .remove(&id)
            .map(|subscription| subscription.options.clone())
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.subscriptions.read().contains_key(&id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    fn snapshot(&self) -> Vec<(ConnectionId, Arc<Subscription>)> {
        self.subscriptions
            .read()
            .iter()
            .map(|(id, subscription)| (*id, Arc::clone(subscription)))
            .collect()
    }

    // --- Fan-out ---

    /// Notify subscribers matching `key` that it now holds `value`.
    ///
    /// Unchanged writes only reach subscribers that skipped stored values on
    /// connect.
    pub fn key_changed(
        &self,
        key: &str,
        value: Option<&Value>,
        has_changed: bool,
        notify_callbacks: bool,
        notify_managed: bool,
    ) {
        match value {
            Some(v) if !v.is_null() => self.eviction.record_access(key),
            _ => self.eviction.forget_access(key),
        }

        for (id, subscription) in self.snapshot() {
            let options = &subscription.options;
            if !self.keys.is_key_match(&options.key, key) {
                continue;
            }
            if !has_changed && options.init_with_stored_values {
                continue;
            }

            match options.delivery {
                Delivery::Callback(_) => {
                    if !notify_callbacks {
                        continue;
                    }
                    if self.keys.is_collection_key(&options.key)
                        && options.wait_for_collection_callback
                    {
                        let mut collection = self.cache.collection(&options.key);
                        match value {
                            Some(v) if !v.is_null() => {
                                collection.insert(key.to_string(), v.clone());
                            }
                            _ => {
                                collection.remove(key);
                            }
                        }
                        self.send_to_subscriber(
                            id,
                            Notification::Collection {
                                key: options.key.clone(),
                                members: Value::Object(collection),
                            },
                        );
                        continue;
                    }
                    self.send_to_subscriber(
                        id,
                        Notification::Key {
                            key: key.to_string(),
                            value: value.cloned(),
                        },
                    );
                }
                Delivery::Managed { .. } => {
                    if !notify_managed {
                        continue;
                    }
                    self.send_to_subscriber(
                        id,
                        Notification::Key {
                            key: key.to_string(),
                            value: value.cloned(),
                        },
                    );
                }
            }
        }
    }

    /// Notify subscribers of `collection_key` that the members in `partial`
    /// changed. `previous` holds the members' values before the change.
    pub fn keys_changed(
        &self,
        collection_key: &str,
        partial: &Collection,
        previous: Option<&Collection>,
        notify_callbacks: bool,
        notify_managed: bool,
    ) {
        let full = self.cache.collection(collection_key);
        let empty = Collection::new();
        let previous = previous.unwrap_or(&empty);
        let is_changed = |key: &String| full.get(key) != previous.get(key);

        for (id, subscription) in self.snapshot() {
            let options = &subscription.options;
            if !options.key.starts_with(collection_key) {
                continue;
            }
            let is_whole_collection = options.key == collection_key;
            let is_member = is_collection_member_key(collection_key, &options.key);

            match options.delivery {
                Delivery::Callback(_) => {
                    if !notify_callbacks {
                        continue;
                    }
                    if is_whole_collection && options.wait_for_collection_callback {
                        self.send_to_subscriber(
                            id,
                            Notification::Collection {
                                key: collection_key.to_string(),
                                members: Value::Object(full.clone()),
                            },
                        );
                    } else if is_whole_collection {
                        for member in partial.keys().filter(|&key| is_changed(key)) {
                            self.send_to_subscriber(
                                id,
                                Notification::Key {
                                    key: member.clone(),
                                    value: full.get(member).cloned(),
                                },
                            );
                        }
                    } else if is_member && is_changed(&options.key) {
                        self.send_to_subscriber(
                            id,
                            Notification::Key {
                                key: options.key.clone(),
                                value: full.get(&options.key).cloned(),
                            },
                        );
                    }
                }
                Delivery::Managed { .. } => {
                    if !notify_managed {
                        continue;
                    }
                    if is_whole_collection {
                        self.send_to_subscriber(
                            id,
                            Notification::Members {
                                changed: partial.keys().cloned().collect(),
                                full: Value::Object(full.clone()),
                            },
                        );
                    } else if is_member
                        && is_changed(&options.key)
                        && partial.contains_key(&options.key)
                    {
                        self.send_to_subscriber(
                            id,
                            Notification::Key {
                                key: options.key.clone(),
                                value: full.get(&options.key).cloned(),
                            },
                        );
                    }
                }
            }
        }
    }

    // --- Delivery ---

    /// Single delivery point for every notification.
    ///
    /// Re-checks that the subscription is still registered, applies its
    /// selector and either invokes the callback or hands a replacement to the
    /// managed target.
    pub(crate) fn send_to_subscriber(&self, id: ConnectionId, notification: Notification) {
        let Some(subscription) = self.subscriptions.read().get(&id).cloned() else {
            debug!(connection = %id, "subscription gone before delivery");
            return;
        };
        let options = &subscription.options;
        let selector = options.selector.clone();
        let is_collection = self.keys.is_collection_key(&options.key);

        match &options.delivery {
            Delivery::Callback(callback) => {
                let no_state = StateMap::new();
                match notification {
                    Notification::Key { key, value } => {
                        let selected = select(selector.as_ref(), value.as_ref(), &no_state);
                        callback(selected.as_ref(), &key);
                    }
                    Notification::Collection { key, members } => {
                        let selected = reduce_collection(selector.as_ref(), &members, &no_state);
                        callback(Some(&selected), &key);
                    }
                    Notification::Members { changed, full } => {
                        for key in changed {
                            let selected = select(selector.as_ref(), full.get(&key), &no_state);
                            callback(selected.as_ref(), &key);
                        }
                    }
                    Notification::Initial { key, value, .. } => {
                        let selected = if is_collection && key == options.key {
                            value.map(|members| {
                                reduce_collection(selector.as_ref(), &members, &no_state)
                            })
                        } else {
                            select(selector.as_ref(), value.as_ref(), &no_state)
                        };
                        callback(selected.as_ref(), &key);
                    }
                }
            }
            Delivery::Managed { target, state_name } => {
                let name = state_name.clone();
                match notification {
                    Notification::Key { key, value } if is_collection => {
                        target.replace_state_slice(
                            state_name,
                            Box::new(move |state: &StateMap| {
                                let previous = state.get(&name);
                                let mut next = match previous {
                                    Some(Value::Object(members)) => members.clone(),
                                    _ => Map::new(),
                                };
                                match select(selector.as_ref(), value.as_ref(), state) {
                                    Some(selected) => {
                                        next.insert(key, selected);
                                    }
                                    None => {
                                        next.remove(&key);
                                    }
                                }
                                let next = Value::Object(next);
                                (previous != Some(&next)).then_some(next)
                            }),
                        );
                    }
                    Notification::Key { value, .. } => {
                        target.replace_state_slice(
                            state_name,
                            Box::new(move |state: &StateMap| {
                                let previous = state.get(&name);
                                let next = select(selector.as_ref(), value.as_ref(), state)
                                    .unwrap_or(Value::Null);
                                if is_empty_object(Some(&next)) && is_empty_object(previous) {
                                    return None;
                                }
                                (previous != Some(&next)).then_some(next)
                            }),
                        );
                    }
                    Notification::Collection { members, .. } => {
                        target.replace_state_slice(
                            state_name,
                            Box::new(move |state: &StateMap| {
                                let next = reduce_collection(selector.as_ref(), &members, state);
                                (state.get(&name) != Some(&next)).then_some(next)
                            }),
                        );
                    }
                    Notification::Members { changed, full } => {
                        target.replace_state_slice(
                            state_name,
                            Box::new(move |state: &StateMap| {
                                let previous = state.get(&name);
                                let next = if selector.is_some() {
                                    reduce_collection(selector.as_ref(), &full, state)
                                } else {
                                    let mut next = match previous {
                                        Some(Value::Object(members)) => members.clone(),
                                        _ => Map::new(),
                                    };
                                    for key in changed {
                                        match full.get(&key) {
                                            Some(value) => {
                                                next.insert(key, value.clone());
                                            }
                                            None => {
                                                next.remove(&key);
                                            }
                                        }
                                    }
                                    Value::Object(next)
                                };
                                (previous != Some(&next)).then_some(next)
                            }),
                        );
                    }
                    Notification::Initial { value, batched, .. } => {
                        let target = Arc::clone(target);
                        let registry = Arc::clone(&self.subscriptions);
                        let deliver = move || {
                            if !registry.read().contains_key(&id) {
                                return;
                            }
                            let state = target.state();
                            let next = if is_collection {
                                let members = value.unwrap_or_else(|| Value::Object(Map::new()));
                                reduce_collection(selector.as_ref(), &members, &state)
                            } else {
                                select(selector.as_ref(), value.as_ref(), &state)
                                    .unwrap_or(Value::Null)
                            };
                            target.set_state_slice(&name, next);
                        };
                        if batched {
                            self.scheduler.schedule_batched(Box::new(deliver));
                        } else {
                            deliver();
                        }
                    }
                }
            }
        }
    }
}

fn select(selector: Option<&Selector>, value: Option<&Value>, state: &StateMap) -> Option<Value> {
    match selector {
        Some(selector) => selector(value, state),
        None => value.cloned(),
    }
}

/// Apply `selector` to every member of a collection object.
fn reduce_collection(selector: Option<&Selector>, members: &Value, state: &StateMap) -> Value {
    let (Some(selector), Value::Object(members)) = (selector, members) else {
        return members.clone();
    };
    Value::Object(
        members
            .iter()
            .filter_map(|(key, value)| selector(Some(value), state).map(|v| (key.clone(), v)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::types::SliceUpdater;
    use crate::subscriptions::StateTarget;
    use parking_lot::Mutex;
    use serde_json::json;

    type Deliveries = Arc<Mutex<Vec<(Option<Value>, String)>>>;

    fn manager(cache: Arc<ValueCache>) -> SubscriptionManager {
        let keys = KeyRegistry::new(["report_"]);
        let eviction = Arc::new(EvictionManager::new(keys.clone(), vec!["report_".into()]));
        SubscriptionManager::new(keys, cache, eviction, Arc::new(UpdateScheduler::default()))
    }

    fn recording(key: &str) -> (ConnectOptions, Deliveries) {
        let log: Deliveries = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let options = ConnectOptions::callback(key, move |value, key| {
            sink.lock().push((value.cloned(), key.to_string()));
        });
        (options, log)
    }

    /// Applies updaters immediately and counts accepted replacements.
    #[derive(Default)]
    struct SliceTarget {
        state: Mutex<StateMap>,
        replacements: Mutex<usize>,
    }

    impl StateTarget for SliceTarget {
        fn state(&self) -> StateMap {
            self.state.lock().clone()
        }

        fn replace_state_slice(&self, name: &str, updater: SliceUpdater) {
            let snapshot = self.state();
            if let Some(next) = updater(&snapshot) {
                self.state.lock().insert(name.to_string(), next);
                *self.replacements.lock() += 1;
            }
        }

        fn set_state_slice(&self, name: &str, value: Value) {
            self.state.lock().insert(name.to_string(), value);
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let manager = manager(Arc::new(ValueCache::default()));
        let (options, _) = recording("session");

        let id = manager.subscribe(options);
        assert_eq!(manager.subscription_count(), 1);
        assert!(manager.is_connected(id));

        assert!(manager.unsubscribe(id).is_some());
        assert_eq!(manager.subscription_count(), 0);
        assert!(manager.unsubscribe(id).is_none());
    }

    #[test]
    fn test_key_changed_reaches_matching_callbacks() {
        let manager = manager(Arc::new(ValueCache::default()));
        let (session, session_log) = recording("session");
        let (other, other_log) = recording("other");
        manager.subscribe(session);
        manager.subscribe(other);

        manager.key_changed("session", Some(&json!(1)), true, true, true);

        assert_eq!(*session_log.lock(), vec![(Some(json!(1)), "session".to_string())]);
        assert!(other_log.lock().is_empty());
    }

    #[test]
    fn test_unchanged_write_only_reaches_subscribers_without_stored_values() {
        let manager = manager(Arc::new(ValueCache::default()));
        let (regular, regular_log) = recording("session");
        let (eager, eager_log) = recording("session");
        manager.subscribe(regular);
        manager.subscribe(eager.without_stored_values());

        manager.key_changed("session", Some(&json!(1)), false, true, true);

        assert!(regular_log.lock().is_empty());
        assert_eq!(eager_log.lock().len(), 1);
    }

    #[test]
    fn test_wait_for_collection_receives_whole_collection() {
        let cache = Arc::new(ValueCache::default());
        cache.set("report_1", json!({"x": 1}));
        cache.set("report_2", json!({"x": 2}));
        let manager = manager(Arc::clone(&cache));
        let (options, log) = recording("report_");
        manager.subscribe(options.wait_for_collection());

        manager.key_changed("report_2", Some(&json!({"x": 5})), true, true, true);

        assert_eq!(
            *log.lock(),
            vec![(
                Some(json!({"report_1": {"x": 1}, "report_2": {"x": 5}})),
                "report_".to_string()
            )]
        );
    }

    #[test]
    fn test_collection_fan_out_only_changed_members() {
        let cache = Arc::new(ValueCache::default());
        cache.set("report_1", json!({"x": 9}));
        cache.set("report_2", json!({"x": 2}));
        let manager = manager(Arc::clone(&cache));
        let (options, log) = recording("report_");
        manager.subscribe(options);

        let previous: Collection = serde_json::from_value(json!({
            "report_1": {"x": 1},
            "report_2": {"x": 2}
        }))
        .unwrap();
        let partial: Collection = serde_json::from_value(json!({"report_1": {"x": 9}})).unwrap();

        manager.keys_changed("report_", &partial, Some(&previous), true, true);

        assert_eq!(*log.lock(), vec![(Some(json!({"x": 9})), "report_1".to_string())]);
    }

    #[test]
    fn test_member_subscriber_skips_unchanged_member() {
        let cache = Arc::new(ValueCache::default());
        cache.set("report_1", json!({"x": 1}));
        let manager = manager(Arc::clone(&cache));
        let (options, log) = recording("report_1");
        manager.subscribe(options);

        let previous: Collection = serde_json::from_value(json!({"report_1": {"x": 1}})).unwrap();
        manager.keys_changed("report_", &previous.clone(), Some(&previous), true, true);

        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_managed_single_key_suppresses_equal_values() {
        let manager = manager(Arc::new(ValueCache::default()));
        let target = Arc::new(SliceTarget::default());
        manager.subscribe(ConnectOptions::managed("session", target.clone(), "session"));

        manager.key_changed("session", Some(&json!({"a": 1})), true, false, true);
        manager.key_changed("session", Some(&json!({"a": 1})), true, false, true);

        assert_eq!(*target.replacements.lock(), 1);
        assert_eq!(target.state()["session"], json!({"a": 1}));
    }

    #[test]
    fn test_managed_empty_objects_do_not_replace() {
        let manager = manager(Arc::new(ValueCache::default()));
        let target = Arc::new(SliceTarget::default());
        target.set_state_slice("session", Value::Null);
        manager.subscribe(ConnectOptions::managed("session", target.clone(), "session"));

        manager.key_changed("session", Some(&json!({})), true, false, true);

        assert_eq!(*target.replacements.lock(), 0);
    }

    #[test]
    fn test_managed_collection_overlays_member() {
        let manager = manager(Arc::new(ValueCache::default()));
        let target = Arc::new(SliceTarget::default());
        target.set_state_slice("reports", json!({"report_1": {"x": 1}}));
        manager.subscribe(
            ConnectOptions::managed("report_", target.clone(), "reports")
                .with_selector(|value, _| value.and_then(|v| v.get("x")).cloned()),
        );

        manager.key_changed("report_2", Some(&json!({"x": 2})), true, false, true);
        assert_eq!(target.state()["reports"], json!({"report_1": {"x": 1}, "report_2": 2}));

        // Selector output unchanged: no replacement.
        manager.key_changed("report_2", Some(&json!({"x": 2, "y": 0})), true, false, true);
        assert_eq!(*target.replacements.lock(), 1);
    }

    #[test]
    fn test_toggles_split_delivery_classes() {
        let manager = manager(Arc::new(ValueCache::default()));
        let (options, log) = recording("session");
        let target = Arc::new(SliceTarget::default());
        manager.subscribe(options);
        manager.subscribe(ConnectOptions::managed("session", target.clone(), "session"));

        manager.key_changed("session", Some(&json!(1)), true, false, true);
        assert!(log.lock().is_empty());
        assert_eq!(*target.replacements.lock(), 1);

        manager.key_changed("session", Some(&json!(2)), true, true, false);
        assert_eq!(log.lock().len(), 1);
        assert_eq!(*target.replacements.lock(), 1);
    }

    #[test]
    fn test_delivery_skips_disconnected_subscription() {
        let manager = manager(Arc::new(ValueCache::default()));
        let (options, log) = recording("session");
        let id = manager.subscribe(options);
        manager.unsubscribe(id);

        manager.send_to_subscriber(
            id,
            Notification::Key {
                key: "session".into(),
                value: Some(json!(1)),
            },
        );

        assert!(log.lock().is_empty());
    }
}
