//! Subscription types.

use crate::types::{Key, StateMap};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Callback-mode delivery: `(value, matched_key)`.
///
/// Whole-collection deliveries pass an object of members and the collection
/// key. `None` means the key has no value.
pub type KeyCallback = Arc<dyn Fn(Option<&Value>, &str) + Send + Sync>;

/// Projects a raw value and the subscriber's current state into the value
/// the subscriber actually wants.
pub type Selector = Arc<dyn Fn(Option<&Value>, &StateMap) -> Option<Value> + Send + Sync>;

/// Computes a new slice value from the previous full state. `None` leaves
/// the state untouched.
pub type SliceUpdater = Box<dyn FnOnce(&StateMap) -> Option<Value> + Send>;

/// A stateful consumer whose named state slices are managed by the store.
pub trait StateTarget: Send + Sync {
    /// Snapshot of the current state, handed to selectors.
    fn state(&self) -> StateMap;

    /// Replace a slice through an updater that sees the previous state.
    fn replace_state_slice(&self, name: &str, updater: SliceUpdater);

    /// Overwrite a slice directly.
    fn set_state_slice(&self, name: &str, value: Value);
}

/// How a subscription receives values.
#[derive(Clone)]
pub enum Delivery {
    Callback(KeyCallback),
    Managed {
        target: Arc<dyn StateTarget>,
        state_name: String,
    },
}

impl Delivery {
    pub fn is_callback(&self) -> bool {
        matches!(self, Delivery::Callback(_))
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Callback(_) => f.write_str("Callback"),
            Delivery::Managed { state_name, .. } => {
                f.debug_struct("Managed").field("state_name", state_name).finish()
            }
        }
    }
}

/// Options for `Store::connect`.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Key or collection key to watch.
    pub key: Key,

    pub delivery: Delivery,

    pub selector: Option<Selector>,

    /// Collection callbacks receive the whole collection in one call
    /// instead of one call per member.
    pub wait_for_collection_callback: bool,

    /// Deliver stored values on connect. When false, nothing is delivered on
    /// connect but every later write is delivered, even unchanged ones.
    pub init_with_stored_values: bool,

    /// Whether the watched key may be evicted while connected. Required for
    /// managed subscribers of allow-listed keys.
    pub can_evict: Option<bool>,
}

impl ConnectOptions {
    /// Subscribe with a callback.
    pub fn callback<F>(key: impl Into<Key>, callback: F) -> Self
    where
        F: Fn(Option<&Value>, &str) + Send + Sync + 'static,
    {
        Self::new(key, Delivery::Callback(Arc::new(callback)))
    }

    /// Subscribe a managed-state target, writing into `state_name`.
    pub fn managed(
        key: impl Into<Key>,
        target: Arc<dyn StateTarget>,
        state_name: impl Into<String>,
    ) -> Self {
        Self::new(
            key,
            Delivery::Managed {
                target,
                state_name: state_name.into(),
            },
        )
    }

    fn new(key: impl Into<Key>, delivery: Delivery) -> Self {
        Self {
            key: key.into(),
            delivery,
            selector: None,
            wait_for_collection_callback: false,
            init_with_stored_values: true,
            can_evict: None,
        }
    }

    pub fn with_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(Option<&Value>, &StateMap) -> Option<Value> + Send + Sync + 'static,
    {
        self.selector = Some(Arc::new(selector));
        self
    }

    pub fn wait_for_collection(mut self) -> Self {
        self.wait_for_collection_callback = true;
        self
    }

    pub fn without_stored_values(mut self) -> Self {
        self.init_with_stored_values = false;
        self
    }

    pub fn can_evict(mut self, can_evict: bool) -> Self {
        self.can_evict = Some(can_evict);
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("key", &self.key)
            .field("delivery", &self.delivery)
            .field("has_selector", &self.selector.is_some())
            .field("wait_for_collection_callback", &self.wait_for_collection_callback)
            .field("init_with_stored_values", &self.init_with_stored_values)
            .field("can_evict", &self.can_evict)
            .finish()
    }
}

/// What the fan-out hands to the delivery choke point.
#[derive(Clone, Debug)]
pub(crate) enum Notification {
    /// One key changed.
    Key { key: Key, value: Option<Value> },

    /// The whole collection, for callbacks waiting on full collections.
    Collection { key: Key, members: Value },

    /// Members of a collection changed; `full` is the current collection.
    Members { changed: Vec<Key>, full: Value },

    /// First delivery after connecting.
    Initial {
        key: Key,
        value: Option<Value>,
        batched: bool,
    },
}
