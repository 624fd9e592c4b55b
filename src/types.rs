//! Core types for the reactive store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A store key. Collection members are `collection_key + member_id`.
pub type Key = String;

/// Named state slices held by a managed-state subscriber.
pub type StateMap = Map<String, Value>;

/// Members of a collection keyed by their full member key.
pub type Collection = Map<String, Value>;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Space accounting reported by a storage backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSize {
    pub bytes_used: u64,
    pub bytes_remaining: u64,
}

/// A single operation in a batched `Store::update` call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Update {
    /// Replace the value of a key.
    Set { key: Key, value: Value },

    /// Deep-merge a change into a key.
    Merge { key: Key, value: Value },

    /// Merge several members of one collection.
    MergeCollection { key: Key, value: Collection },

    /// Replace several keys at once.
    MultiSet { value: Map<String, Value> },

    /// Reset everything to default key states.
    Clear {
        #[serde(default)]
        keys_to_preserve: Vec<Key>,
    },
}

impl Update {
    /// Name used when reporting the operation.
    pub fn method_name(&self) -> &'static str {
        match self {
            Update::Set { .. } => "set",
            Update::Merge { .. } => "merge",
            Update::MergeCollection { .. } => "merge_collection",
            Update::MultiSet { .. } => "multi_set",
            Update::Clear { .. } => "clear",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_wire_shape() {
        let update: Update = serde_json::from_value(json!({
            "method": "merge",
            "key": "session",
            "value": {"token": "abc"}
        }))
        .unwrap();

        assert_eq!(
            update,
            Update::Merge {
                key: "session".to_string(),
                value: json!({"token": "abc"}),
            }
        );
        assert_eq!(update.method_name(), "merge");
    }

    #[test]
    fn test_clear_defaults_preserve_list() {
        let update: Update = serde_json::from_value(json!({"method": "clear"})).unwrap();
        assert_eq!(update, Update::Clear { keys_to_preserve: vec![] });
    }
}
