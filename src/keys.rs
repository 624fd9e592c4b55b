//! Key addressing: standalone keys, collection keys and collection members.
//!
//! A collection key is a registered prefix such as `report_`. Any key that
//! starts with it and is strictly longer is a member of that collection.
//! Collection prefixes are assumed not to overlap.

use crate::error::{Result, StoreError};
use std::collections::HashSet;

/// Registered collection keys.
#[derive(Clone, Debug, Default)]
pub struct KeyRegistry {
    collection_keys: HashSet<String>,
}

impl KeyRegistry {
    /// Create a registry from the application's collection keys.
    pub fn new<I, S>(collection_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collection_keys: collection_keys.into_iter().map(Into::into).collect(),
        }
    }

    /// True iff `key` is exactly a registered collection key.
    pub fn is_collection_key(&self, key: &str) -> bool {
        self.collection_keys.contains(key)
    }

    /// The registered collection `key` is a member of, if any.
    pub fn collection_key_for(&self, key: &str) -> Option<&str> {
        self.collection_keys
            .iter()
            .find(|collection| is_collection_member_key(collection, key))
            .map(String::as_str)
    }

    /// Whether a subscription on `subscription_key` is interested in `key`.
    ///
    /// Collection subscriptions match every member by prefix, everything else
    /// matches by equality.
    pub fn is_key_match(&self, subscription_key: &str, key: &str) -> bool {
        if self.is_collection_key(subscription_key) {
            key.starts_with(subscription_key)
        } else {
            subscription_key == key
        }
    }
}

/// True iff `key` starts with `collection_key` and is strictly longer.
pub fn is_collection_member_key(collection_key: &str, key: &str) -> bool {
    key.len() > collection_key.len() && key.starts_with(collection_key)
}

/// Split `report_42` into `("report_", "42")`.
///
/// The split happens on the first `_`; keys without one are not collection
/// members.
pub fn split_collection_member_key(key: &str) -> Result<(&str, &str)> {
    match key.find('_') {
        Some(index) => Ok((&key[..=index], &key[index + 1..])),
        None => Err(StoreError::InvalidKeyFormat(format!(
            "{key} is not a collection member key"
        ))),
    }
}
