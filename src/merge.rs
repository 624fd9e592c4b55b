//! Merge engine: reduce rules for queued partial updates and null-marker
//! handling.
//!
//! A JSON `null` is a deletion marker. At the top level it removes the whole
//! key; nested inside an object it removes that field when the merge strips
//! nulls. Absence (`None`) means "nothing to write".

use crate::error::Result;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// In-flight merge operation shared by every caller that queued a change.
pub type MergeOperation = Shared<BoxFuture<'static, Result<()>>>;

/// Deep-merge `source` into `target`.
///
/// Objects merge key by key, anything else in `source` (arrays, scalars,
/// `null`) replaces the target outright. With `strip_nulls` set, a `null`
/// on either side drops the field and nested objects come out null-free.
pub fn fast_merge(target: &Value, source: &Value, strip_nulls: bool) -> Value {
    let Value::Object(source_map) = source else {
        return source.clone();
    };

    let mut destination = Map::new();

    if let Value::Object(target_map) = target {
        for (key, target_value) in target_map {
            let source_is_null = matches!(source_map.get(key), Some(Value::Null));
            if strip_nulls && (target_value.is_null() || source_is_null) {
                continue;
            }
            destination.insert(key.clone(), target_value.clone());
        }
    }

    for (key, source_value) in source_map {
        if source_value.is_object() {
            let target_value = target.get(key).unwrap_or(&Value::Null);
            destination.insert(key.clone(), fast_merge(target_value, source_value, strip_nulls));
        } else if !(strip_nulls && source_value.is_null()) {
            destination.insert(key.clone(), source_value.clone());
        }
    }

    Value::Object(destination)
}

/// Drop every `null` field from nested objects. Arrays are left alone.
pub fn remove_nested_null_values(value: &Value) -> Value {
    if value.is_object() {
        fast_merge(value, value, true)
    } else {
        value.clone()
    }
}

/// Combine queued changes with the existing value.
///
/// - a trailing array replaces everything (no element-wise merge)
/// - if any change is an object, changes fold left over `existing` (or `{}`)
/// - otherwise the last change wins
pub fn apply_merge(existing: Option<&Value>, changes: &[Value], strip_nulls: bool) -> Option<Value> {
    let Some(last) = changes.last() else {
        return existing.cloned();
    };

    if last.is_array() {
        return Some(last.clone());
    }

    if changes.iter().any(Value::is_object) {
        let seed = match existing {
            Some(value) if !is_falsy(value) => value.clone(),
            _ => Value::Object(Map::new()),
        };
        let merged = changes
            .iter()
            .fold(seed, |acc, change| fast_merge(&acc, change, strip_nulls));
        return Some(merged);
    }

    Some(last.clone())
}

/// Outcome of [`remove_null_values`].
#[derive(Clone, Debug, PartialEq)]
pub struct NullRemoval {
    pub value: Option<Value>,
    /// The value was a top-level `null`: the whole key must be removed.
    pub was_removed: bool,
}

/// Classify a value about to be written.
pub fn remove_null_values(value: Option<Value>, strip_nested: bool) -> NullRemoval {
    match value {
        Some(Value::Null) => NullRemoval {
            value: Some(Value::Null),
            was_removed: true,
        },
        None => NullRemoval {
            value: None,
            was_removed: false,
        },
        Some(value) => NullRemoval {
            value: Some(if strip_nested {
                remove_nested_null_values(&value)
            } else {
                value
            }),
            was_removed: false,
        },
    }
}

/// A batch split into storable pairs and keys that must be removed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PreparedBatch {
    pub pairs: Vec<(String, Value)>,
    pub removed: Vec<String>,
}

/// Turn a key/value batch into pairs ready for a bulk storage write.
pub fn prepare_for_storage<I>(batch: I, strip_nested: bool) -> PreparedBatch
where
    I: IntoIterator<Item = (String, Option<Value>)>,
{
    let mut prepared = PreparedBatch::default();
    for (key, value) in batch {
        let outcome = remove_null_values(value, strip_nested);
        if outcome.was_removed {
            prepared.removed.push(key);
            continue;
        }
        if let Some(value) = outcome.value {
            prepared.pairs.push((key, value));
        }
    }
    prepared
}

/// Result of comparing a merge change with the stored value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    Incompatible {
        existing: &'static str,
        change: &'static str,
    },
}

/// Arrays can only be merged into arrays and objects into non-arrays.
pub fn check_compatibility(change: &Value, existing: Option<&Value>) -> Compatibility {
    let Some(existing) = existing else {
        return Compatibility::Compatible;
    };
    if is_falsy(change) || is_falsy(existing) {
        return Compatibility::Compatible;
    }

    let kind = |value: &Value| if value.is_array() { "array" } else { "non-array" };
    if kind(existing) != kind(change) {
        return Compatibility::Incompatible {
            existing: kind(existing),
            change: kind(change),
        };
    }
    Compatibility::Compatible
}

/// `null` or `{}`: values that render the same as having no data.
pub fn is_empty_object(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        _ => false,
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

struct QueueEntry {
    changes: Vec<Value>,
    operation: MergeOperation,
}

/// Pending merge changes per key plus the in-flight operation that will
/// apply them.
///
/// An entry exists exactly while its operation has not yet collected the
/// queued changes; both are removed together by [`MergeQueue::take`].
#[derive(Default)]
pub struct MergeQueue {
    entries: Mutex<HashMap<String, QueueEntry>>,
}

impl MergeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `change` for `key`.
    ///
    /// Joins the running operation if one exists, otherwise registers the
    /// operation built by `start`. The returned future resolves once the
    /// change has been applied.
    pub fn enqueue<F>(&self, key: &str, change: Value, start: F) -> MergeOperation
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>>,
    {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.changes.push(change);
            return entry.operation.clone();
        }

        let operation = futures::FutureExt::shared(start());
        entries.insert(
            key.to_string(),
            QueueEntry {
                changes: vec![change],
                operation: operation.clone(),
            },
        );
        operation
    }

    /// Retire the entry for `key`, returning its queued changes.
    pub fn take(&self, key: &str) -> Option<Vec<Value>> {
        self.entries.lock().remove(key).map(|entry| entry.changes)
    }

    /// Whether `key` has changes waiting to be applied.
    pub fn has_pending(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Drop every queued change. Running operations find nothing to apply.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
