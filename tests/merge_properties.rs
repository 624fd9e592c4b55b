//! Property tests for the merge engine.

use proptest::prelude::*;
use reactive_store::merge::{apply_merge, fast_merge, remove_nested_null_values};
use serde_json::{Map, Value};

/// Flat objects whose fields are small integers or `null`.
fn flat_object() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-f]", prop::option::of(0i64..10), 0..6).prop_map(|fields| {
        Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key, value.map(Value::from).unwrap_or(Value::Null)))
                .collect::<Map<String, Value>>(),
        )
    })
}

fn nested_object() -> impl Strategy<Value = Value> {
    (flat_object(), flat_object()).prop_map(|(mut outer, inner)| {
        if let Value::Object(map) = &mut outer {
            map.insert("nested".to_string(), inner);
        }
        outer
    })
}

fn contains_null_field(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.values().any(|v| v.is_null() || contains_null_field(v)),
        _ => false,
    }
}

proptest! {
    #[test]
    fn prop_merge_applies_every_change(existing in flat_object(), change in flat_object()) {
        let merged = apply_merge(Some(&existing), std::slice::from_ref(&change), true).unwrap();
        let merged = merged.as_object().unwrap();
        let change = change.as_object().unwrap();

        for (key, value) in change {
            if value.is_null() {
                prop_assert!(!merged.contains_key(key));
            } else {
                prop_assert_eq!(merged.get(key), Some(value));
            }
        }
        for (key, value) in existing.as_object().unwrap() {
            if !change.contains_key(key) && !value.is_null() {
                prop_assert_eq!(merged.get(key), Some(value));
            }
        }
    }

    #[test]
    fn prop_stripped_merge_has_no_null_fields(existing in nested_object(), change in nested_object()) {
        let existing = remove_nested_null_values(&existing);
        let merged = apply_merge(Some(&existing), &[change], true).unwrap();
        prop_assert!(!contains_null_field(&merged));
    }

    #[test]
    fn prop_trailing_sequence_wins(
        changes in prop::collection::vec(flat_object(), 0..4),
        last in prop::collection::vec(0i64..10, 0..5),
    ) {
        let last = Value::from(last);
        let mut all = changes;
        all.push(last.clone());

        let merged = apply_merge(Some(&Value::from(vec![1, 2, 3])), &all, true);
        prop_assert_eq!(merged, Some(last));
    }

    #[test]
    fn prop_sequential_merges_equal_batched(a in flat_object(), b in flat_object(), base in flat_object()) {
        let base = remove_nested_null_values(&base);
        let one_by_one = fast_merge(&fast_merge(&base, &a, true), &b, true);
        let batched = apply_merge(Some(&base), &[a, b], true).unwrap();
        prop_assert_eq!(one_by_one, batched);
    }

    #[test]
    fn prop_null_removal_is_idempotent(value in nested_object()) {
        let once = remove_nested_null_values(&value);
        prop_assert_eq!(remove_nested_null_values(&once), once.clone());
        prop_assert!(!contains_null_field(&once));
    }
}
