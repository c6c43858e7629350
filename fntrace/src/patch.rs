//! JSON merge patch (RFC 7396): diff two documents, and apply a patch
//! produced that way back onto a base document.
//!
//! `apply` is exactly RFC 7396 §2. `diff` is its usual inverse, not itself
//! part of the RFC: it walks two object trees and emits the minimal patch
//! that turns `base` into `target`, recursing into nested objects shared by
//! both sides and using `null` to mark keys that disappeared.

use serde_json::{Map, Value};

/// Produces the merge patch that, applied to `base`, yields `target`.
pub fn diff(base: &Value, target: &Value) -> Value {
    match (base, target) {
        (Value::Object(base_map), Value::Object(target_map)) => {
            let mut patch = Map::new();
            for (key, target_val) in target_map {
                match base_map.get(key) {
                    Some(base_val) if base_val == target_val => {}
                    Some(base_val) => {
                        let sub = diff(base_val, target_val);
                        patch.insert(key.clone(), sub);
                    }
                    None => {
                        patch.insert(key.clone(), target_val.clone());
                    }
                }
            }
            for key in base_map.keys() {
                if !target_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ if base == target => Value::Object(Map::new()),
        _ => target.clone(),
    }
}

/// Applies `patch` to `base` per RFC 7396 §2.
pub fn apply(base: &Value, patch: &Value) -> Value {
    let Value::Object(patch_map) = patch else {
        return patch.clone();
    };
    let mut result = match base {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };
    for (key, patch_val) in patch_map {
        if patch_val.is_null() {
            result.remove(key);
            continue;
        }
        let merged = match result.get(key) {
            Some(existing) => apply(existing, patch_val),
            None => apply(&Value::Null, patch_val),
        };
        result.insert(key.clone(), merged);
    }
    Value::Object(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_then_apply_round_trips() {
        let base = json!({"a": 1, "b": {"x": 1, "y": 2}, "c": "keep"});
        let target = json!({"a": 2, "b": {"x": 1, "z": 3}, "d": "new"});
        let patch = diff(&base, &target);
        let rebuilt = apply(&base, &patch);
        assert_eq!(rebuilt, target);
    }

    #[test]
    fn diff_omits_unchanged_keys() {
        let base = json!({"a": 1, "b": 2});
        let target = json!({"a": 1, "b": 3});
        let patch = diff(&base, &target);
        assert_eq!(patch, json!({"b": 3}));
    }

    #[test]
    fn removed_key_becomes_null_in_patch() {
        let base = json!({"a": 1, "b": 2});
        let target = json!({"a": 1});
        let patch = diff(&base, &target);
        assert_eq!(patch, json!({"b": null}));
        assert_eq!(apply(&base, &patch), target);
    }

    #[test]
    fn apply_non_object_patch_replaces_wholesale() {
        assert_eq!(apply(&json!({"a": 1}), &json!("scalar")), json!("scalar"));
    }

    #[test]
    fn chained_patches_reconstruct_every_intermediate_snapshot() {
        let snapshots = vec![
            json!({"count": 0}),
            json!({"count": 1}),
            json!({"count": 1, "tag": "x"}),
            json!({"count": 2, "tag": "x"}),
        ];
        let mut doc = snapshots[0].clone();
        for window in snapshots.windows(2) {
            let patch = diff(&window[0], &window[1]);
            doc = apply(&doc, &patch);
            assert_eq!(doc, window[1]);
        }
    }
}
