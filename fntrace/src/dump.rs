//! The object dumper: turns an already-serialized `serde_json::Value` into
//! the opaque string stored alongside a trace, honoring the capture limits
//! in `Config` (max depth, max elements per container).
//!
//! Capturing happens in two steps on purpose. The caller does the typed ->
//! `Value` conversion (via `serde_json::to_value`, see `capture::plain` and
//! `capture::receiver`), because only the caller's code knows the concrete
//! type. `Dumper` then only ever deals with `Value`, which keeps it object
//! safe and lets a host application swap in its own redaction or formatting
//! policy by implementing the trait itself.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy)]
pub struct DumpOptions {
    pub max_depth: usize,
    pub max_elements_per_container: usize,
}

pub trait Dumper: Send + Sync {
    fn sdump(&self, value: &Value, opts: &DumpOptions) -> String;
}

/// Default dumper: truncates the value tree to `opts` and serializes the
/// result as compact JSON.
pub struct JsonDumper;

impl Dumper for JsonDumper {
    fn sdump(&self, value: &Value, opts: &DumpOptions) -> String {
        let truncated = truncate(value, opts, 0);
        serde_json::to_string(&truncated).unwrap_or_else(|_| "null".to_string())
    }
}

fn truncate(value: &Value, opts: &DumpOptions, depth: usize) -> Value {
    if depth >= opts.max_depth {
        return match value {
            Value::Object(_) | Value::Array(_) => Value::String("...".to_string()),
            other => other.clone(),
        };
    }
    match value {
        Value::Array(items) => {
            let capped: Vec<Value> = items
                .iter()
                .take(opts.max_elements_per_container)
                .map(|v| truncate(v, opts, depth + 1))
                .collect();
            Value::Array(capped)
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map.iter().take(opts.max_elements_per_container) {
                out.insert(k.clone(), truncate(v, opts, depth + 1));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shallow_values_pass_through_unchanged() {
        let opts = DumpOptions { max_depth: 3, max_elements_per_container: 20 };
        let dumper = JsonDumper;
        let v = json!({"a": 1, "b": [1, 2, 3]});
        let dumped = dumper.sdump(&v, &opts);
        let parsed: Value = serde_json::from_str(&dumped).unwrap();
        assert_eq!(parsed, v);
    }

    #[test]
    fn depth_beyond_limit_is_elided() {
        let opts = DumpOptions { max_depth: 1, max_elements_per_container: 20 };
        let v = json!({"a": {"b": {"c": 1}}});
        let truncated = truncate(&v, &opts, 0);
        assert_eq!(truncated, json!({"a": "..."}));
    }

    #[test]
    fn container_wider_than_limit_is_capped() {
        let opts = DumpOptions { max_depth: 5, max_elements_per_container: 2 };
        let v = json!([1, 2, 3, 4, 5]);
        let truncated = truncate(&v, &opts, 0);
        assert_eq!(truncated, json!([1, 2]));
    }
}
