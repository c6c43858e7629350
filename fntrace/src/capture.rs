//! Function classification and parameter capture.
//!
//! `classify` turns the dotted name a caller hands to `Enter` into a
//! `MethodKind`, applying the same patterns a Go call-site name would
//! match: a pointer-receiver method (`pkg.(*Type).Method`), a
//! value-receiver method in either parenthesized or bare dotted form
//! (`pkg.(Type).Method`, `pkg.Type.Method`), or a plain function
//! (`pkg.Func`). `prepare` then decides, given that classification and the
//! configured `ParamStoreMode`, which parameters actually get persisted and
//! how.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::ParamStoreMode;
use crate::dump::{DumpOptions, Dumper};
use crate::patch;
use crate::ttl::{Lookup, TtlCache};
use fntrace_store::MethodKind;

/// One argument as handed to `Enter`. Built with [`plain`] for ordinary
/// values, or [`receiver`] for the receiver of a method that might be a
/// pointer receiver (only relevant when the call is in fact a
/// pointer-receiver method; see [`classify`]).
pub enum Param {
    Plain(Value),
    Receiver { type_key: String, address: usize, value: Value },
}

pub fn plain<T: Serialize>(v: &T) -> Param {
    Param::Plain(serde_json::to_value(v).unwrap_or(Value::Null))
}

/// Captures a receiver argument along with a stable identity derived from
/// its type and address, used to find its previous snapshot in the TTL
/// cache.
pub fn receiver<T: Serialize>(v: &T) -> Param {
    let address = v as *const T as usize;
    let type_key = std::any::type_name::<T>().replace("::", ".");
    let value = serde_json::to_value(v).unwrap_or(Value::Null);
    Param::Receiver { type_key, address, value }
}

pub fn stable_key(type_key: &str, address: usize) -> String {
    format!("{type_key}@{address:#x}")
}

/// Classifies a dotted call name, applied in order: pointer-receiver method,
/// parenthesized value-receiver method, bare dotted value-receiver method,
/// plain function, else unknown.
pub fn classify(name: &str) -> MethodKind {
    if name.contains(".(*") && name.contains(").") {
        return MethodKind::PointerReceiver;
    }
    if name.contains(".(") && name.contains(").") {
        return MethodKind::ValueReceiver;
    }
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() >= 3 {
        let type_part = parts[parts.len() - 2];
        if type_part.chars().next().is_some_and(|c| c.is_uppercase()) {
            return MethodKind::ValueReceiver;
        }
    }
    if parts.len() >= 2 {
        return MethodKind::Plain;
    }
    MethodKind::Unknown
}

/// A parameter ready to persist: its position, the is-receiver flag, and
/// the (already compressed) payload bytes.
///
/// For a delta-captured receiver, exactly one of `base_id` /
/// `new_cache_snapshot` is set:
/// - cache hit: `base_id` already holds the anchor `ParamRecord`'s id (spec
///   §4.4: "ParamRecord #2 and #3 have base-id=id(#1)") — the caller can
///   insert this `ParamRecord` as-is.
/// - cache miss: `new_cache_snapshot` carries the stable key and full
///   snapshot; the caller must insert this `ParamRecord` first (with
///   `base_id=0`, since it *is* the anchor), then write a `ParamCache` row
///   pointing `base_id` at the id just assigned, then remember
///   `(key, anchor_id, snapshot)` in the `TtlCache`.
pub struct PreparedParam {
    pub position: usize,
    pub is_receiver: bool,
    pub data: Vec<u8>,
    pub base_id: Option<i64>,
    pub new_cache_snapshot: Option<(String, Value)>,
}

#[allow(clippy::too_many_arguments)]
pub fn prepare(
    method_kind: MethodKind,
    mode: ParamStoreMode,
    params: &[Param],
    dumper: &Arc<dyn Dumper>,
    opts: &DumpOptions,
    ttl: &TtlCache,
) -> Vec<PreparedParam> {
    if matches!(mode, ParamStoreMode::None) {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(params.len());
    for (position, param) in params.iter().enumerate() {
        let is_receiver_slot = position == 0 && matches!(method_kind, MethodKind::PointerReceiver);

        if is_receiver_slot {
            if !matches!(mode, ParamStoreMode::All) {
                // Normal mode never captures a pointer receiver.
                continue;
            }
            let Param::Receiver { type_key, address, value } = param else {
                // Caller passed a plain value where a receiver was expected;
                // fall back to treating it like any other parameter.
                if let Param::Plain(v) = param {
                    out.push(plain_prepared(position, false, v, dumper, opts));
                }
                continue;
            };
            let key = stable_key(type_key, *address);
            match ttl.lookup(&key) {
                Lookup::Miss => {
                    let bytes = dumper.sdump(value, opts).into_bytes();
                    out.push(PreparedParam {
                        position,
                        is_receiver: true,
                        data: crate::compress::compress(&bytes),
                        base_id: None,
                        new_cache_snapshot: Some((key, value.clone())),
                    });
                }
                Lookup::Hit { anchor_record_id, previous } => {
                    let delta = patch::diff(&previous, value);
                    let bytes = dumper.sdump(&delta, opts).into_bytes();
                    ttl.touch(&key);
                    out.push(PreparedParam {
                        position,
                        is_receiver: true,
                        data: crate::compress::compress(&bytes),
                        base_id: Some(anchor_record_id),
                        new_cache_snapshot: None,
                    });
                }
            }
            continue;
        }

        let value = match param {
            Param::Plain(v) => v,
            Param::Receiver { value, .. } => value,
        };
        out.push(plain_prepared(position, false, value, dumper, opts));
    }
    out
}

fn plain_prepared(
    position: usize,
    is_receiver: bool,
    value: &Value,
    dumper: &Arc<dyn Dumper>,
    opts: &DumpOptions,
) -> PreparedParam {
    let bytes = dumper.sdump(value, opts).into_bytes();
    PreparedParam {
        position,
        is_receiver,
        data: crate::compress::compress(&bytes),
        base_id: None,
        new_cache_snapshot: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::JsonDumper;
    use serde_json::json;

    #[test]
    fn classify_pointer_receiver_method() {
        assert_eq!(classify("widgets.(*Counter).Inc"), MethodKind::PointerReceiver);
    }

    #[test]
    fn classify_parenthesized_value_receiver_method() {
        assert_eq!(classify("widgets.(Counter).Snapshot"), MethodKind::ValueReceiver);
    }

    #[test]
    fn classify_bare_dotted_value_receiver_method() {
        assert_eq!(classify("widgets.Counter.Snapshot"), MethodKind::ValueReceiver);
    }

    #[test]
    fn classify_plain_function() {
        assert_eq!(classify("widgets.Compute"), MethodKind::Plain);
    }

    #[test]
    fn classify_unqualified_name_is_unknown() {
        assert_eq!(classify("Compute"), MethodKind::Unknown);
    }

    #[test]
    fn none_mode_captures_nothing() {
        let dumper: Arc<dyn Dumper> = Arc::new(JsonDumper);
        let opts = DumpOptions { max_depth: 3, max_elements_per_container: 20 };
        let ttl = TtlCache::new();
        let params = vec![plain(&42)];
        let prepared = prepare(MethodKind::Plain, ParamStoreMode::None, &params, &dumper, &opts, &ttl);
        assert!(prepared.is_empty());
    }

    #[test]
    fn normal_mode_skips_pointer_receiver_but_keeps_rest() {
        let dumper: Arc<dyn Dumper> = Arc::new(JsonDumper);
        let opts = DumpOptions { max_depth: 3, max_elements_per_container: 20 };
        let ttl = TtlCache::new();
        let params = vec![receiver(&json!({"n": 1})), plain(&"x")];
        let prepared = prepare(
            MethodKind::PointerReceiver,
            ParamStoreMode::Normal,
            &params,
            &dumper,
            &opts,
            &ttl,
        );
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].position, 1);
    }

    #[test]
    fn all_mode_first_call_is_a_cache_miss() {
        let dumper: Arc<dyn Dumper> = Arc::new(JsonDumper);
        let opts = DumpOptions { max_depth: 3, max_elements_per_container: 20 };
        let ttl = TtlCache::new();
        let obj = json!({"n": 1});
        let params = vec![receiver(&obj)];
        let prepared =
            prepare(MethodKind::PointerReceiver, ParamStoreMode::All, &params, &dumper, &opts, &ttl);
        assert_eq!(prepared.len(), 1);
        assert!(prepared[0].is_receiver);
        assert!(prepared[0].base_id.is_none());
        assert!(prepared[0].new_cache_snapshot.is_some());
    }

    #[test]
    fn all_mode_second_call_on_same_identity_is_a_patch() {
        let dumper: Arc<dyn Dumper> = Arc::new(JsonDumper);
        let opts = DumpOptions { max_depth: 3, max_elements_per_container: 20 };
        let ttl = TtlCache::new();
        let obj = json!({"n": 1});
        let probe = receiver(&obj);
        let Param::Receiver { type_key, address, .. } = &probe else {
            unreachable!("receiver() always returns Param::Receiver")
        };
        let key = stable_key(type_key, *address);
        ttl.store(&key, 99, json!({"n": 1}));

        let params = vec![receiver(&obj)];
        let prepared =
            prepare(MethodKind::PointerReceiver, ParamStoreMode::All, &params, &dumper, &opts, &ttl);
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].base_id, Some(99));
        assert!(prepared[0].new_cache_snapshot.is_none());
    }
}
