//! TTL-indexed cache of the last known snapshot for each distinct pointer
//! receiver seen, keyed by a stable identity (type name + address).
//!
//! Backed by `DashMap` for lock-free concurrent access across threads
//! tracing calls on different receivers at once. Entries older than the
//! TTL are treated as stale on next lookup and replaced as if they had
//! never existed, which is what forces a fresh base snapshot (rather than
//! a patch against arbitrarily old state) after a long idle gap.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct Entry {
    snapshot: Value,
    /// Id of the `ParamRecord` holding the full base snapshot — what every
    /// later patch's own `base_id` must point at, not the `ParamCache`
    /// row's id.
    anchor_record_id: i64,
    last_access: Instant,
}

pub struct TtlCache {
    ttl: Duration,
    entries: DashMap<String, Entry>,
}

/// What the caller should do with a receiver snapshot it just captured.
pub enum Lookup {
    /// No live entry for this key: store `snapshot` as a fresh full-snapshot
    /// `ParamRecord` (base_id=0) and remember its id.
    Miss,
    /// A live entry exists; diff against it and persist a patch whose own
    /// `base_id` is `anchor_record_id`.
    Hit { anchor_record_id: i64, previous: Value },
}

impl TtlCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl, entries: DashMap::new() }
    }

    /// Looks up `key` without mutating the cache.
    pub fn lookup(&self, key: &str) -> Lookup {
        match self.entries.get(key) {
            Some(entry) if entry.last_access.elapsed() < self.ttl => {
                Lookup::Hit { anchor_record_id: entry.anchor_record_id, previous: entry.snapshot.clone() }
            }
            _ => Lookup::Miss,
        }
    }

    /// Records `snapshot` as the live state for `key`, anchored at the
    /// full-snapshot `ParamRecord` whose id is `anchor_record_id`. Either
    /// creates a new entry or replaces an existing one outright (only ever
    /// called on a cache miss; see [`TtlCache::touch`] for the hit path).
    pub fn store(&self, key: &str, anchor_record_id: i64, snapshot: Value) {
        self.entries.insert(
            key.to_string(),
            Entry { snapshot, anchor_record_id, last_access: Instant::now() },
        );
    }

    /// Refreshes `key`'s last-access time without touching its snapshot or
    /// `anchor_record_id`. A cache hit touches the TTL but must not move the
    /// patch anchor — every subsequent patch keeps diffing against the same
    /// base snapshot.
    pub fn touch(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.last_access = Instant::now();
        }
    }

    /// Drops entries untouched for longer than the TTL and returns the keys
    /// that were evicted, so the caller can also delete their `ParamCache`
    /// row in the backend.
    pub fn sweep(&self) -> Vec<String> {
        let mut expired = Vec::new();
        self.entries.retain(|key, entry| {
            let alive = entry.last_access.elapsed() < self.ttl;
            if !alive {
                expired.push(key.clone());
            }
            alive
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Every `check_interval`, evicts stale entries from `cache` and deletes
/// their `ParamCache` row from the backend. Exits as soon as `stop` fires.
pub async fn run_sweeper(
    cache: std::sync::Arc<TtlCache>,
    repos: std::sync::Arc<dyn fntrace_store::RepositoryFactory>,
    check_interval: Duration,
    stop: std::sync::Arc<tokio::sync::Notify>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(check_interval) => {}
            _ = stop.notified() => return,
        }
        for key in cache.sweep() {
            if let Err(err) = repos.param_repository().delete_param_cache_by_key(&key).await {
                tracing::warn!(?err, key, "failed to delete expired param cache row");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_lookup_is_a_miss() {
        let cache = TtlCache::new();
        assert!(matches!(cache.lookup("k"), Lookup::Miss));
    }

    #[test]
    fn stored_entry_is_a_hit_with_the_previous_snapshot() {
        let cache = TtlCache::new();
        cache.store("k", 7, json!({"x": 1}));
        match cache.lookup("k") {
            Lookup::Hit { anchor_record_id, previous } => {
                assert_eq!(anchor_record_id, 7);
                assert_eq!(previous, json!({"x": 1}));
            }
            Lookup::Miss => panic!("expected hit"),
        }
    }

    #[test]
    fn expired_entry_reads_back_as_a_miss() {
        let cache = TtlCache::with_ttl(Duration::from_millis(1));
        cache.store("k", 1, json!({}));
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(cache.lookup("k"), Lookup::Miss));
    }

    #[test]
    fn touch_refreshes_last_access_without_changing_the_snapshot() {
        let cache = TtlCache::with_ttl(Duration::from_millis(20));
        cache.store("k", 7, json!({"x": 1}));
        std::thread::sleep(Duration::from_millis(12));
        cache.touch("k");
        std::thread::sleep(Duration::from_millis(12));
        match cache.lookup("k") {
            Lookup::Hit { anchor_record_id, previous } => {
                assert_eq!(anchor_record_id, 7);
                assert_eq!(previous, json!({"x": 1}));
            }
            Lookup::Miss => panic!("touch should have kept the entry alive"),
        }
    }

    #[test]
    fn sweep_drops_only_stale_entries() {
        let cache = TtlCache::with_ttl(Duration::from_millis(5));
        cache.store("stale", 1, json!({}));
        std::thread::sleep(Duration::from_millis(10));
        cache.store("fresh", 2, json!({}));
        cache.sweep();
        assert_eq!(cache.len(), 1);
        assert!(matches!(cache.lookup("fresh"), Lookup::Hit { .. }));
    }
}
