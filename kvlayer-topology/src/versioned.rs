//! Per-process cache validated against a published version.
//!
//! Values are stored under a content-addressed slot `key:V_<version>` and the
//! current version is published under `key:VER2`. A read costs one small
//! round trip for the version marker; the value itself is only fetched when
//! the local copy's version differs from the published one.
//!
//! Writes put the value slot first and publish the version second, so a
//! reader never sees a version whose value is not yet stored.
//!
//! Local copies are bounded the same way as [`LocalCache`](crate::LocalCache):
//! the map is reset wholesale when a new key would exceed the bound.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use dashmap::DashMap;
use kvlayer_core::{version_key, versioned_value_key, CasToken, Expiry, KvStore, Value};
use tracing::{debug, warn};

use crate::local::DEFAULT_LOCAL_CACHE_SIZE;

/// Store wrapper keeping a local copy of each value tagged with its version.
#[derive(Debug)]
pub struct VersionedLocalCache<S> {
    inner: S,
    bound: usize,
    local: DashMap<String, (Value, String)>,
    /// Serializes inserts so the bound check and the insert are atomic.
    inserting: Mutex<()>,
}

impl<S: KvStore> VersionedLocalCache<S> {
    /// Wrap `inner` with the default bound.
    pub fn new(inner: S) -> Self {
        Self::with_bound(inner, DEFAULT_LOCAL_CACHE_SIZE)
    }

    /// Wrap `inner`, keeping at most `bound` local copies. A bound of zero
    /// disables local copies, so every read fetches the value slot.
    pub fn with_bound(inner: S, bound: usize) -> Self {
        Self {
            inner,
            bound,
            local: DashMap::new(),
            inserting: Mutex::new(()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Version of the local copy of `key`, if any.
    pub fn local_version(&self, key: &str) -> Option<String> {
        self.local.get(key).map(|entry| entry.1.clone())
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Version currently published for `key`.
    pub fn published_version(&self, key: &str) -> Option<String> {
        let marker = self.inner.get(&version_key(key))?;
        String::from_utf8(marker.into_bytes()).ok()
    }

    fn remember(&self, key: &str, value: &Value, version: String) {
        if self.bound == 0 {
            return;
        }
        let _guard = self.inserting.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.local.contains_key(key) && self.local.len() >= self.bound {
            debug!(bound = self.bound, "versioned local cache full, resetting");
            self.local.clear();
        }
        self.local.insert(key.to_string(), (value.clone(), version));
    }

    fn forget(&self, key: &str) {
        self.local.remove(key);
    }

    fn unsupported(&self, key: &str, op: &'static str) {
        self.forget(key);
        debug!(key = %key, op, "operation not supported on versioned keys");
    }
}

impl<S: KvStore> KvStore for VersionedLocalCache<S> {
    fn get(&self, key: &str) -> Option<Value> {
        let Some(version) = self.published_version(key) else {
            self.forget(key);
            return None;
        };
        if let Some(entry) = self.local.get(key) {
            if entry.1 == version {
                return Some(entry.0.clone());
            }
        }

        match self.inner.get(&versioned_value_key(key, &version)) {
            Some(value) => {
                self.remember(key, &value, version);
                Some(value)
            }
            None => {
                // Published version without its value slot: partially written.
                debug!(key = %key, version = %version, "versioned value slot missing");
                self.forget(key);
                None
            }
        }
    }

    fn gets(&self, key: &str) -> Option<(Value, CasToken)> {
        let (marker, token) = self.inner.gets(&version_key(key))?;
        let version = String::from_utf8(marker.into_bytes()).ok()?;
        let value = self.inner.get(&versioned_value_key(key, &version))?;
        Some((value, token))
    }

    fn get_multi(&self, keys: &[&str]) -> HashMap<String, Value> {
        keys.iter()
            .filter_map(|k| self.get(k).map(|v| (k.to_string(), v)))
            .collect()
    }

    fn get_list(&self, keys: &[&str]) -> Vec<Option<Value>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    fn set(&self, key: &str, value: &Value, ttl: Expiry, compress: bool) -> bool {
        let version = value.version();
        if !self
            .inner
            .set(&versioned_value_key(key, &version), value, ttl, compress)
        {
            self.forget(key);
            return false;
        }
        if self
            .inner
            .set(&version_key(key), &Value::raw(version.as_bytes()), ttl, compress)
        {
            self.remember(key, value, version);
            true
        } else {
            self.forget(key);
            false
        }
    }

    fn add(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.forget(key);
        let version = value.version();
        if !self
            .inner
            .add(&version_key(key), &Value::raw(version.as_bytes()), ttl)
        {
            return false;
        }
        let stored = self
            .inner
            .set(&versioned_value_key(key, &version), value, ttl, true);
        if stored {
            self.remember(key, value, version);
        } else {
            // Withdraw the claim so the key does not stay published without a
            // value, blocking later adds.
            warn!(key = %key, "versioned value slot write failed, withdrawing add");
            self.inner.delete(&version_key(key));
        }
        stored
    }

    fn replace(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.forget(key);
        if self.published_version(key).is_none() {
            return false;
        }
        let version = value.version();
        if !self
            .inner
            .set(&versioned_value_key(key, &version), value, ttl, true)
        {
            return false;
        }
        let replaced = self
            .inner
            .replace(&version_key(key), &Value::raw(version.as_bytes()), ttl);
        if replaced {
            self.remember(key, value, version);
        }
        replaced
    }

    // The token guards the version marker, so a concurrent writer that
    // published a different version makes this fail.
    fn cas(&self, key: &str, value: &Value, ttl: Expiry, token: CasToken) -> bool {
        self.forget(key);
        let version = value.version();
        if !self
            .inner
            .set(&versioned_value_key(key, &version), value, ttl, true)
        {
            return false;
        }
        let swapped = self.inner.cas(
            &version_key(key),
            &Value::raw(version.as_bytes()),
            ttl,
            token,
        );
        if swapped {
            self.remember(key, value, version);
        }
        swapped
    }

    fn delete(&self, key: &str) -> bool {
        self.forget(key);
        self.inner.delete(&version_key(key))
    }

    fn incr(&self, key: &str, _delta: u64) -> Option<u64> {
        self.unsupported(key, "incr");
        None
    }

    fn decr(&self, key: &str, _delta: u64) -> Option<u64> {
        self.unsupported(key, "decr");
        None
    }

    fn append(&self, key: &str, _data: &[u8]) -> bool {
        self.unsupported(key, "append");
        false
    }

    fn prepend(&self, key: &str, _data: &[u8]) -> bool {
        self.unsupported(key, "prepend");
        false
    }

    fn touch(&self, key: &str, ttl: Expiry) -> bool {
        let touched = self.inner.touch(&version_key(key), ttl);
        if let Some(version) = self.published_version(key) {
            self.inner.touch(&versioned_value_key(key, &version), ttl);
        }
        touched
    }

    fn expire(&self, key: &str) -> bool {
        self.forget(key);
        self.inner.expire(&version_key(key))
    }

    fn set_multi(&self, items: &HashMap<String, Value>, ttl: Expiry, compress: bool) -> bool {
        items
            .iter()
            .map(|(k, v)| self.set(k, v, ttl, compress))
            .fold(true, |all, ok| all && ok)
    }

    fn delete_multi(&self, keys: &[&str]) -> bool {
        for key in keys {
            self.forget(key);
        }
        let markers: Vec<String> = keys.iter().map(|k| version_key(k)).collect();
        let markers: Vec<&str> = markers.iter().map(String::as_str).collect();
        self.inner.delete_multi(&markers)
    }

    fn append_multi(&self, keys: &[&str], _data: &[u8]) -> bool {
        for key in keys {
            self.unsupported(key, "append_multi");
        }
        false
    }

    fn prepend_multi(&self, keys: &[&str], _data: &[u8]) -> bool {
        for key in keys {
            self.unsupported(key, "prepend_multi");
        }
        false
    }

    fn clear(&self) {
        self.local.clear();
        self.inner.clear();
    }

    fn get_host_by_key(&self, key: &str) -> Option<String> {
        self.inner.get_host_by_key(key)
    }

    fn close(&self) {
        self.inner.close();
    }

    fn reset(&self) {
        self.inner.reset();
        self.local.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlayer_core::MemoryStore;
    use kvlayer_test_utils::{FaultyStore, RecordingStore};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn shared() -> (Arc<MemoryStore>, VersionedLocalCache<Arc<MemoryStore>>) {
        let inner = Arc::new(MemoryStore::new());
        (Arc::clone(&inner), VersionedLocalCache::new(inner))
    }

    #[test]
    fn test_set_publishes_version_after_value() {
        let recording = Arc::new(RecordingStore::new(MemoryStore::new()));
        let cache = VersionedLocalCache::new(Arc::clone(&recording));
        let value = Value::raw("v");
        assert!(cache.set("k", &value, 0, true));

        let keys = recording.keys_for("set");
        assert_eq!(
            keys,
            vec![versioned_value_key("k", &value.version()), version_key("k")]
        );
        assert_eq!(cache.local_version("k"), Some(value.version()));
    }

    #[test]
    fn test_get_without_version_is_miss() {
        let (inner, cache) = shared();
        inner.set("k", &Value::raw("plain"), 0, true);
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_matching_version_served_locally() {
        let recording = Arc::new(RecordingStore::new(MemoryStore::new()));
        let cache = VersionedLocalCache::new(Arc::clone(&recording));
        cache.set("k", &Value::raw("v"), 0, true);
        recording.reset_calls();

        assert_eq!(cache.get("k"), Some(Value::raw("v")));
        // Only the version marker was read.
        assert_eq!(recording.keys_for("get"), vec![version_key("k")]);
    }

    #[test]
    fn test_stale_local_copy_is_refreshed() {
        let (inner, a) = shared();
        let b = VersionedLocalCache::new(Arc::clone(&inner));

        a.set("k", &Value::raw("one"), 0, true);
        assert_eq!(b.get("k"), Some(Value::raw("one")));

        a.set("k", &Value::raw("two"), 0, true);
        assert_eq!(b.get("k"), Some(Value::raw("two")));
        assert_eq!(b.local_version("k"), Some(Value::raw("two").version()));
    }

    #[test]
    fn test_missing_value_slot_reads_as_miss() {
        let (inner, cache) = shared();
        inner.set(&version_key("k"), &Value::raw("deadbeef"), 0, true);
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.local_len(), 0);
    }

    #[test]
    fn test_add_only_when_unpublished() {
        let (_, cache) = shared();
        assert!(cache.add("k", &Value::raw("a"), 0));
        assert!(!cache.add("k", &Value::raw("b"), 0));
        assert_eq!(cache.get("k"), Some(Value::raw("a")));
    }

    #[test]
    fn test_delete_drops_marker_and_leaves_slot() {
        let (inner, cache) = shared();
        let value = Value::raw("v");
        cache.set("k", &value, 0, true);

        assert!(cache.delete("k"));
        assert_eq!(cache.get("k"), None);
        assert!(inner.contains(&versioned_value_key("k", &value.version())));
        assert!(!inner.contains(&version_key("k")));
    }

    #[test]
    fn test_cas_against_version_marker() {
        let (_, cache) = shared();
        cache.set("k", &Value::raw("a"), 0, true);
        let (value, token) = cache.gets("k").unwrap();
        assert_eq!(value, Value::raw("a"));

        assert!(cache.cas("k", &Value::raw("b"), 0, token));
        assert!(!cache.cas("k", &Value::raw("c"), 0, token));
        assert_eq!(cache.get("k"), Some(Value::raw("b")));
    }

    #[test]
    fn test_replace_requires_published_version() {
        let (_, cache) = shared();
        assert!(!cache.replace("k", &Value::raw("a"), 0));
        cache.set("k", &Value::raw("a"), 0, true);
        assert!(cache.replace("k", &Value::raw("b"), 0));
        assert_eq!(cache.get("k"), Some(Value::raw("b")));
    }

    #[test]
    fn test_counters_are_unsupported() {
        let (_, cache) = shared();
        cache.set("n", &Value::int(1), 0, true);
        assert_eq!(cache.incr("n", 1), None);
        assert!(!cache.append("n", b"x"));
        assert_eq!(cache.local_version("n"), None);
        assert_eq!(cache.get("n").and_then(|v| v.as_int()), Some(1));
    }

    #[test]
    fn test_failed_value_write_publishes_nothing() {
        let cache = VersionedLocalCache::new(kvlayer_test_utils::FailingStore::new());
        assert!(!cache.set("k", &Value::raw("v"), 0, true));
        assert_eq!(cache.local_len(), 0);
    }

    #[test]
    fn test_failed_add_withdraws_version_marker() {
        let inner = Arc::new(MemoryStore::new());
        let cache = VersionedLocalCache::new(FaultyStore::new(Arc::clone(&inner)).failing(&["set"]));
        assert!(!cache.add("k", &Value::raw("v"), 0));
        assert!(!inner.contains(&version_key("k")));
        assert_eq!(cache.get("k"), None);

        // Once the slot can be written the key is still free to add.
        let healthy = VersionedLocalCache::new(Arc::clone(&inner));
        assert!(healthy.add("k", &Value::raw("v"), 0));
        assert_eq!(healthy.get("k"), Some(Value::raw("v")));
    }

    #[test]
    fn test_bound_resets_local_copies() {
        let cache = VersionedLocalCache::with_bound(Arc::new(MemoryStore::new()), 2);
        cache.set("a", &Value::raw("1"), 0, true);
        cache.set("b", &Value::raw("2"), 0, true);
        cache.set("a", &Value::raw("3"), 0, true);
        assert_eq!(cache.local_len(), 2);

        cache.set("c", &Value::raw("4"), 0, true);
        assert_eq!(cache.local_len(), 1);
        assert!(cache.local_version("c").is_some());
        // Dropped copies are refetched from the store.
        assert_eq!(cache.get("a"), Some(Value::raw("3")));
    }

    #[test]
    fn test_zero_bound_keeps_no_copies() {
        let cache = VersionedLocalCache::with_bound(Arc::new(MemoryStore::new()), 0);
        cache.set("k", &Value::raw("v"), 0, true);
        assert_eq!(cache.local_len(), 0);
        assert_eq!(cache.get("k"), Some(Value::raw("v")));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// Reads of many distinct keys never grow the local map past its bound.
        #[test]
        fn prop_local_len_never_exceeds_bound(
            bound in 1usize..16,
            keys in proptest::collection::vec("[a-z]{1,3}", 0..64),
        ) {
            let inner = Arc::new(MemoryStore::new());
            let writer = VersionedLocalCache::new(Arc::clone(&inner));
            let reader = VersionedLocalCache::with_bound(inner, bound);
            for key in &keys {
                writer.set(key, &Value::raw(key.as_bytes()), 0, true);
                prop_assert!(reader.get(key).is_some());
                prop_assert!(reader.local_len() <= bound);
            }
        }
    }
}
