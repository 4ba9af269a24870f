//! Live shard migration between two node sets.
//!
//! During a migration keys hash to different nodes in the old and new
//! node sets. [`MigratingStore`] serves from the new set and pulls a key
//! forward from the old set the first time it is read there, so traffic
//! converges on the new set without a cold start.

use std::collections::HashMap;

use kvlayer_core::{CasToken, Expiry, KvStore, Value};
use rand::Rng;
use tracing::debug;

/// Base TTL for keys copied forward; a uniform jitter of up to the same
/// amount is added so migrated keys do not expire together.
pub const MIGRATION_TTL: Expiry = 3600;

/// Store wrapper that migrates keys from `old` to `new` on access.
#[derive(Debug)]
pub struct MigratingStore<O, N> {
    old: O,
    new: N,
}

impl<O: KvStore, N: KvStore> MigratingStore<O, N> {
    pub fn new(old: O, new: N) -> Self {
        Self { old, new }
    }

    pub fn old(&self) -> &O {
        &self.old
    }

    pub fn new_store(&self) -> &N {
        &self.new
    }

    /// Whether the key routes to a different node in the new set.
    pub fn moved(&self, key: &str) -> bool {
        self.old.get_host_by_key(key) != self.new.get_host_by_key(key)
    }

    fn forward_ttl() -> Expiry {
        MIGRATION_TTL + rand::rng().random_range(0..=MIGRATION_TTL)
    }

    fn copy_forward(&self, key: &str, value: &Value) {
        debug!(key = %key, "copying migrated key to new shard");
        self.new.set(key, value, Self::forward_ttl(), true);
        self.old.delete(key);
    }

    fn invalidate_old(&self, key: &str) {
        if self.moved(key) {
            self.old.delete(key);
        }
    }

    fn invalidate_old_batch(&self, keys: &[&str]) {
        let moved: Vec<&str> = keys.iter().copied().filter(|k| self.moved(k)).collect();
        if !moved.is_empty() {
            self.old.delete_multi(&moved);
        }
    }
}

impl<O: KvStore, N: KvStore> KvStore for MigratingStore<O, N> {
    fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.new.get(key) {
            return Some(value);
        }
        if !self.moved(key) {
            return None;
        }
        let value = self.old.get(key)?;
        self.copy_forward(key, &value);
        Some(value)
    }

    fn gets(&self, key: &str) -> Option<(Value, CasToken)> {
        self.new.gets(key)
    }

    fn get_multi(&self, keys: &[&str]) -> HashMap<String, Value> {
        let mut found = self.new.get_multi(keys);
        let fallback: Vec<&str> = keys
            .iter()
            .copied()
            .filter(|k| !found.contains_key(*k) && self.moved(k))
            .collect();
        if fallback.is_empty() {
            return found;
        }
        let migrated = self.old.get_multi(&fallback);
        for (key, value) in &migrated {
            self.copy_forward(key, value);
        }
        found.extend(migrated);
        found
    }

    fn set(&self, key: &str, value: &Value, ttl: Expiry, compress: bool) -> bool {
        self.invalidate_old(key);
        self.new.set(key, value, ttl, compress)
    }

    fn add(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.invalidate_old(key);
        self.new.add(key, value, ttl)
    }

    fn replace(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.invalidate_old(key);
        self.new.replace(key, value, ttl)
    }

    fn cas(&self, key: &str, value: &Value, ttl: Expiry, token: CasToken) -> bool {
        self.invalidate_old(key);
        self.new.cas(key, value, ttl, token)
    }

    fn delete(&self, key: &str) -> bool {
        self.invalidate_old(key);
        self.new.delete(key)
    }

    fn incr(&self, key: &str, delta: u64) -> Option<u64> {
        self.invalidate_old(key);
        self.new.incr(key, delta)
    }

    fn decr(&self, key: &str, delta: u64) -> Option<u64> {
        self.invalidate_old(key);
        self.new.decr(key, delta)
    }

    fn append(&self, key: &str, data: &[u8]) -> bool {
        self.invalidate_old(key);
        self.new.append(key, data)
    }

    fn prepend(&self, key: &str, data: &[u8]) -> bool {
        self.invalidate_old(key);
        self.new.prepend(key, data)
    }

    fn touch(&self, key: &str, ttl: Expiry) -> bool {
        self.invalidate_old(key);
        self.new.touch(key, ttl)
    }

    fn expire(&self, key: &str) -> bool {
        self.invalidate_old(key);
        self.new.expire(key)
    }

    fn set_multi(&self, items: &HashMap<String, Value>, ttl: Expiry, compress: bool) -> bool {
        self.invalidate_old_batch(&kvlayer_core::item_keys(items));
        self.new.set_multi(items, ttl, compress)
    }

    fn delete_multi(&self, keys: &[&str]) -> bool {
        self.invalidate_old_batch(keys);
        self.new.delete_multi(keys)
    }

    fn append_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.invalidate_old_batch(keys);
        self.new.append_multi(keys, data)
    }

    fn prepend_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.invalidate_old_batch(keys);
        self.new.prepend_multi(keys, data)
    }

    // Flushing during a migration would only push load onto the old set.
    fn clear(&self) {}

    fn get_host_by_key(&self, key: &str) -> Option<String> {
        self.new.get_host_by_key(key)
    }

    fn close(&self) {
        self.old.close();
        self.new.close();
    }

    fn reset(&self) {
        self.old.reset();
        self.new.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlayer_core::MemoryStore;
    use std::sync::Arc;

    fn migrating() -> (
        Arc<MemoryStore>,
        Arc<MemoryStore>,
        MigratingStore<Arc<MemoryStore>, Arc<MemoryStore>>,
    ) {
        let old = Arc::new(MemoryStore::with_servers(["old:11211"]));
        let new = Arc::new(MemoryStore::with_servers(["new:11211"]));
        let store = MigratingStore::new(Arc::clone(&old), Arc::clone(&new));
        (old, new, store)
    }

    #[test]
    fn test_moved_compares_routing() {
        let (_, _, store) = migrating();
        assert!(store.moved("k"));

        let same = MigratingStore::new(
            MemoryStore::with_servers(["a:11211"]),
            MemoryStore::with_servers(["a:11211"]),
        );
        assert!(!same.moved("k"));
    }

    #[test]
    fn test_get_copies_forward_with_jittered_ttl() {
        let (old, new, store) = migrating();
        old.set("k", &Value::raw("v"), 0, true);

        assert_eq!(store.get("k"), Some(Value::raw("v")));
        assert!(!old.contains("k"));
        let ttl = new.ttl_of("k").flatten().unwrap();
        assert!(ttl.as_secs() <= u64::from(MIGRATION_TTL * 2));
        assert!(ttl.as_secs() >= u64::from(MIGRATION_TTL) - 1);
    }

    #[test]
    fn test_unmoved_key_never_consults_old() {
        let old = Arc::new(MemoryStore::with_servers(["a:11211"]));
        let new = Arc::new(MemoryStore::with_servers(["a:11211"]));
        old.set("k", &Value::raw("v"), 0, true);
        let store = MigratingStore::new(Arc::clone(&old), Arc::clone(&new));

        assert_eq!(store.get("k"), None);
        assert!(old.contains("k"));
    }

    #[test]
    fn test_get_multi_only_falls_back_for_misses() {
        let (old, new, store) = migrating();
        new.set("a", &Value::raw("new-a"), 0, true);
        old.set("a", &Value::raw("old-a"), 0, true);
        old.set("b", &Value::raw("old-b"), 0, true);

        let found = store.get_multi(&["a", "b", "c"]);
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], Value::raw("new-a"));
        assert_eq!(found["b"], Value::raw("old-b"));
        // "a" was served from new, so its old copy is left alone.
        assert!(old.contains("a"));
        assert!(!old.contains("b"));
        assert!(new.contains("b"));
    }

    #[test]
    fn test_writes_go_to_new_and_invalidate_old() {
        let (old, new, store) = migrating();
        old.set("k", &Value::raw("stale"), 0, true);

        assert!(store.set("k", &Value::raw("fresh"), 0, true));
        assert!(!old.contains("k"));
        assert_eq!(new.get("k"), Some(Value::raw("fresh")));

        old.set("n", &Value::int(1), 0, true);
        new.set("n", &Value::int(5), 0, true);
        assert_eq!(store.incr("n", 1), Some(6));
        assert!(!old.contains("n"));
    }

    #[test]
    fn test_batch_writes_invalidate_moved_subset() {
        let (old, new, store) = migrating();
        old.set("a", &Value::raw("1"), 0, true);
        old.set("b", &Value::raw("2"), 0, true);

        let mut items = HashMap::new();
        items.insert("a".to_string(), Value::raw("x"));
        items.insert("b".to_string(), Value::raw("y"));
        assert!(store.set_multi(&items, 0, true));

        assert!(old.is_empty());
        assert_eq!(new.len(), 2);
    }
}
