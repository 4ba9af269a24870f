//! kvlayer Test Utilities
//!
//! Centralized test infrastructure for the kvlayer workspace:
//! - A recording store wrapper for asserting call order
//! - A store whose every call fails
//! - A wrapper injecting failures and slow reads into a working store
//! - Proptest generators for keys, values and batches
//! - Fixtures for common scenarios

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

pub use kvlayer_core::{CasToken, Expiry, KvStore, MemoryStore, NullStore, Value, ValueFlags};

// ============================================================================
// RECORDING STORE
// ============================================================================

/// A single call observed by [`RecordingStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub keys: Vec<String>,
}

/// Store wrapper recording every call before delegating to `inner`.
#[derive(Debug, Default)]
pub struct RecordingStore<S> {
    inner: S,
    calls: Mutex<Vec<Call>>,
}

impl<S: KvStore> RecordingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Every call observed so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().clone()
    }

    /// Number of calls to `op`.
    pub fn count(&self, op: &str) -> usize {
        self.lock().iter().filter(|c| c.op == op).count()
    }

    /// Keys passed to `op`, flattened in call order.
    pub fn keys_for(&self, op: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|c| c.op == op)
            .flat_map(|c| c.keys.iter().cloned())
            .collect()
    }

    pub fn reset_calls(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Call>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, op: &'static str, keys: &[&str]) {
        self.lock().push(Call {
            op,
            keys: keys.iter().map(|k| k.to_string()).collect(),
        });
    }
}

impl<S: KvStore> KvStore for RecordingStore<S> {
    fn get(&self, key: &str) -> Option<Value> {
        self.record("get", &[key]);
        self.inner.get(key)
    }

    fn gets(&self, key: &str) -> Option<(Value, CasToken)> {
        self.record("gets", &[key]);
        self.inner.gets(key)
    }

    fn get_multi(&self, keys: &[&str]) -> HashMap<String, Value> {
        self.record("get_multi", keys);
        self.inner.get_multi(keys)
    }

    fn set(&self, key: &str, value: &Value, ttl: Expiry, compress: bool) -> bool {
        self.record("set", &[key]);
        self.inner.set(key, value, ttl, compress)
    }

    fn add(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.record("add", &[key]);
        self.inner.add(key, value, ttl)
    }

    fn replace(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.record("replace", &[key]);
        self.inner.replace(key, value, ttl)
    }

    fn cas(&self, key: &str, value: &Value, ttl: Expiry, token: CasToken) -> bool {
        self.record("cas", &[key]);
        self.inner.cas(key, value, ttl, token)
    }

    fn delete(&self, key: &str) -> bool {
        self.record("delete", &[key]);
        self.inner.delete(key)
    }

    fn incr(&self, key: &str, delta: u64) -> Option<u64> {
        self.record("incr", &[key]);
        self.inner.incr(key, delta)
    }

    fn decr(&self, key: &str, delta: u64) -> Option<u64> {
        self.record("decr", &[key]);
        self.inner.decr(key, delta)
    }

    fn append(&self, key: &str, data: &[u8]) -> bool {
        self.record("append", &[key]);
        self.inner.append(key, data)
    }

    fn prepend(&self, key: &str, data: &[u8]) -> bool {
        self.record("prepend", &[key]);
        self.inner.prepend(key, data)
    }

    fn touch(&self, key: &str, ttl: Expiry) -> bool {
        self.record("touch", &[key]);
        self.inner.touch(key, ttl)
    }

    fn expire(&self, key: &str) -> bool {
        self.record("expire", &[key]);
        self.inner.expire(key)
    }

    fn set_multi(&self, items: &HashMap<String, Value>, ttl: Expiry, compress: bool) -> bool {
        let mut keys = kvlayer_core::item_keys(items);
        keys.sort_unstable();
        self.record("set_multi", &keys);
        self.inner.set_multi(items, ttl, compress)
    }

    fn delete_multi(&self, keys: &[&str]) -> bool {
        self.record("delete_multi", keys);
        self.inner.delete_multi(keys)
    }

    fn append_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.record("append_multi", keys);
        self.inner.append_multi(keys, data)
    }

    fn prepend_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.record("prepend_multi", keys);
        self.inner.prepend_multi(keys, data)
    }

    fn clear(&self) {
        self.record("clear", &[]);
        self.inner.clear();
    }

    fn get_host_by_key(&self, key: &str) -> Option<String> {
        self.inner.get_host_by_key(key)
    }

    fn close(&self) {
        self.record("close", &[]);
        self.inner.close();
    }

    fn reset(&self) {
        self.record("reset", &[]);
        self.inner.reset();
    }
}

// ============================================================================
// FAILING STORE
// ============================================================================

/// Store standing in for an unreachable cluster: reads miss, writes fail.
#[derive(Debug, Clone, Default)]
pub struct FailingStore {
    host: Option<String>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every key to `host`.
    pub fn routed_to(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
        }
    }
}

impl KvStore for FailingStore {
    fn get(&self, _key: &str) -> Option<Value> {
        None
    }
    fn gets(&self, _key: &str) -> Option<(Value, CasToken)> {
        None
    }
    fn get_multi(&self, _keys: &[&str]) -> HashMap<String, Value> {
        HashMap::new()
    }
    fn set(&self, _key: &str, _value: &Value, _ttl: Expiry, _compress: bool) -> bool {
        false
    }
    fn add(&self, _key: &str, _value: &Value, _ttl: Expiry) -> bool {
        false
    }
    fn replace(&self, _key: &str, _value: &Value, _ttl: Expiry) -> bool {
        false
    }
    fn cas(&self, _key: &str, _value: &Value, _ttl: Expiry, _token: CasToken) -> bool {
        false
    }
    fn delete(&self, _key: &str) -> bool {
        false
    }
    fn incr(&self, _key: &str, _delta: u64) -> Option<u64> {
        None
    }
    fn decr(&self, _key: &str, _delta: u64) -> Option<u64> {
        None
    }
    fn append(&self, _key: &str, _data: &[u8]) -> bool {
        false
    }
    fn prepend(&self, _key: &str, _data: &[u8]) -> bool {
        false
    }
    fn touch(&self, _key: &str, _ttl: Expiry) -> bool {
        false
    }
    fn expire(&self, _key: &str) -> bool {
        false
    }
    fn set_multi(&self, _items: &HashMap<String, Value>, _ttl: Expiry, _compress: bool) -> bool {
        false
    }
    fn delete_multi(&self, _keys: &[&str]) -> bool {
        false
    }
    fn append_multi(&self, _keys: &[&str], _data: &[u8]) -> bool {
        false
    }
    fn prepend_multi(&self, _keys: &[&str], _data: &[u8]) -> bool {
        false
    }
    fn clear(&self) {}
    fn get_host_by_key(&self, _key: &str) -> Option<String> {
        self.host.clone()
    }
    fn close(&self) {}
    fn reset(&self) {}
}

// ============================================================================
// FAULTY STORE
// ============================================================================

/// Store wrapper injecting faults into a working `inner`: the named
/// operations report failure without reaching `inner`, and reads can be
/// held back after fetching to widen race windows.
#[derive(Debug, Default)]
pub struct FaultyStore<S> {
    inner: S,
    failing: Vec<&'static str>,
    read_delay: Duration,
}

impl<S: KvStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failing: Vec::new(),
            read_delay: Duration::ZERO,
        }
    }

    /// Make `ops` fail, e.g. `&["set", "delete_multi"]`.
    pub fn failing(mut self, ops: &[&'static str]) -> Self {
        self.failing.extend_from_slice(ops);
        self
    }

    /// Sleep for `delay` between fetching and returning every `get`,
    /// `gets` and `get_multi`.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn fails(&self, op: &str) -> bool {
        self.failing.iter().any(|failing| *failing == op)
    }

    fn pause(&self) {
        if !self.read_delay.is_zero() {
            thread::sleep(self.read_delay);
        }
    }
}

impl<S: KvStore> KvStore for FaultyStore<S> {
    fn get(&self, key: &str) -> Option<Value> {
        let value = self.inner.get(key).filter(|_| !self.fails("get"));
        self.pause();
        value
    }
    fn gets(&self, key: &str) -> Option<(Value, CasToken)> {
        let found = self.inner.gets(key).filter(|_| !self.fails("gets"));
        self.pause();
        found
    }
    fn get_multi(&self, keys: &[&str]) -> HashMap<String, Value> {
        let mut found = self.inner.get_multi(keys);
        if self.fails("get_multi") {
            found.clear();
        }
        self.pause();
        found
    }
    fn set(&self, key: &str, value: &Value, ttl: Expiry, compress: bool) -> bool {
        !self.fails("set") && self.inner.set(key, value, ttl, compress)
    }
    fn add(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        !self.fails("add") && self.inner.add(key, value, ttl)
    }
    fn replace(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        !self.fails("replace") && self.inner.replace(key, value, ttl)
    }
    fn cas(&self, key: &str, value: &Value, ttl: Expiry, token: CasToken) -> bool {
        !self.fails("cas") && self.inner.cas(key, value, ttl, token)
    }
    fn delete(&self, key: &str) -> bool {
        !self.fails("delete") && self.inner.delete(key)
    }
    fn incr(&self, key: &str, delta: u64) -> Option<u64> {
        if self.fails("incr") {
            return None;
        }
        self.inner.incr(key, delta)
    }
    fn decr(&self, key: &str, delta: u64) -> Option<u64> {
        if self.fails("decr") {
            return None;
        }
        self.inner.decr(key, delta)
    }
    fn append(&self, key: &str, data: &[u8]) -> bool {
        !self.fails("append") && self.inner.append(key, data)
    }
    fn prepend(&self, key: &str, data: &[u8]) -> bool {
        !self.fails("prepend") && self.inner.prepend(key, data)
    }
    fn touch(&self, key: &str, ttl: Expiry) -> bool {
        !self.fails("touch") && self.inner.touch(key, ttl)
    }
    fn expire(&self, key: &str) -> bool {
        !self.fails("expire") && self.inner.expire(key)
    }
    fn set_multi(&self, items: &HashMap<String, Value>, ttl: Expiry, compress: bool) -> bool {
        !self.fails("set_multi") && self.inner.set_multi(items, ttl, compress)
    }
    fn delete_multi(&self, keys: &[&str]) -> bool {
        !self.fails("delete_multi") && self.inner.delete_multi(keys)
    }
    fn append_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        !self.fails("append_multi") && self.inner.append_multi(keys, data)
    }
    fn prepend_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        !self.fails("prepend_multi") && self.inner.prepend_multi(keys, data)
    }
    fn clear(&self) {
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
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys, values and batches.

    use super::*;
    use proptest::prelude::*;

    /// Generate a store-safe key (no whitespace or control characters).
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_:]{0,15}"
    }

    /// Generate a raw byte value.
    pub fn arb_raw_value() -> impl Strategy<Value = Value> {
        proptest::collection::vec(any::<u8>(), 0..64).prop_map(Value::raw)
    }

    /// Generate a counter value.
    pub fn arb_int_value() -> impl Strategy<Value = Value> {
        any::<u64>().prop_map(Value::int)
    }

    /// Generate any kind of value.
    pub fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            arb_raw_value(),
            arb_int_value(),
            ".{0,32}".prop_map(|s| Value::encode(&s).unwrap_or_else(|_| Value::raw(s))),
            Just(Value::empty_marker()),
        ]
    }

    /// Generate an expiry: mostly "never", otherwise up to a day.
    pub fn arb_ttl() -> impl Strategy<Value = Expiry> {
        prop_oneof![3 => Just(0u32), 1 => 1u32..86_400]
    }

    /// Generate a batch of distinct keys with values.
    pub fn arb_items(max: usize) -> impl Strategy<Value = HashMap<String, Value>> {
        proptest::collection::hash_map(arb_key(), arb_value(), 0..max)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built stores for common testing scenarios.

    use super::*;

    /// A routing store holding `user:<i>` => `i` for `0..n`.
    pub fn populated_store(n: u64) -> MemoryStore {
        let store = MemoryStore::with_servers(["cache-a:11211", "cache-b:11211"]);
        for i in 0..n {
            store.set(&format!("user:{i}"), &Value::int(i), 0, true);
        }
        store
    }

    /// Two routing stores with disjoint node sets, as seen during a migration.
    pub fn migration_pair() -> (MemoryStore, MemoryStore) {
        (
            MemoryStore::with_servers(["old-a:11211", "old-b:11211"]),
            MemoryStore::with_servers(["new-a:11211", "new-b:11211", "new-c:11211"]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_store_tracks_calls() {
        let store = RecordingStore::new(MemoryStore::new());
        store.set("a", &Value::raw("1"), 0, true);
        store.get("a");
        store.delete_multi(&["a", "b"]);

        assert_eq!(store.count("set"), 1);
        assert_eq!(store.keys_for("delete_multi"), vec!["a", "b"]);
        assert_eq!(store.calls().len(), 3);

        store.reset_calls();
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_failing_store_fails_everything() {
        let store = FailingStore::routed_to("down:11211");
        assert!(!store.set("a", &Value::raw("1"), 0, true));
        assert!(store.get("a").is_none());
        assert_eq!(store.get_host_by_key("a").as_deref(), Some("down:11211"));
    }

    #[test]
    fn test_faulty_store_fails_only_named_ops() {
        let store = FaultyStore::new(MemoryStore::new()).failing(&["set"]);
        assert!(!store.set("a", &Value::raw("1"), 0, true));
        assert!(store.add("a", &Value::raw("2"), 0));
        assert_eq!(store.get("a"), Some(Value::raw("2")));
        assert!(store.inner().contains("a"));
    }

    #[test]
    fn test_faulty_store_delays_reads() {
        let store = FaultyStore::new(MemoryStore::new()).with_read_delay(Duration::from_millis(20));
        let started = std::time::Instant::now();
        assert!(store.get("missing").is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_fixtures() {
        assert_eq!(fixtures::populated_store(5).len(), 5);
        let (old, new) = fixtures::migration_pair();
        assert_ne!(old.servers(), new.servers());
    }
}
