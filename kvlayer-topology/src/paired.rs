//! Keep a secondary cache invalidated on writes to the main store.

use std::collections::HashMap;

use kvlayer_core::{CasToken, Expiry, KvStore, Value};

/// Store wrapper serving from `main` and invalidating `secondary` on every
/// mutation, so the secondary never serves data known to be stale.
#[derive(Debug)]
pub struct PairedInvalidationStore<M, S> {
    main: M,
    secondary: S,
}

impl<M: KvStore, S: KvStore> PairedInvalidationStore<M, S> {
    pub fn new(main: M, secondary: S) -> Self {
        Self { main, secondary }
    }

    pub fn main(&self) -> &M {
        &self.main
    }

    pub fn secondary(&self) -> &S {
        &self.secondary
    }
}

impl<M: KvStore, S: KvStore> KvStore for PairedInvalidationStore<M, S> {
    fn get(&self, key: &str) -> Option<Value> {
        self.main.get(key)
    }

    fn gets(&self, key: &str) -> Option<(Value, CasToken)> {
        self.main.gets(key)
    }

    fn get_multi(&self, keys: &[&str]) -> HashMap<String, Value> {
        self.main.get_multi(keys)
    }

    fn set(&self, key: &str, value: &Value, ttl: Expiry, compress: bool) -> bool {
        self.secondary.delete(key);
        self.main.set(key, value, ttl, compress)
    }

    fn add(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.secondary.delete(key);
        self.main.add(key, value, ttl)
    }

    fn replace(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.secondary.delete(key);
        self.main.replace(key, value, ttl)
    }

    fn cas(&self, key: &str, value: &Value, ttl: Expiry, token: CasToken) -> bool {
        self.secondary.delete(key);
        self.main.cas(key, value, ttl, token)
    }

    fn delete(&self, key: &str) -> bool {
        self.secondary.delete(key);
        self.main.delete(key)
    }

    fn incr(&self, key: &str, delta: u64) -> Option<u64> {
        self.secondary.delete(key);
        self.main.incr(key, delta)
    }

    fn decr(&self, key: &str, delta: u64) -> Option<u64> {
        self.secondary.delete(key);
        self.main.decr(key, delta)
    }

    fn append(&self, key: &str, data: &[u8]) -> bool {
        self.secondary.delete(key);
        self.main.append(key, data)
    }

    fn prepend(&self, key: &str, data: &[u8]) -> bool {
        self.secondary.delete(key);
        self.main.prepend(key, data)
    }

    fn touch(&self, key: &str, ttl: Expiry) -> bool {
        self.secondary.delete(key);
        self.main.touch(key, ttl)
    }

    fn expire(&self, key: &str) -> bool {
        self.secondary.delete(key);
        self.main.expire(key)
    }

    fn set_multi(&self, items: &HashMap<String, Value>, ttl: Expiry, compress: bool) -> bool {
        self.secondary.delete_multi(&kvlayer_core::item_keys(items));
        self.main.set_multi(items, ttl, compress)
    }

    fn delete_multi(&self, keys: &[&str]) -> bool {
        self.secondary.delete_multi(keys);
        self.main.delete_multi(keys)
    }

    fn append_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.secondary.delete_multi(keys);
        self.main.append_multi(keys, data)
    }

    fn prepend_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.secondary.delete_multi(keys);
        self.main.prepend_multi(keys, data)
    }

    fn clear(&self) {
        self.secondary.clear();
        self.main.clear();
    }

    fn get_host_by_key(&self, key: &str) -> Option<String> {
        self.main.get_host_by_key(key)
    }

    fn close(&self) {
        self.main.close();
        self.secondary.close();
    }

    fn reset(&self) {
        self.main.reset();
        self.secondary.reset();
    }
}
