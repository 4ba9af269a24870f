//! Store used when caching is disabled.
//!
//! Every read misses and every write reports success, so callers behave as
//! if the cache were cold rather than broken: no cleanup callbacks fire and
//! cached functions simply recompute.

use std::collections::HashMap;

use crate::store::{CasToken, Expiry, KvStore};
use crate::value::Value;

#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

impl NullStore {
    pub fn new() -> Self {
        Self
    }
}

impl KvStore for NullStore {
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
        true
    }

    fn add(&self, _key: &str, _value: &Value, _ttl: Expiry) -> bool {
        true
    }

    fn replace(&self, _key: &str, _value: &Value, _ttl: Expiry) -> bool {
        true
    }

    fn cas(&self, _key: &str, _value: &Value, _ttl: Expiry, _token: CasToken) -> bool {
        true
    }

    fn delete(&self, _key: &str) -> bool {
        true
    }

    fn incr(&self, _key: &str, _delta: u64) -> Option<u64> {
        Some(0)
    }

    fn decr(&self, _key: &str, _delta: u64) -> Option<u64> {
        Some(0)
    }

    fn append(&self, _key: &str, _data: &[u8]) -> bool {
        true
    }

    fn prepend(&self, _key: &str, _data: &[u8]) -> bool {
        true
    }

    fn touch(&self, _key: &str, _ttl: Expiry) -> bool {
        true
    }

    fn expire(&self, _key: &str) -> bool {
        true
    }

    fn set_multi(&self, _items: &HashMap<String, Value>, _ttl: Expiry, _compress: bool) -> bool {
        true
    }

    fn delete_multi(&self, _keys: &[&str]) -> bool {
        true
    }

    fn append_multi(&self, _keys: &[&str], _data: &[u8]) -> bool {
        true
    }

    fn prepend_multi(&self, _keys: &[&str], _data: &[u8]) -> bool {
        true
    }

    fn clear(&self) {}

    fn get_host_by_key(&self, _key: &str) -> Option<String> {
        None
    }

    fn close(&self) {}

    fn reset(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_miss_and_writes_succeed() {
        let store = NullStore::new();
        assert!(store.set("k", &Value::raw("v"), 0, true));
        assert!(store.get("k").is_none());
        assert!(store.add("k", &Value::raw("v"), 0));
        assert_eq!(store.get_list(&["a", "b"]), vec![None, None]);
    }
}
