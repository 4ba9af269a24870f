//! The key-value store contract.
//!
//! Every driver and every topology wrapper implements [`KvStore`], so
//! wrappers chain arbitrarily: a wrapper holds one or two inner stores and
//! implements each operation explicitly, either specializing it or
//! delegating it.
//!
//! # Failure Model
//!
//! Store calls never return errors. A miss is `None` (or an omitted key in
//! batch reads) and a failed mutation is `false`. Callers treat the cache as
//! fail-open: an unavailable store degrades to direct computation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::value::Value;

/// Expiry in seconds. `0` means the entry never expires.
pub type Expiry = u32;

/// CAS token returned by [`KvStore::gets`].
pub type CasToken = u64;

/// Key-value store contract shared by drivers and topology wrappers.
pub trait KvStore: Send + Sync {
    // === Reads ===

    /// Get a single value.
    fn get(&self, key: &str) -> Option<Value>;

    /// Get a value together with its CAS token.
    fn gets(&self, key: &str) -> Option<(Value, CasToken)>;

    /// Get many values. Absent keys are omitted from the result.
    fn get_multi(&self, keys: &[&str]) -> HashMap<String, Value>;

    /// Get many values, aligned with `keys`, `None` for misses.
    fn get_list(&self, keys: &[&str]) -> Vec<Option<Value>> {
        let mut found = self.get_multi(keys);
        keys.iter().map(|k| found.remove(*k)).collect()
    }

    // === Single-key mutations ===

    /// Store unconditionally.
    fn set(&self, key: &str, value: &Value, ttl: Expiry, compress: bool) -> bool;

    /// Store only if the key is absent. This is the atomic primitive the
    /// stampede mutex and version publishing rely on.
    fn add(&self, key: &str, value: &Value, ttl: Expiry) -> bool;

    /// Store only if the key is present.
    fn replace(&self, key: &str, value: &Value, ttl: Expiry) -> bool;

    /// Store only if the entry still carries `token`.
    fn cas(&self, key: &str, value: &Value, ttl: Expiry, token: CasToken) -> bool;

    /// Remove `key` immediately. There is no delayed delete: servers dropped
    /// the hold-time argument, so callers wanting a grace period use
    /// [`KvStore::touch`] with a short TTL instead.
    fn delete(&self, key: &str) -> bool;

    /// Increment a counter, returning the new value; `None` on miss or a
    /// non-numeric entry.
    fn incr(&self, key: &str, delta: u64) -> Option<u64>;

    /// Decrement a counter, saturating at zero.
    fn decr(&self, key: &str, delta: u64) -> Option<u64>;

    fn append(&self, key: &str, data: &[u8]) -> bool;

    fn prepend(&self, key: &str, data: &[u8]) -> bool;

    /// Reset the expiry of an existing entry.
    fn touch(&self, key: &str, ttl: Expiry) -> bool;

    /// Expire an entry immediately.
    fn expire(&self, key: &str) -> bool;

    // === Batch mutations ===

    fn set_multi(&self, items: &HashMap<String, Value>, ttl: Expiry, compress: bool) -> bool;

    fn delete_multi(&self, keys: &[&str]) -> bool;

    fn append_multi(&self, keys: &[&str], data: &[u8]) -> bool;

    fn prepend_multi(&self, keys: &[&str], data: &[u8]) -> bool;

    // === Administration ===

    /// Drop every entry this handle can reach. Wrappers where that is unsafe
    /// make this a no-op.
    fn clear(&self);

    /// Node the key routes to, used for migration decisions.
    fn get_host_by_key(&self, key: &str) -> Option<String>;

    fn close(&self);

    fn reset(&self);
}

/// Collect the keys of a batch as borrowed strings.
pub fn item_keys(items: &HashMap<String, Value>) -> Vec<&str> {
    items.keys().map(String::as_str).collect()
}

macro_rules! forward_kv_store {
    ($($ptr:ident),*) => {$(
        impl<S: KvStore + ?Sized> KvStore for $ptr<S> {
            fn get(&self, key: &str) -> Option<Value> {
                (**self).get(key)
            }
            fn gets(&self, key: &str) -> Option<(Value, CasToken)> {
                (**self).gets(key)
            }
            fn get_multi(&self, keys: &[&str]) -> HashMap<String, Value> {
                (**self).get_multi(keys)
            }
            fn get_list(&self, keys: &[&str]) -> Vec<Option<Value>> {
                (**self).get_list(keys)
            }
            fn set(&self, key: &str, value: &Value, ttl: Expiry, compress: bool) -> bool {
                (**self).set(key, value, ttl, compress)
            }
            fn add(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
                (**self).add(key, value, ttl)
            }
            fn replace(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
                (**self).replace(key, value, ttl)
            }
            fn cas(&self, key: &str, value: &Value, ttl: Expiry, token: CasToken) -> bool {
                (**self).cas(key, value, ttl, token)
            }
            fn delete(&self, key: &str) -> bool {
                (**self).delete(key)
            }
            fn incr(&self, key: &str, delta: u64) -> Option<u64> {
                (**self).incr(key, delta)
            }
            fn decr(&self, key: &str, delta: u64) -> Option<u64> {
                (**self).decr(key, delta)
            }
            fn append(&self, key: &str, data: &[u8]) -> bool {
                (**self).append(key, data)
            }
            fn prepend(&self, key: &str, data: &[u8]) -> bool {
                (**self).prepend(key, data)
            }
            fn touch(&self, key: &str, ttl: Expiry) -> bool {
                (**self).touch(key, ttl)
            }
            fn expire(&self, key: &str) -> bool {
                (**self).expire(key)
            }
            fn set_multi(&self, items: &HashMap<String, Value>, ttl: Expiry, compress: bool) -> bool {
                (**self).set_multi(items, ttl, compress)
            }
            fn delete_multi(&self, keys: &[&str]) -> bool {
                (**self).delete_multi(keys)
            }
            fn append_multi(&self, keys: &[&str], data: &[u8]) -> bool {
                (**self).append_multi(keys, data)
            }
            fn prepend_multi(&self, keys: &[&str], data: &[u8]) -> bool {
                (**self).prepend_multi(keys, data)
            }
            fn clear(&self) {
                (**self).clear()
            }
            fn get_host_by_key(&self, key: &str) -> Option<String> {
                (**self).get_host_by_key(key)
            }
            fn close(&self) {
                (**self).close()
            }
            fn reset(&self) {
                (**self).reset()
            }
        }
    )*};
}

forward_kv_store!(Arc, Box);
