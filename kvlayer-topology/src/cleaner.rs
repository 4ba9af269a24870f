//! Out-of-band cleanup for writes that failed.
//!
//! When a `set` or `delete` returns `false` the entry's state in the store is
//! unknown: it may still hold the old value. [`CleanerStore`] hands each
//! affected key to a [`Cleaner`], typically one that queues the key for a
//! later delete, so the stale entry does not outlive its TTL unnoticed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kvlayer_core::{CasToken, Expiry, KvStore, Value};
use tracing::debug;

/// Callback receiving keys whose mutation failed.
pub trait Cleaner: Send + Sync {
    fn clean(&self, key: &str);
}

impl<F> Cleaner for F
where
    F: Fn(&str) + Send + Sync,
{
    fn clean(&self, key: &str) {
        self(key)
    }
}

/// Store wrapper invoking a [`Cleaner`] for every key of a failed
/// `set`, `delete`, `set_multi` or `delete_multi`.
pub struct CleanerStore<S> {
    inner: S,
    cleaner: Arc<dyn Cleaner>,
}

impl<S: KvStore> CleanerStore<S> {
    pub fn new(inner: S, cleaner: impl Cleaner + 'static) -> Self {
        Self::with_shared(inner, Arc::new(cleaner))
    }

    pub fn with_shared(inner: S, cleaner: Arc<dyn Cleaner>) -> Self {
        Self { inner, cleaner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn on_failure<'a>(
        &self,
        ok: bool,
        op: &'static str,
        keys: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        if !ok {
            for key in keys {
                debug!(key = %key, op, "write failed, handing key to cleaner");
                self.cleaner.clean(key);
            }
        }
        ok
    }
}

impl<S> fmt::Debug for CleanerStore<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanerStore")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<S: KvStore> KvStore for CleanerStore<S> {
    fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(key)
    }

    fn gets(&self, key: &str) -> Option<(Value, CasToken)> {
        self.inner.gets(key)
    }

    fn get_multi(&self, keys: &[&str]) -> HashMap<String, Value> {
        self.inner.get_multi(keys)
    }

    fn get_list(&self, keys: &[&str]) -> Vec<Option<Value>> {
        self.inner.get_list(keys)
    }

    fn set(&self, key: &str, value: &Value, ttl: Expiry, compress: bool) -> bool {
        let ok = self.inner.set(key, value, ttl, compress);
        self.on_failure(ok, "set", [key])
    }

    fn add(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.inner.add(key, value, ttl)
    }

    fn replace(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.inner.replace(key, value, ttl)
    }

    fn cas(&self, key: &str, value: &Value, ttl: Expiry, token: CasToken) -> bool {
        self.inner.cas(key, value, ttl, token)
    }

    fn delete(&self, key: &str) -> bool {
        let ok = self.inner.delete(key);
        self.on_failure(ok, "delete", [key])
    }

    fn incr(&self, key: &str, delta: u64) -> Option<u64> {
        self.inner.incr(key, delta)
    }

    fn decr(&self, key: &str, delta: u64) -> Option<u64> {
        self.inner.decr(key, delta)
    }

    fn append(&self, key: &str, data: &[u8]) -> bool {
        self.inner.append(key, data)
    }

    fn prepend(&self, key: &str, data: &[u8]) -> bool {
        self.inner.prepend(key, data)
    }

    fn touch(&self, key: &str, ttl: Expiry) -> bool {
        self.inner.touch(key, ttl)
    }

    fn expire(&self, key: &str) -> bool {
        self.inner.expire(key)
    }

    fn set_multi(&self, items: &HashMap<String, Value>, ttl: Expiry, compress: bool) -> bool {
        let ok = self.inner.set_multi(items, ttl, compress);
        self.on_failure(ok, "set_multi", items.keys().map(String::as_str))
    }

    fn delete_multi(&self, keys: &[&str]) -> bool {
        let ok = self.inner.delete_multi(keys);
        self.on_failure(ok, "delete_multi", keys.iter().copied())
    }

    fn append_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.inner.append_multi(keys, data)
    }

    fn prepend_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.inner.prepend_multi(keys, data)
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
