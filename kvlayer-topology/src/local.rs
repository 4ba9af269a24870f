//! Bounded per-process read cache.
//!
//! [`LocalCache`] keeps values it has read or written in a process-local
//! map and serves repeated reads from it. The map is reset wholesale when it
//! reaches its bound rather than evicting entry by entry: a coarse policy
//! that needs no per-entry bookkeeping on the read path.
//!
//! # Staleness
//!
//! Local entries are never revalidated against the inner store, so another
//! process's writes are invisible until this process writes the key or the
//! map resets. Use [`VersionedLocalCache`](crate::VersionedLocalCache) when
//! that is not acceptable.
//!
//! Within the process, writes and fills are ordered by a generation counter
//! bumped on every write. A read that misses only stores what it fetched if
//! no write happened while it was talking to the inner store, and mutations
//! evict their keys both before and after delegating.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kvlayer_core::{CasToken, Expiry, KvStore, Value};
use tracing::debug;

/// Default bound on the number of locally cached entries.
pub const DEFAULT_LOCAL_CACHE_SIZE: usize = 10_000;

/// Statistics about local cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalCacheStats {
    /// Reads served from the local map.
    pub hits: u64,
    /// Reads that fell through to the inner store.
    pub misses: u64,
    /// Number of entries currently cached.
    pub entry_count: u64,
    /// Number of times the map was reset on reaching its bound.
    pub resets: u64,
}

impl LocalCacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Store wrapper caching reads in a bounded process-local map.
#[derive(Debug)]
pub struct LocalCache<S> {
    inner: S,
    bound: usize,
    entries: RwLock<HashMap<String, Value>>,
    /// Bumped under the write lock by every write path.
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    resets: AtomicU64,
}

impl<S: KvStore> LocalCache<S> {
    /// Wrap `inner` with the default bound.
    pub fn new(inner: S) -> Self {
        Self::with_bound(inner, DEFAULT_LOCAL_CACHE_SIZE)
    }

    /// Wrap `inner`, caching at most `bound` entries. A bound of zero
    /// disables local caching.
    pub fn with_bound(inner: S, bound: usize) -> Self {
        Self {
            inner,
            bound,
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Number of locally cached entries.
    pub fn local_len(&self) -> usize {
        self.read().len()
    }

    /// Whether `key` is currently held locally.
    pub fn is_cached(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn stats(&self) -> LocalCacheStats {
        LocalCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.local_len() as u64,
            resets: self.resets.load(Ordering::Relaxed),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Value>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current generation. Stable while any guard on `entries` is held.
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Must be called with the write lock held.
    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Insert under the write lock, resetting the whole map first when a new
    /// key would exceed the bound.
    fn remember_in(&self, entries: &mut HashMap<String, Value>, key: &str, value: &Value) {
        if self.bound == 0 {
            return;
        }
        if !entries.contains_key(key) && entries.len() >= self.bound {
            debug!(bound = self.bound, "local cache full, resetting");
            entries.clear();
            self.resets.fetch_add(1, Ordering::Relaxed);
        }
        entries.insert(key.to_string(), value.clone());
    }

    /// Store values read from the inner store, unless a write happened
    /// since `seen` was taken.
    fn fill<'a>(&self, seen: u64, fetched: impl IntoIterator<Item = (&'a str, &'a Value)>) {
        let mut entries = self.write();
        if self.generation() != seen {
            debug!("write raced a local fill, skipping");
            return;
        }
        for (key, value) in fetched {
            self.remember_in(&mut entries, key, value);
        }
    }

    /// Record the outcome of a write that started at generation `seen`.
    /// The value is kept only when no other write finished in between.
    fn settle(&self, key: &str, written: Option<&Value>, seen: u64) {
        let mut entries = self.write();
        match written {
            Some(value) if self.generation() == seen => self.remember_in(&mut entries, key, value),
            _ => {
                entries.remove(key);
            }
        }
        self.bump();
    }

    fn forget_all(&self, keys: &[&str]) {
        let mut entries = self.write();
        for key in keys {
            entries.remove(*key);
        }
        self.bump();
    }

    fn forget_everything(&self) {
        let mut entries = self.write();
        entries.clear();
        self.bump();
    }

    /// Run `op` against the inner store with `keys` evicted on both sides,
    /// so a fill that overlaps it cannot leave the old value behind.
    fn evicting<R>(&self, keys: &[&str], op: impl FnOnce(&S) -> R) -> R {
        self.forget_all(keys);
        let result = op(&self.inner);
        self.forget_all(keys);
        result
    }
}

impl<S: KvStore> KvStore for LocalCache<S> {
    fn get(&self, key: &str) -> Option<Value> {
        let seen = {
            let entries = self.read();
            if let Some(value) = entries.get(key).cloned() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
            self.generation()
        };
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = self.inner.get(key)?;
        self.fill(seen, [(key, &value)]);
        Some(value)
    }

    fn gets(&self, key: &str) -> Option<(Value, CasToken)> {
        self.inner.gets(key)
    }

    fn get_multi(&self, keys: &[&str]) -> HashMap<String, Value> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut missed = Vec::new();
        let seen = {
            let entries = self.read();
            for key in keys {
                match entries.get(*key) {
                    Some(value) => {
                        found.insert(key.to_string(), value.clone());
                    }
                    None => missed.push(*key),
                }
            }
            self.generation()
        };
        self.hits.fetch_add(found.len() as u64, Ordering::Relaxed);
        if missed.is_empty() {
            return found;
        }
        self.misses.fetch_add(missed.len() as u64, Ordering::Relaxed);

        let fetched = self.inner.get_multi(&missed);
        self.fill(seen, fetched.iter().map(|(k, v)| (k.as_str(), v)));
        found.extend(fetched);
        found
    }

    fn set(&self, key: &str, value: &Value, ttl: Expiry, compress: bool) -> bool {
        let seen = self.generation();
        let stored = self.inner.set(key, value, ttl, compress);
        self.settle(key, stored.then_some(value), seen);
        stored
    }

    fn add(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.evicting(&[key], |s| s.add(key, value, ttl))
    }

    fn replace(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.evicting(&[key], |s| s.replace(key, value, ttl))
    }

    // A failed swap means the entry changed underneath us, so whatever we
    // hold is suspect.
    fn cas(&self, key: &str, value: &Value, ttl: Expiry, token: CasToken) -> bool {
        let seen = self.generation();
        let swapped = self.inner.cas(key, value, ttl, token);
        self.settle(key, swapped.then_some(value), seen);
        swapped
    }

    fn delete(&self, key: &str) -> bool {
        self.evicting(&[key], |s| s.delete(key))
    }

    fn incr(&self, key: &str, delta: u64) -> Option<u64> {
        self.evicting(&[key], |s| s.incr(key, delta))
    }

    fn decr(&self, key: &str, delta: u64) -> Option<u64> {
        self.evicting(&[key], |s| s.decr(key, delta))
    }

    fn append(&self, key: &str, data: &[u8]) -> bool {
        self.evicting(&[key], |s| s.append(key, data))
    }

    fn prepend(&self, key: &str, data: &[u8]) -> bool {
        self.evicting(&[key], |s| s.prepend(key, data))
    }

    fn touch(&self, key: &str, ttl: Expiry) -> bool {
        self.evicting(&[key], |s| s.touch(key, ttl))
    }

    fn expire(&self, key: &str) -> bool {
        self.evicting(&[key], |s| s.expire(key))
    }

    fn set_multi(&self, items: &HashMap<String, Value>, ttl: Expiry, compress: bool) -> bool {
        self.evicting(&kvlayer_core::item_keys(items), |s| s.set_multi(items, ttl, compress))
    }

    fn delete_multi(&self, keys: &[&str]) -> bool {
        self.evicting(keys, |s| s.delete_multi(keys))
    }

    fn append_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.evicting(keys, |s| s.append_multi(keys, data))
    }

    fn prepend_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.evicting(keys, |s| s.prepend_multi(keys, data))
    }

    fn clear(&self) {
        self.forget_everything();
        self.inner.clear();
        self.forget_everything();
    }

    fn get_host_by_key(&self, key: &str) -> Option<String> {
        self.inner.get_host_by_key(key)
    }

    fn close(&self) {
        self.inner.close();
    }

    // Reconnecting invalidates nothing remotely, but local state from before
    // the reset cannot be trusted either.
    fn reset(&self) {
        self.inner.reset();
        self.forget_everything();
    }
}
