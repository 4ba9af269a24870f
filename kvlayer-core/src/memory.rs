//! In-process key-value store.
//!
//! [`MemoryStore`] implements the full [`KvStore`] contract with memcached
//! semantics (expiry, CAS tokens, add/replace, counters, append/prepend) and
//! a node list used only for routing decisions. It backs tests, local
//! development, and any deployment without a network cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::store::{CasToken, Expiry, KvStore};
use crate::value::Value;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
    cas: CasToken,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

fn deadline(ttl: Expiry) -> Option<Instant> {
    if ttl == 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_secs(u64::from(ttl)))
    }
}

/// In-memory store with memcached semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    servers: Vec<String>,
    entries: RwLock<HashMap<String, Entry>>,
    next_cas: AtomicU64,
}

impl MemoryStore {
    /// Create a store that routes no keys (`get_host_by_key` is `None`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that routes keys across the given node names.
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.read().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a live entry exists, without touching it.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.read().get(key).is_some_and(|e| e.is_live(now))
    }

    /// Remaining lifetime of an entry. `Some(None)` for entries that never
    /// expire, `None` for absent entries.
    pub fn ttl_of(&self, key: &str) -> Option<Option<Duration>> {
        let now = Instant::now();
        let entries = self.read();
        let entry = entries.get(key).filter(|e| e.is_live(now))?;
        Some(entry.expires_at.map(|at| at.saturating_duration_since(now)))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn token(&self) -> CasToken {
        self.next_cas.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn store(&self, entries: &mut HashMap<String, Entry>, key: &str, value: &Value, ttl: Expiry) {
        entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at: deadline(ttl),
                cas: self.token(),
            },
        );
    }

    /// Apply `f` to a live entry under the write lock, bumping its CAS token.
    fn update<R>(&self, key: &str, f: impl FnOnce(&mut Value) -> Option<R>) -> Option<R> {
        let now = Instant::now();
        let mut entries = self.write();
        let entry = entries.get_mut(key).filter(|e| e.is_live(now))?;
        let result = f(&mut entry.value)?;
        entry.cas = self.token();
        Some(result)
    }

    fn adjust(&self, key: &str, op: impl FnOnce(u64) -> u64) -> Option<u64> {
        self.update(key, |value| {
            let next = op(value.as_int()?);
            *value = Value::from_parts(next.to_string().into_bytes(), value.flags());
            Some(next)
        })
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.gets(key).map(|(value, _)| value)
    }

    fn gets(&self, key: &str) -> Option<(Value, CasToken)> {
        let now = Instant::now();
        self.read()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| (e.value.clone(), e.cas))
    }

    fn get_multi(&self, keys: &[&str]) -> HashMap<String, Value> {
        let now = Instant::now();
        let entries = self.read();
        keys.iter()
            .filter_map(|k| {
                entries
                    .get(*k)
                    .filter(|e| e.is_live(now))
                    .map(|e| (k.to_string(), e.value.clone()))
            })
            .collect()
    }

    fn set(&self, key: &str, value: &Value, ttl: Expiry, _compress: bool) -> bool {
        let mut entries = self.write();
        self.store(&mut entries, key, value, ttl);
        true
    }

    fn add(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        let now = Instant::now();
        let mut entries = self.write();
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return false;
        }
        self.store(&mut entries, key, value, ttl);
        true
    }

    fn replace(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        let now = Instant::now();
        let mut entries = self.write();
        if !entries.get(key).is_some_and(|e| e.is_live(now)) {
            return false;
        }
        self.store(&mut entries, key, value, ttl);
        true
    }

    fn cas(&self, key: &str, value: &Value, ttl: Expiry, token: CasToken) -> bool {
        let now = Instant::now();
        let mut entries = self.write();
        let matches = entries
            .get(key)
            .is_some_and(|e| e.is_live(now) && e.cas == token);
        if matches {
            self.store(&mut entries, key, value, ttl);
        }
        matches
    }

    // Deleting an absent key still leaves the key absent, so it succeeds.
    fn delete(&self, key: &str) -> bool {
        self.write().remove(key);
        true
    }

    fn incr(&self, key: &str, delta: u64) -> Option<u64> {
        self.adjust(key, |n| n.wrapping_add(delta))
    }

    fn decr(&self, key: &str, delta: u64) -> Option<u64> {
        self.adjust(key, |n| n.saturating_sub(delta))
    }

    fn append(&self, key: &str, data: &[u8]) -> bool {
        self.update(key, |value| {
            value.append(data);
            Some(())
        })
        .is_some()
    }

    fn prepend(&self, key: &str, data: &[u8]) -> bool {
        self.update(key, |value| {
            value.prepend(data);
            Some(())
        })
        .is_some()
    }

    fn touch(&self, key: &str, ttl: Expiry) -> bool {
        let now = Instant::now();
        let mut entries = self.write();
        match entries.get_mut(key).filter(|e| e.is_live(now)) {
            Some(entry) => {
                entry.expires_at = deadline(ttl);
                true
            }
            None => false,
        }
    }

    fn expire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.write();
        match entries.remove(key) {
            Some(entry) => entry.is_live(now),
            None => false,
        }
    }

    fn set_multi(&self, items: &HashMap<String, Value>, ttl: Expiry, _compress: bool) -> bool {
        let mut entries = self.write();
        for (key, value) in items {
            self.store(&mut entries, key, value, ttl);
        }
        true
    }

    fn delete_multi(&self, keys: &[&str]) -> bool {
        let mut entries = self.write();
        for key in keys {
            entries.remove(*key);
        }
        true
    }

    fn append_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        keys.iter()
            .map(|k| self.append(k, data))
            .fold(true, |all, ok| all && ok)
    }

    fn prepend_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        keys.iter()
            .map(|k| self.prepend(k, data))
            .fold(true, |all, ok| all && ok)
    }

    fn clear(&self) {
        self.write().clear();
    }

    fn get_host_by_key(&self, key: &str) -> Option<String> {
        if self.servers.is_empty() {
            return None;
        }
        let digest = Sha256::digest(key.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let slot = u64::from_be_bytes(head) % self.servers.len() as u64;
        self.servers.get(slot as usize).cloned()
    }

    fn close(&self) {}

    fn reset(&self) {}
}
