//! Per-call tracing and call statistics.
//!
//! [`LoggingStore`] emits one `debug` event per store call with the
//! operation, the key(s) and the payload size, and accumulates call counts
//! and wall time per operation. It is meant for sampled processes only: the
//! event volume is proportional to store traffic.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use kvlayer_core::{CasToken, Expiry, KvStore, Value};
use tracing::debug;

/// Accumulated statistics for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub op: &'static str,
    pub calls: u64,
    pub total: Duration,
}

impl CallSummary {
    /// Mean wall time per call.
    pub fn average(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total / u32::try_from(self.calls).unwrap_or(u32::MAX)
        }
    }
}

/// Store wrapper logging every call.
#[derive(Debug)]
pub struct LoggingStore<S> {
    inner: S,
    stats: DashMap<&'static str, (u64, Duration)>,
}

impl<S: KvStore> LoggingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            stats: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Per-operation statistics, sorted by operation name.
    pub fn summary(&self) -> Vec<CallSummary> {
        let mut summary: Vec<CallSummary> = self
            .stats
            .iter()
            .map(|entry| CallSummary {
                op: *entry.key(),
                calls: entry.value().0,
                total: entry.value().1,
            })
            .collect();
        summary.sort_by_key(|s| s.op);
        summary
    }

    fn observe<R>(
        &self,
        op: &'static str,
        keys: &[&str],
        size: usize,
        call: impl FnOnce() -> R,
    ) -> R {
        let start = Instant::now();
        let result = call();
        let elapsed = start.elapsed();

        debug!(
            op,
            key = %keys.join(","),
            size,
            elapsed_us = elapsed.as_micros() as u64,
            "store call"
        );
        let mut entry = self.stats.entry(op).or_insert((0, Duration::ZERO));
        entry.0 += 1;
        entry.1 += elapsed;
        result
    }
}

fn batch_size(items: &HashMap<String, Value>) -> usize {
    items.values().map(Value::len).sum()
}

impl<S: KvStore> KvStore for LoggingStore<S> {
    fn get(&self, key: &str) -> Option<Value> {
        self.observe("get", &[key], 0, || self.inner.get(key))
    }

    fn gets(&self, key: &str) -> Option<(Value, CasToken)> {
        self.observe("gets", &[key], 0, || self.inner.gets(key))
    }

    fn get_multi(&self, keys: &[&str]) -> HashMap<String, Value> {
        self.observe("get_multi", keys, 0, || self.inner.get_multi(keys))
    }

    fn get_list(&self, keys: &[&str]) -> Vec<Option<Value>> {
        self.observe("get_list", keys, 0, || self.inner.get_list(keys))
    }

    fn set(&self, key: &str, value: &Value, ttl: Expiry, compress: bool) -> bool {
        self.observe("set", &[key], value.len(), || {
            self.inner.set(key, value, ttl, compress)
        })
    }

    fn add(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.observe("add", &[key], value.len(), || self.inner.add(key, value, ttl))
    }

    fn replace(&self, key: &str, value: &Value, ttl: Expiry) -> bool {
        self.observe("replace", &[key], value.len(), || {
            self.inner.replace(key, value, ttl)
        })
    }

    fn cas(&self, key: &str, value: &Value, ttl: Expiry, token: CasToken) -> bool {
        self.observe("cas", &[key], value.len(), || {
            self.inner.cas(key, value, ttl, token)
        })
    }

    fn delete(&self, key: &str) -> bool {
        self.observe("delete", &[key], 0, || self.inner.delete(key))
    }

    fn incr(&self, key: &str, delta: u64) -> Option<u64> {
        self.observe("incr", &[key], 0, || self.inner.incr(key, delta))
    }

    fn decr(&self, key: &str, delta: u64) -> Option<u64> {
        self.observe("decr", &[key], 0, || self.inner.decr(key, delta))
    }

    fn append(&self, key: &str, data: &[u8]) -> bool {
        self.observe("append", &[key], data.len(), || self.inner.append(key, data))
    }

    fn prepend(&self, key: &str, data: &[u8]) -> bool {
        self.observe("prepend", &[key], data.len(), || {
            self.inner.prepend(key, data)
        })
    }

    fn touch(&self, key: &str, ttl: Expiry) -> bool {
        self.observe("touch", &[key], 0, || self.inner.touch(key, ttl))
    }

    fn expire(&self, key: &str) -> bool {
        self.observe("expire", &[key], 0, || self.inner.expire(key))
    }

    fn set_multi(&self, items: &HashMap<String, Value>, ttl: Expiry, compress: bool) -> bool {
        let keys = kvlayer_core::item_keys(items);
        self.observe("set_multi", &keys, batch_size(items), || {
            self.inner.set_multi(items, ttl, compress)
        })
    }

    fn delete_multi(&self, keys: &[&str]) -> bool {
        self.observe("delete_multi", keys, 0, || self.inner.delete_multi(keys))
    }

    fn append_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.observe("append_multi", keys, data.len() * keys.len(), || {
            self.inner.append_multi(keys, data)
        })
    }

    fn prepend_multi(&self, keys: &[&str], data: &[u8]) -> bool {
        self.observe("prepend_multi", keys, data.len() * keys.len(), || {
            self.inner.prepend_multi(keys, data)
        })
    }

    fn clear(&self) {
        self.observe("clear", &[], 0, || self.inner.clear())
    }

    fn get_host_by_key(&self, key: &str) -> Option<String> {
        self.inner.get_host_by_key(key)
    }

    fn close(&self) {
        self.observe("close", &[], 0, || self.inner.close())
    }

    fn reset(&self) {
        self.observe("reset", &[], 0, || self.inner.reset())
    }
}
