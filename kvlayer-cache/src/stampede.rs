//! Stampede protection shared by the read-through combinators.
//!
//! On a miss, callers race to `add` the key's mutex entry. The winner
//! recomputes; everyone else polls the key every [`POLL_INTERVAL`] until the
//! winner fills it or the retry budget runs out, after which they recompute
//! anyway. A holder that dies leaves its mutex to expire by TTL.

use std::thread;
use std::time::Duration;

use kvlayer_core::{mutex_key, Expiry, KvStore, Payload, Value};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Pause between polls while another caller holds the mutex.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Mutex TTL for a retry budget: one tenth of it in seconds, at least one.
pub fn lock_ttl(max_retry: u32) -> Expiry {
    (max_retry / 10).max(1)
}

/// Outcome of [`acquire_or_wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    /// Another caller filled the key while we polled.
    Filled(Value),
    /// We hold the mutex: recompute, store, then [`release`].
    Held,
    /// The budget ran out with someone else holding the mutex. Recompute,
    /// but leave their mutex alone.
    TimedOut,
}

impl Acquired {
    /// Whether the caller owns the mutex and must release it.
    pub fn holds_mutex(&self) -> bool {
        matches!(self, Acquired::Held)
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Acquired::Filled(value) => Some(value),
            Acquired::Held | Acquired::TimedOut => None,
        }
    }
}

/// Wait for a concurrent fill or take the mutex.
pub fn acquire_or_wait(store: &dyn KvStore, key: &str, max_retry: u32) -> Acquired {
    let mutex = mutex_key(key);
    let marker = Value::int(1);
    for attempt in 0..max_retry {
        // add() also fails when the node is down; we then poll until the
        // budget runs out and recompute.
        if store.add(&mutex, &marker, lock_ttl(max_retry)) {
            // The previous holder may have filled and released between our
            // last poll and the add.
            if attempt > 0 {
                if let Some(value) = store.get(key) {
                    release(store, key);
                    return Acquired::Filled(value);
                }
            }
            return Acquired::Held;
        }
        debug!(key = %key, "waiting for concurrent recompute");
        thread::sleep(POLL_INTERVAL);
        if let Some(value) = store.get(key) {
            return Acquired::Filled(value);
        }
    }
    debug!(key = %key, max_retry, "stampede wait exhausted, recomputing without the mutex");
    Acquired::TimedOut
}

/// Release the mutex taken by [`acquire_or_wait`]. Only call this after
/// [`Acquired::Held`].
pub fn release(store: &dyn KvStore, key: &str) {
    store.delete(&mutex_key(key));
}

/// Decode a cached entry. An entry that does not decode counts as a miss.
pub fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Option<Payload<T>> {
    match Payload::from_value(value) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(key = %key, error = %e, "discarding undecodable cache entry");
            None
        }
    }
}

/// Read and decode `key`, unless the call is forced.
pub fn lookup<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
    force: bool,
) -> Option<Payload<T>> {
    if force {
        return None;
    }
    store.get(key).and_then(|value| decode(key, &value))
}

/// Encode and store a computed result. Encoding failures skip the write.
pub fn store_payload<T: serde::Serialize>(
    store: &dyn KvStore,
    key: &str,
    payload: &Payload<T>,
    ttl: Expiry,
) -> bool {
    match payload.to_value() {
        Ok(value) => store.set(key, &value, ttl, true),
        Err(e) => {
            warn!(key = %key, error = %e, "computed result cannot be cached");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlayer_core::MemoryStore;

    #[test]
    fn test_lock_ttl_floor() {
        assert_eq!(lock_ttl(1), 1);
        assert_eq!(lock_ttl(9), 1);
        assert_eq!(lock_ttl(10), 1);
        assert_eq!(lock_ttl(35), 3);
    }

    #[test]
    fn test_first_caller_takes_mutex() {
        let store = MemoryStore::new();
        let acquired = acquire_or_wait(&store, "k", 3);
        assert_eq!(acquired, Acquired::Held);
        assert!(acquired.holds_mutex());
        assert!(store.contains("k#mutex"));
        release(&store, "k");
        assert!(!store.contains("k#mutex"));
    }

    #[test]
    fn test_waiter_sees_fill() {
        let store = MemoryStore::new();
        store.add("k#mutex", &Value::int(1), 10);
        store.set("k", &Value::raw("filled"), 0, true);
        let acquired = acquire_or_wait(&store, "k", 3);
        assert!(!acquired.holds_mutex());
        assert_eq!(acquired.into_value(), Some(Value::raw("filled")));
    }

    #[test]
    fn test_exhausted_wait_does_not_own_mutex() {
        let store = MemoryStore::new();
        store.add("k#mutex", &Value::int(1), 10);
        let acquired = acquire_or_wait(&store, "k", 1);
        assert_eq!(acquired, Acquired::TimedOut);
        assert!(!acquired.holds_mutex());
        assert!(store.contains("k#mutex"));
    }

    #[test]
    fn test_undecodable_entry_is_a_miss() {
        let store = MemoryStore::new();
        store.set("k", &Value::raw("not json"), 0, true);
        assert_eq!(lookup::<u32>(&store, "k", false), None);
    }
}
