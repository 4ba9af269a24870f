//! The caching protocol running on top of topology chains.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use kvlayer_cache::{Args, Bound, Decorators, SharedStore, Signature};
use kvlayer_core::{KvStore, MemoryStore, Payload};
use kvlayer_test_utils::FailingStore;
use kvlayer_topology::{LocalCache, ReplicatedStore, VersionedLocalCache};
use proptest::prelude::*;

/// Several processes, each with its own local cache over one shared store,
/// still recompute a missing key once.
#[test]
fn stampede_protection_spans_processes() {
    const PROCESSES: usize = 6;
    let shared = Arc::new(MemoryStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Barrier::new(PROCESSES);

    let results: Vec<Option<u64>> = thread::scope(|s| {
        let handles: Vec<_> = (0..PROCESSES)
            .map(|_| {
                let chain: SharedStore = Arc::new(LocalCache::new(Arc::clone(&shared)));
                let calls = Arc::clone(&calls);
                let barrier = &barrier;
                s.spawn(move || {
                    let mc = Decorators::new(chain);
                    let score = mc
                        .cache_with("score:{0}", Signature::new("score", ["id"]), 0, 20, |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(250));
                            Some(Payload::Value(99u64))
                        })
                        .unwrap();
                    barrier.wait();
                    score.call(&Args::new().push(5))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| *r == Some(99)));
}

#[test]
fn empty_marker_survives_versioned_chain() {
    let chain: SharedStore = Arc::new(VersionedLocalCache::new(MemoryStore::new()));
    let calls = AtomicUsize::new(0);
    let mc = Decorators::new(chain);
    let lookup = mc
        .cache("nick:{0}", Signature::new("nick", ["id"]), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Some(Payload::<String>::Empty)
        })
        .unwrap();

    assert_eq!(lookup.call(&Args::new().push(1)), None);
    assert_eq!(lookup.call(&Args::new().push(1)), None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn replica_keeps_serving_cached_results() {
    let replica = Arc::new(MemoryStore::new());
    let healthy: SharedStore = Arc::new(ReplicatedStore::new(
        MemoryStore::new(),
        Arc::clone(&replica),
    ));
    let degraded: SharedStore = Arc::new(ReplicatedStore::new(
        FailingStore::new(),
        Arc::clone(&replica),
    ));
    let calls = AtomicUsize::new(0);
    let compute = |_: &Bound| {
        calls.fetch_add(1, Ordering::SeqCst);
        Some(Payload::Value("fresh".to_string()))
    };

    let sig = Signature::new("status", ["id"]);
    Decorators::new(healthy)
        .cache_with("status:{0}", sig.clone(), 600, 0, compute)
        .unwrap()
        .call(&Args::new().push(1));
    let served = Decorators::new(degraded)
        .cache_with("status:{0}", sig, 600, 0, compute)
        .unwrap()
        .call(&Args::new().push(1));

    assert_eq!(served.as_deref(), Some("fresh"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(replica.contains("status:1"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Any page inside the window equals the page the function would return.
    #[test]
    fn prop_cached_pages_match_direct_pages(start in 0u32..40, limit in 0u32..40) {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let direct = |b: &Bound| -> Vec<i64> {
            let start = b.int("start").unwrap_or(0);
            let limit = b.int("limit").unwrap_or(0);
            (start..(start + limit).min(25)).collect()
        };
        let paged = Decorators::new(store)
            .pcache_with_count(
                "items",
                Signature::new("items", ["start", "limit"]).with_default("start", 0),
                40,
                direct,
            )
            .unwrap();

        // Warm the cache with a different page first.
        paged.call(&Args::new().arg("limit", 1));
        let args = Args::new().arg("start", start).arg("limit", limit);
        let bound = Signature::new("items", ["start", "limit"]).bind(&args);
        prop_assert_eq!(paged.call(&args), direct(&bound));
    }
}
