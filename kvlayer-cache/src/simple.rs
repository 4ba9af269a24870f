//! Read-through caching of a single result.

use std::fmt;
use std::marker::PhantomData;

use kvlayer_core::{Expiry, KvResult, Payload};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::key::{Args, Bound, KeyGen, KeyPattern, Signature};
use crate::stampede;
use crate::SharedStore;

/// A function whose results are cached under a derived key.
///
/// The computation returns `None` for "do not cache", `Some(Payload::Empty)`
/// for a cacheable empty result, and `Some(Payload::Value(_))` otherwise.
/// Callers see both `None` and `Empty` as `None`.
pub struct Cached<T, F> {
    keygen: KeyGen,
    store: SharedStore,
    ttl: Expiry,
    max_retry: u32,
    f: F,
    _result: PhantomData<fn() -> T>,
}

/// Register `f` for read-through caching.
///
/// With `max_retry > 0` concurrent misses on the same key recompute once:
/// the first caller takes the key's mutex, the rest poll for up to
/// `max_retry` intervals of 100 ms.
pub fn cache<T, F>(
    pattern: impl Into<KeyPattern>,
    store: SharedStore,
    signature: Signature,
    ttl: Expiry,
    max_retry: u32,
    f: F,
) -> KvResult<Cached<T, F>>
where
    T: Serialize + DeserializeOwned,
    F: Fn(&Bound) -> Option<Payload<T>>,
{
    Ok(Cached {
        keygen: KeyGen::new(pattern.into(), signature)?,
        store,
        ttl,
        max_retry,
        f,
        _result: PhantomData,
    })
}

impl<T, F> Cached<T, F>
where
    T: Serialize + DeserializeOwned,
    F: Fn(&Bound) -> Option<Payload<T>>,
{
    pub fn with_ttl(mut self, ttl: Expiry) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Key a call with `args` would use, if any.
    pub fn key(&self, args: &Args) -> Option<String> {
        self.keygen.derive(args).0
    }

    /// The uncached computation.
    pub fn original(&self) -> &F {
        &self.f
    }

    pub fn call(&self, args: &Args) -> Option<T> {
        let (key, bound) = self.keygen.derive(args);
        let Some(key) = key else {
            return (self.f)(&bound).and_then(Payload::into_option);
        };
        let store = self.store.as_ref();

        let mut cached = stampede::lookup::<T>(store, &key, args.is_forced());
        let mut holds_mutex = false;
        if cached.is_none() && self.max_retry > 0 {
            let acquired = stampede::acquire_or_wait(store, &key, self.max_retry);
            holds_mutex = acquired.holds_mutex();
            cached = acquired
                .into_value()
                .and_then(|value| stampede::decode(&key, &value));
        }

        let payload = match cached {
            Some(payload) => Some(payload),
            None => {
                let computed = (self.f)(&bound);
                if let Some(payload) = &computed {
                    stampede::store_payload(store, &key, payload, self.ttl);
                }
                if holds_mutex {
                    stampede::release(store, &key);
                }
                computed
            }
        };
        payload.and_then(Payload::into_option)
    }
}

impl<T, F> fmt::Debug for Cached<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cached")
            .field("keygen", &self.keygen)
            .field("ttl", &self.ttl)
            .field("max_retry", &self.max_retry)
            .finish_non_exhaustive()
    }
}
