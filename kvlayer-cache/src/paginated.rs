//! Paginated result caching.
//!
//! A paged function takes `start` and `limit` and returns at most `limit`
//! items. Instead of caching every page, the first `count` items are
//! computed once (as `start = 0, limit = count`) and cached under one key;
//! every page inside that window is sliced from it. Pages reaching past
//! `count` are not cacheable and go straight to the function.

use std::fmt;
use std::marker::PhantomData;

use kvlayer_core::{ConfigError, Expiry, KvResult, Payload};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::key::{Args, Bound, KeyGen, KeyPattern, Signature};
use crate::stampede;
use crate::SharedStore;

/// Default number of items cached per paged key.
pub const DEFAULT_COUNT: u32 = 300;

fn register(pattern: KeyPattern, signature: Signature) -> KvResult<KeyGen> {
    let keygen = KeyGen::new(pattern, signature)?;
    if !keygen.signature().has("limit") {
        return Err(ConfigError::MissingLimit {
            function: keygen.signature().function().to_string(),
        }
        .into());
    }
    Ok(keygen)
}

/// The `[start, start + limit)` page, if it lies inside the cached window.
fn page_window(bound: &Bound, count: u32) -> Option<(usize, usize)> {
    let start = match bound.get("start") {
        None => 0,
        Some(value) if value.is_none() => 0,
        Some(value) => usize::try_from(value.as_int()?).ok()?,
    };
    let limit = usize::try_from(bound.int("limit")?).ok()?;
    (start.checked_add(limit)? <= count as usize).then_some((start, limit))
}

fn full_window(bound: &Bound, count: u32) -> Bound {
    bound.with("start", 0).with("limit", count)
}

fn slice<T>(items: Vec<T>, start: usize, limit: usize) -> Vec<T> {
    items.into_iter().skip(start).take(limit).collect()
}

// ============================================================================
// PAGED LIST
// ============================================================================

/// A paged function whose first `count` items are cached.
pub struct Paged<T, F> {
    keygen: KeyGen,
    store: SharedStore,
    count: u32,
    ttl: Expiry,
    max_retry: u32,
    f: F,
    _item: PhantomData<fn() -> T>,
}

/// Register a paged function returning a list.
///
/// Fails unless the signature declares `limit`. Recomputation uses the same
/// stampede protection as [`cache`](crate::cache).
pub fn pcache<T, F>(
    pattern: impl Into<KeyPattern>,
    store: SharedStore,
    signature: Signature,
    count: u32,
    ttl: Expiry,
    max_retry: u32,
    f: F,
) -> KvResult<Paged<T, F>>
where
    T: Serialize + DeserializeOwned,
    F: Fn(&Bound) -> Vec<T>,
{
    Ok(Paged {
        keygen: register(pattern.into(), signature)?,
        store,
        count,
        ttl,
        max_retry,
        f,
        _item: PhantomData,
    })
}

impl<T, F> Paged<T, F>
where
    T: Serialize + DeserializeOwned,
    F: Fn(&Bound) -> Vec<T>,
{
    pub fn with_ttl(mut self, ttl: Expiry) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn key(&self, args: &Args) -> Option<String> {
        self.keygen.derive(args).0
    }

    pub fn call(&self, args: &Args) -> Vec<T> {
        let (key, bound) = self.keygen.derive(args);
        let (Some(key), Some((start, limit))) = (key, page_window(&bound, self.count)) else {
            return (self.f)(&bound);
        };
        let store = self.store.as_ref();

        let mut cached = stampede::lookup::<Vec<T>>(store, &key, args.is_forced());
        let mut holds_mutex = false;
        if cached.is_none() && self.max_retry > 0 {
            let acquired = stampede::acquire_or_wait(store, &key, self.max_retry);
            holds_mutex = acquired.holds_mutex();
            cached = acquired
                .into_value()
                .and_then(|value| stampede::decode(&key, &value));
        }

        let items = match cached {
            Some(payload) => payload.into_option().unwrap_or_default(),
            None => {
                let items = (self.f)(&full_window(&bound, self.count));
                let payload = Payload::Value(items);
                stampede::store_payload(store, &key, &payload, self.ttl);
                if holds_mutex {
                    stampede::release(store, &key);
                }
                payload.into_option().unwrap_or_default()
            }
        };
        slice(items, start, limit)
    }
}

impl<T, F> fmt::Debug for Paged<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Paged")
            .field("keygen", &self.keygen)
            .field("count", &self.count)
            .field("ttl", &self.ttl)
            .field("max_retry", &self.max_retry)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PAGED LIST WITH TOTAL
// ============================================================================

/// A paged function returning `(total, items)`, caching the first `count`
/// items together with the total.
pub struct PagedWithTotal<T, F> {
    keygen: KeyGen,
    store: SharedStore,
    count: u32,
    ttl: Expiry,
    f: F,
    _item: PhantomData<fn() -> T>,
}

/// Register a paged function returning a total alongside its page.
///
/// Unlike [`pcache`] there is no stampede protection.
pub fn pcache2<T, F>(
    pattern: impl Into<KeyPattern>,
    store: SharedStore,
    signature: Signature,
    count: u32,
    ttl: Expiry,
    f: F,
) -> KvResult<PagedWithTotal<T, F>>
where
    T: Serialize + DeserializeOwned,
    F: Fn(&Bound) -> (u64, Vec<T>),
{
    Ok(PagedWithTotal {
        keygen: register(pattern.into(), signature)?,
        store,
        count,
        ttl,
        f,
        _item: PhantomData,
    })
}

impl<T, F> PagedWithTotal<T, F>
where
    T: Serialize + DeserializeOwned,
    F: Fn(&Bound) -> (u64, Vec<T>),
{
    pub fn with_ttl(mut self, ttl: Expiry) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn key(&self, args: &Args) -> Option<String> {
        self.keygen.derive(args).0
    }

    pub fn call(&self, args: &Args) -> (u64, Vec<T>) {
        let (key, bound) = self.keygen.derive(args);
        let (Some(key), Some((start, limit))) = (key, page_window(&bound, self.count)) else {
            return (self.f)(&bound);
        };
        let store = self.store.as_ref();

        let (total, items) = match stampede::lookup::<(u64, Vec<T>)>(store, &key, args.is_forced())
            .and_then(Payload::into_option)
        {
            Some(cached) => cached,
            None => {
                let payload = Payload::Value((self.f)(&full_window(&bound, self.count)));
                stampede::store_payload(store, &key, &payload, self.ttl);
                payload.into_option().unwrap_or_default()
            }
        };
        (total, slice(items, start, limit))
    }
}

impl<T, F> fmt::Debug for PagedWithTotal<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedWithTotal")
            .field("keygen", &self.keygen)
            .field("count", &self.count)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
