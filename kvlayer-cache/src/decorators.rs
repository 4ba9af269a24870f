//! Combinators bound to one store.

use kvlayer_core::{Expiry, KvResult, Payload};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::attr::{cache_in_obj, AttrCell, CacheObject, ObjectCache};
use crate::invalidate::{delete_cache, Invalidating};
use crate::key::{Bound, KeyPattern, Signature};
use crate::list::{listcache, FixedWidth, ListCached};
use crate::paginated::{pcache, pcache2, Paged, PagedWithTotal, DEFAULT_COUNT};
use crate::simple::{cache, Cached};
use crate::SharedStore;

/// Factory producing every combinator against the same store, with the
/// usual defaults: no expiry, no stampede protection, pages of
/// [`DEFAULT_COUNT`] items. Adjust per registration with the returned
/// wrapper's `with_*` methods.
///
/// ```
/// use std::sync::Arc;
/// use kvlayer_cache::{Args, Decorators, Signature};
/// use kvlayer_core::{MemoryStore, Payload};
///
/// let mc = Decorators::new(Arc::new(MemoryStore::new()));
/// let name = mc
///     .cache("user:{0}:name", Signature::new("user_name", ["id"]), |b| {
///         Some(Payload::Value(format!("user {}", b.int("id")?)))
///     })
///     .unwrap()
///     .with_ttl(60);
/// assert_eq!(name.call(&Args::new().push(1)).as_deref(), Some("user 1"));
/// ```
#[derive(Clone)]
pub struct Decorators {
    store: SharedStore,
}

impl Decorators {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn cache<T, F>(
        &self,
        pattern: impl Into<KeyPattern>,
        signature: Signature,
        f: F,
    ) -> KvResult<Cached<T, F>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&Bound) -> Option<Payload<T>>,
    {
        cache(pattern, self.store.clone(), signature, 0, 0, f)
    }

    pub fn pcache<T, F>(
        &self,
        pattern: impl Into<KeyPattern>,
        signature: Signature,
        f: F,
    ) -> KvResult<Paged<T, F>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&Bound) -> Vec<T>,
    {
        pcache(pattern, self.store.clone(), signature, DEFAULT_COUNT, 0, 0, f)
    }

    /// Like [`Decorators::pcache`] with a page window other than the default.
    pub fn pcache_with_count<T, F>(
        &self,
        pattern: impl Into<KeyPattern>,
        signature: Signature,
        count: u32,
        f: F,
    ) -> KvResult<Paged<T, F>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&Bound) -> Vec<T>,
    {
        pcache(pattern, self.store.clone(), signature, count, 0, 0, f)
    }

    pub fn pcache2<T, F>(
        &self,
        pattern: impl Into<KeyPattern>,
        signature: Signature,
        f: F,
    ) -> KvResult<PagedWithTotal<T, F>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&Bound) -> (u64, Vec<T>),
    {
        pcache2(pattern, self.store.clone(), signature, DEFAULT_COUNT, 0, f)
    }

    /// Packed list cache; the element type picks the format, `u32` by
    /// convention.
    pub fn listcache<E, F>(
        &self,
        pattern: impl Into<KeyPattern>,
        signature: Signature,
        f: F,
    ) -> KvResult<ListCached<E, F>>
    where
        E: FixedWidth,
        F: Fn(&Bound) -> Option<Vec<E>>,
    {
        listcache(pattern, self.store.clone(), signature, 0, f)
    }

    pub fn delete_cache<R, F>(
        &self,
        pattern: impl Into<KeyPattern>,
        signature: Signature,
        f: F,
    ) -> KvResult<Invalidating<F>>
    where
        F: Fn(&Bound) -> R,
    {
        delete_cache(pattern, self.store.clone(), signature, f)
    }

    pub fn cache_in_obj<O, V, F>(
        &self,
        pattern: impl Into<String>,
        cell: fn(&O) -> &AttrCell<V>,
        f: F,
    ) -> KvResult<ObjectCache<O, V, F>>
    where
        O: CacheObject,
        V: Clone,
        F: Fn(&O) -> Option<V>,
    {
        cache_in_obj(pattern, self.store.clone(), 0, cell, f)
    }

    /// Cache with explicit expiry and retry budget.
    pub fn cache_with<T, F>(
        &self,
        pattern: impl Into<KeyPattern>,
        signature: Signature,
        ttl: Expiry,
        max_retry: u32,
        f: F,
    ) -> KvResult<Cached<T, F>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&Bound) -> Option<Payload<T>>,
    {
        cache(pattern, self.store.clone(), signature, ttl, max_retry, f)
    }
}

impl std::fmt::Debug for Decorators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decorators").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Args;
    use kvlayer_core::{KvStore, MemoryStore};
    use std::sync::Arc;

    #[test]
    fn test_defaults() {
        let store = Arc::new(MemoryStore::new());
        let mc = Decorators::new(store.clone());

        let cached = mc
            .cache("c:{0}", Signature::new("c", ["id"]), |_| Some(Payload::Value(1u8)))
            .unwrap();
        cached.call(&Args::new().push(1));
        assert_eq!(store.ttl_of("c:1"), Some(None));
        assert!(!store.contains("c:1#mutex"));

        let paged = mc
            .pcache("p:{0}", Signature::new("p", ["id", "limit"]), |_| vec![0u8; 400])
            .unwrap();
        assert_eq!(paged.count(), DEFAULT_COUNT);
        assert_eq!(paged.call(&Args::new().push(1).push(10)).len(), 10);
        let cached_len = store
            .get("p:1")
            .unwrap()
            .decode::<Vec<u8>>()
            .unwrap()
            .len();
        assert_eq!(cached_len, 400);

        let list = mc
            .listcache("l:{0}", Signature::new("l", ["id"]), |_| Some(vec![5u32]))
            .unwrap();
        assert_eq!(list.call(&Args::new().push(1)), Some(vec![5]));
        assert_eq!(store.get("l:1").unwrap().len(), 4);
    }

    #[test]
    fn test_registration_errors_surface() {
        let mc = Decorators::new(Arc::new(MemoryStore::new()));
        assert!(mc
            .pcache("p:{0}", Signature::new("p", ["id"]), |_| Vec::<u8>::new())
            .is_err());
        assert!(mc
            .cache(
                "c:{0}",
                Signature::new("c", ["id"]).variadic(),
                |_| Some(Payload::Value(1u8))
            )
            .is_err());
    }
}
