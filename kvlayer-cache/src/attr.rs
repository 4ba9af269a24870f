//! Memoizing a computed attribute on an object.
//!
//! An object carries an [`AttrCell`] per cached attribute. The first
//! computation of a non-`None` value fills the cell, and the whole object
//! (cell included) is written to the store under the object's key, so other
//! processes loading the object from the cache get the attribute for free.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{PoisonError, RwLock};

use kvlayer_core::{ConfigError, Expiry, KvResult, Value};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

use crate::SharedStore;

/// Placeholder for the object identifier in an object key pattern.
pub const ID_PLACEHOLDER: &str = "{id}";

/// An object that can be mirrored to the store.
pub trait CacheObject: Serialize {
    /// Identifier substituted into the object key pattern.
    fn cache_id(&self) -> String;
}

/// Memoized attribute slot. Serializes as its current value, so it travels
/// with the object.
pub struct AttrCell<V> {
    slot: RwLock<Option<V>>,
}

impl<V> AttrCell<V> {
    pub const fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    pub fn set(&self, value: V) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    pub fn clear(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_set(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl<V: Clone> AttrCell<V> {
    pub fn get(&self) -> Option<V> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<V> Default for AttrCell<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> Clone for AttrCell<V> {
    fn clone(&self) -> Self {
        Self {
            slot: RwLock::new(self.get()),
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for AttrCell<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_tuple("AttrCell").field(&*slot).finish()
    }
}

impl<V: Serialize> Serialize for AttrCell<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .serialize(serializer)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for AttrCell<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self {
            slot: RwLock::new(Option::deserialize(deserializer)?),
        })
    }
}

/// A computed attribute memoized on the object and mirrored to the store.
pub struct ObjectCache<O, V, F> {
    pattern: String,
    store: SharedStore,
    ttl: Expiry,
    cell: fn(&O) -> &AttrCell<V>,
    f: F,
    _object: PhantomData<fn(&O) -> V>,
}

/// Register an attribute computation.
///
/// `pattern` must contain `{id}`, replaced by [`CacheObject::cache_id`] to
/// form the key the object is mirrored under. `cell` selects the object's
/// slot for this attribute.
pub fn cache_in_obj<O, V, F>(
    pattern: impl Into<String>,
    store: SharedStore,
    ttl: Expiry,
    cell: fn(&O) -> &AttrCell<V>,
    f: F,
) -> KvResult<ObjectCache<O, V, F>>
where
    O: CacheObject,
    V: Clone,
    F: Fn(&O) -> Option<V>,
{
    let pattern = pattern.into();
    if !pattern.contains(ID_PLACEHOLDER) {
        return Err(ConfigError::InvalidPattern {
            pattern,
            reason: format!("object key pattern must contain {ID_PLACEHOLDER}"),
        }
        .into());
    }
    Ok(ObjectCache {
        pattern,
        store,
        ttl,
        cell,
        f,
        _object: PhantomData,
    })
}

impl<O, V, F> ObjectCache<O, V, F>
where
    O: CacheObject,
    V: Clone,
    F: Fn(&O) -> Option<V>,
{
    pub fn with_ttl(mut self, ttl: Expiry) -> Self {
        self.ttl = ttl;
        self
    }

    /// Key the object is mirrored under.
    pub fn object_key(&self, obj: &O) -> String {
        self.pattern.replace(ID_PLACEHOLDER, &obj.cache_id())
    }

    /// Return the memoized attribute, computing it on first use or when
    /// `force` is set.
    pub fn call(&self, obj: &O, force: bool) -> Option<V> {
        let cell = (self.cell)(obj);
        if !force {
            if let Some(value) = cell.get() {
                return Some(value);
            }
        }

        let value = (self.f)(obj)?;
        cell.set(value.clone());
        let key = self.object_key(obj);
        match Value::encode(obj) {
            Ok(encoded) => {
                self.store.set(&key, &encoded, self.ttl, true);
            }
            Err(e) => warn!(key = %key, error = %e, "object cannot be mirrored to cache"),
        }
        Some(value)
    }
}

impl<O, V, F> fmt::Debug for ObjectCache<O, V, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("pattern", &self.pattern)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlayer_core::{KvError, KvStore, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize)]
    struct Album {
        id: u64,
        title: String,
        #[serde(default)]
        photo_count: AttrCell<u32>,
    }

    impl CacheObject for Album {
        fn cache_id(&self) -> String {
            self.id.to_string()
        }
    }

    fn photo_count(album: &Album) -> &AttrCell<u32> {
        &album.photo_count
    }

    fn album() -> Album {
        Album {
            id: 7,
            title: "summer".to_string(),
            photo_count: AttrCell::new(),
        }
    }

    #[test]
    fn test_memoized_on_object_and_mirrored() {
        let store = Arc::new(MemoryStore::new());
        let calls = AtomicUsize::new(0);
        let count = cache_in_obj("album:{id}", store.clone(), 0, photo_count, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Some(12)
        })
        .unwrap();

        let album = album();
        assert_eq!(count.call(&album, false), Some(12));
        assert_eq!(count.call(&album, false), Some(12));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mirrored: Album = store.get("album:7").unwrap().decode().unwrap();
        assert_eq!(mirrored.title, "summer");
        assert_eq!(mirrored.photo_count.get(), Some(12));
    }

    #[test]
    fn test_force_recomputes() {
        let store = Arc::new(MemoryStore::new());
        let calls = AtomicUsize::new(0);
        let count = cache_in_obj("album:{id}", store.clone(), 0, photo_count, |_| {
            Some(calls.fetch_add(1, Ordering::SeqCst) as u32)
        })
        .unwrap();

        let album = album();
        assert_eq!(count.call(&album, false), Some(0));
        assert_eq!(count.call(&album, true), Some(1));
        assert_eq!(album.photo_count.get(), Some(1));
    }

    #[test]
    fn test_none_leaves_cell_and_store_untouched() {
        let store = Arc::new(MemoryStore::new());
        let count = cache_in_obj("album:{id}", store.clone(), 0, photo_count, |_| {
            None
        })
        .unwrap();

        let album = album();
        assert_eq!(count.call(&album, false), None);
        assert!(!album.photo_count.is_set());
        assert!(store.is_empty());
    }

    #[test]
    fn test_pattern_requires_id() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let err = cache_in_obj("album", store, 0, photo_count, |_| Some(1))
            .unwrap_err();
        assert!(matches!(err, KvError::Config(ConfigError::InvalidPattern { .. })));
    }
}
