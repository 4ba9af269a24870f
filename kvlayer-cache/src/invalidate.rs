//! Invalidate a cache key after a mutating call.

use std::fmt;

use kvlayer_core::KvResult;

use crate::key::{Args, Bound, KeyGen, KeyPattern, Signature};
use crate::SharedStore;

/// A mutating function that deletes its derived key after every call.
pub struct Invalidating<F> {
    keygen: KeyGen,
    store: SharedStore,
    f: F,
}

/// Register `f` so that each call deletes the key derived from its
/// arguments once `f` returns. The key is deleted whatever `f` returned.
pub fn delete_cache<R, F>(
    pattern: impl Into<KeyPattern>,
    store: SharedStore,
    signature: Signature,
    f: F,
) -> KvResult<Invalidating<F>>
where
    F: Fn(&Bound) -> R,
{
    Ok(Invalidating {
        keygen: KeyGen::new(pattern.into(), signature)?,
        store,
        f,
    })
}

impl<F> Invalidating<F> {
    pub fn key(&self, args: &Args) -> Option<String> {
        self.keygen.derive(args).0
    }

    pub fn call<R>(&self, args: &Args) -> R
    where
        F: Fn(&Bound) -> R,
    {
        let (key, bound) = self.keygen.derive(args);
        let result = (self.f)(&bound);
        if let Some(key) = key {
            self.store.delete(&key);
        }
        result
    }
}

impl<F> fmt::Debug for Invalidating<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invalidating")
            .field("keygen", &self.keygen)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache;
    use kvlayer_core::{KvStore, MemoryStore, Payload, Value};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_write_then_delete() {
        let store = Arc::new(MemoryStore::new());
        let name = Arc::new(std::sync::Mutex::new("ada".to_string()));
        let sig = Signature::new("profile", ["user_id"]);

        let read_name = Arc::clone(&name);
        let profile = cache("p:{user_id}", store.clone(), sig.clone(), 0, 0, move |_| {
            Some(Payload::Value(read_name.lock().unwrap().clone()))
        })
        .unwrap();
        let write_name = Arc::clone(&name);
        let rename = delete_cache("p:{user_id}", store.clone(), sig, move |_| {
            *write_name.lock().unwrap() = "grace".to_string();
            true
        })
        .unwrap();

        let args = Args::new().push(1);
        assert_eq!(profile.call(&args).as_deref(), Some("ada"));
        assert!(rename.call(&args));
        assert!(!store.contains("p:1"));
        assert_eq!(profile.call(&args).as_deref(), Some("grace"));
    }

    #[test]
    fn test_empty_key_skips_delete() {
        let store = Arc::new(MemoryStore::new());
        store.set("p:", &Value::raw("x"), 0, true);
        let counter = AtomicU64::new(0);
        let bump = delete_cache(
            KeyPattern::func(|_| None),
            store.clone(),
            Signature::new("bump", ["user_id"]),
            |_| counter.fetch_add(1, Ordering::SeqCst),
        )
        .unwrap();

        assert_eq!(bump.call(&Args::new().push(1)), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(store.contains("p:"));
    }
}
