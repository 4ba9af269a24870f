//! Fixed-width numeric list caching.
//!
//! Lists of numbers are packed as little-endian fixed-width elements with no
//! framing, and stored uncompressed. Because the encoding is a plain
//! concatenation, items can be appended or prepended on the stored entry
//! without reading it back.
//!
//! The memcached client splits values near 1 MB into several entries, after
//! which append/prepend no longer line up. Blobs at or above
//! [`CHUNK_THRESHOLD`] are therefore treated as suspect and recomputed, as
//! are blobs whose length is not a multiple of the element width.

use std::fmt;
use std::marker::PhantomData;

use kvlayer_core::{Expiry, KvResult, Value};
use tracing::debug;

use crate::key::{Args, Bound, KeyGen, KeyPattern, Signature};
use crate::SharedStore;

/// Blob length from which a cached list is no longer trusted.
pub const CHUNK_THRESHOLD: usize = 1_000_000 - 1_000;

/// Wire format of one list element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementFormat {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl ElementFormat {
    /// Encoded width in bytes.
    pub const fn width(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }
}

/// A number with a fixed-width little-endian encoding.
pub trait FixedWidth: Copy + Send + Sync + 'static {
    const FORMAT: ElementFormat;

    fn write_le(self, out: &mut Vec<u8>);

    /// Decode from exactly `FORMAT.width()` bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_fixed_width {
    ($($t:ty => $format:ident),* $(,)?) => {$(
        impl FixedWidth for $t {
            const FORMAT: ElementFormat = ElementFormat::$format;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }
        }
    )*};
}

impl_fixed_width!(
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
);

/// Pack `items` into a raw value.
pub fn pack<E: FixedWidth>(items: &[E]) -> Value {
    let mut out = Vec::with_capacity(items.len() * E::FORMAT.width());
    for item in items {
        item.write_le(&mut out);
    }
    Value::raw(out)
}

/// Unpack a blob, rejecting lengths that are not a multiple of the width.
pub fn unpack<E: FixedWidth>(bytes: &[u8]) -> Option<Vec<E>> {
    let width = E::FORMAT.width();
    if bytes.len() % width != 0 {
        return None;
    }
    Some(bytes.chunks_exact(width).map(E::read_le).collect())
}

/// A function returning a list of fixed-width numbers, cached packed.
pub struct ListCached<E, F> {
    keygen: KeyGen,
    store: SharedStore,
    ttl: Expiry,
    f: F,
    _element: PhantomData<fn() -> E>,
}

/// Register `f` for packed list caching.
///
/// `f` returns `None` when it has no list to offer; nothing is cached then.
pub fn listcache<E, F>(
    pattern: impl Into<KeyPattern>,
    store: SharedStore,
    signature: Signature,
    ttl: Expiry,
    f: F,
) -> KvResult<ListCached<E, F>>
where
    E: FixedWidth,
    F: Fn(&Bound) -> Option<Vec<E>>,
{
    Ok(ListCached {
        keygen: KeyGen::new(pattern.into(), signature)?,
        store,
        ttl,
        f,
        _element: PhantomData,
    })
}

impl<E, F> ListCached<E, F>
where
    E: FixedWidth,
    F: Fn(&Bound) -> Option<Vec<E>>,
{
    pub fn with_ttl(mut self, ttl: Expiry) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn format(&self) -> ElementFormat {
        E::FORMAT
    }

    pub fn key(&self, args: &Args) -> Option<String> {
        self.keygen.derive(args).0
    }

    pub fn call(&self, args: &Args) -> Option<Vec<E>> {
        let (key, bound) = self.keygen.derive(args);
        let Some(key) = key else {
            return (self.f)(&bound);
        };

        if !args.is_forced() {
            if let Some(items) = self.store.get(&key).and_then(|blob| self.accept(&key, &blob)) {
                return Some(items);
            }
        }

        let items = (self.f)(&bound)?;
        self.store.set(&key, &pack(&items), self.ttl, false);
        Some(items)
    }

    /// Append items to the cached list for `args`. Fails when nothing is
    /// cached; the next call recomputes the whole list anyway.
    pub fn push_back(&self, args: &Args, items: &[E]) -> bool {
        match self.key(args) {
            Some(key) => self.store.append(&key, pack(items).as_bytes()),
            None => false,
        }
    }

    /// Prepend items to the cached list for `args`.
    pub fn push_front(&self, args: &Args, items: &[E]) -> bool {
        match self.key(args) {
            Some(key) => self.store.prepend(&key, pack(items).as_bytes()),
            None => false,
        }
    }

    fn accept(&self, key: &str, blob: &Value) -> Option<Vec<E>> {
        if blob.len() >= CHUNK_THRESHOLD {
            debug!(key = %key, len = blob.len(), "cached list near chunk size, recomputing");
            return None;
        }
        let items = unpack(blob.as_bytes());
        if items.is_none() {
            debug!(
                key = %key,
                len = blob.len(),
                width = E::FORMAT.width(),
                "cached list has a torn element, recomputing"
            );
        }
        items
    }
}

impl<E, F> fmt::Debug for ListCached<E, F>
where
    E: FixedWidth,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListCached")
            .field("keygen", &self.keygen)
            .field("format", &E::FORMAT)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
