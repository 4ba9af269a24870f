//! Stored values and their encoding.
//!
//! A [`Value`] is what a store holds under a key: an opaque byte string and
//! a [`ValueFlags`] bitset saying how those bytes were produced. The flags
//! travel with the bytes so any process can decode an entry written by any
//! other process.
//!
//! | Encoding | Flags | Bytes |
//! |---|---|---|
//! | raw | none | as given, appendable |
//! | integer | `INTEGER` | ASCII decimal, incr/decr-able |
//! | serialized | `SERIALIZED` | JSON |
//! | empty marker | `EMPTY` | none |

use bitflags::bitflags;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CodecError;

/// Number of digest bytes kept in a [`Value::version`] string.
const VERSION_DIGEST_BYTES: usize = 16;

bitflags! {
    /// Encoding flags stored alongside a value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ValueFlags: u32 {
        /// Bytes are a JSON document
        const SERIALIZED = 0b0000_0001;
        /// Bytes are an unsigned ASCII decimal
        const INTEGER = 0b0000_0010;
        /// Entry caches a legitimately empty result
        const EMPTY = 0b0001_0000;
    }
}

/// A value as held by a key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Value {
    data: Vec<u8>,
    flags: ValueFlags,
}

impl Value {
    /// Rebuild a value from its stored parts.
    pub fn from_parts(data: Vec<u8>, flags: ValueFlags) -> Self {
        Self { data, flags }
    }

    /// Raw bytes, stored verbatim. Only raw values are meaningful targets
    /// for append/prepend.
    pub fn raw(data: impl Into<Vec<u8>>) -> Self {
        Self::from_parts(data.into(), ValueFlags::empty())
    }

    /// An integer counter, stored the way memcached stores incr/decr targets.
    pub fn int(n: u64) -> Self {
        Self::from_parts(n.to_string().into_bytes(), ValueFlags::INTEGER)
    }

    /// The marker cached in place of a computation that legitimately
    /// produced nothing.
    pub fn empty_marker() -> Self {
        Self::from_parts(Vec::new(), ValueFlags::EMPTY)
    }

    /// Serialize any value as JSON.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        let data = serde_json::to_vec(value).map_err(|e| CodecError::Serialize {
            reason: e.to_string(),
        })?;
        Ok(Self::from_parts(data, ValueFlags::SERIALIZED))
    }

    /// Deserialize a value written by [`Value::encode`] or [`Value::int`].
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        if !self
            .flags
            .intersects(ValueFlags::SERIALIZED | ValueFlags::INTEGER)
        {
            return Err(CodecError::UnexpectedEncoding {
                expected: "serialized",
                flags: self.flags.bits(),
            });
        }
        serde_json::from_slice(&self.data).map_err(|e| CodecError::Deserialize {
            reason: e.to_string(),
        })
    }

    /// Parse an integer counter. Returns `None` for anything that is not a
    /// plain ASCII decimal.
    pub fn as_int(&self) -> Option<u64> {
        std::str::from_utf8(&self.data).ok()?.trim().parse().ok()
    }

    pub fn is_empty_marker(&self) -> bool {
        self.flags.contains(ValueFlags::EMPTY)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn flags(&self) -> ValueFlags {
        self.flags
    }

    /// Size of the stored bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Content version of this value.
    ///
    /// Digest over the canonical stored form (flag bits, big-endian, then
    /// the bytes), so two processes holding equal values always agree on the
    /// version. Truncated SHA-256, lowercase hex.
    pub fn version(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.flags.bits().to_be_bytes());
        hasher.update(&self.data);
        let digest = hasher.finalize();
        hex::encode(&digest[..VERSION_DIGEST_BYTES])
    }

    /// Append bytes in place.
    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Prepend bytes in place.
    pub fn prepend(&mut self, data: &[u8]) {
        let mut joined = Vec::with_capacity(data.len() + self.data.len());
        joined.extend_from_slice(data);
        joined.append(&mut self.data);
        self.data = joined;
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::raw(s.as_bytes())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::raw(s.into_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(data: Vec<u8>) -> Self {
        Self::raw(data)
    }
}

// ============================================================================
// PAYLOAD (cached computation results)
// ============================================================================

/// Result of a cacheable computation.
///
/// `Empty` is cached like any other result, so a computation that
/// legitimately found nothing is not re-run on the next call. A caller of a
/// cached function sees `Empty` as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<T> {
    Value(T),
    Empty,
}

impl<T> Payload<T> {
    /// `None` maps to `Empty`: the result is known to be absent.
    pub fn from_option(v: Option<T>) -> Self {
        match v {
            Some(v) => Self::Value(v),
            None => Self::Empty,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Empty => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl<T: Serialize> Payload<T> {
    /// Encode for storage; `Empty` becomes the empty marker.
    pub fn to_value(&self) -> Result<Value, CodecError> {
        match self {
            Self::Value(v) => Value::encode(v),
            Self::Empty => Ok(Value::empty_marker()),
        }
    }
}

impl<T: DeserializeOwned> Payload<T> {
    /// Decode a stored entry; the empty marker becomes `Empty`.
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        if value.is_empty_marker() {
            return Ok(Self::Empty);
        }
        value.decode().map(Self::Value)
    }
}

impl<T> From<T> for Payload<T> {
    fn from(v: T) -> Self {
        Self::Value(v)
    }
}
