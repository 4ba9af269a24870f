//! kvlayer Core - Store Contract and Values
//!
//! The contract every store and wrapper implements, the value encoding they
//! exchange, and the error taxonomy. All other kvlayer crates depend on this.
//!
//! This crate also ships two complete stores: [`MemoryStore`], an in-process
//! store with memcached semantics, and [`NullStore`], used when caching is
//! switched off.

pub mod error;
pub mod memory;
pub mod null;
pub mod store;
pub mod value;

pub use error::{CodecError, ConfigError, KvError, KvResult};
pub use memory::MemoryStore;
pub use null::NullStore;
pub use store::{item_keys, CasToken, Expiry, KvStore};
pub use value::{Payload, Value, ValueFlags};

// ============================================================================
// RESERVED KEY SUFFIXES
// ============================================================================

/// Suffix of the stampede lock guarding a cache key.
pub const MUTEX_SUFFIX: &str = "#mutex";

/// Suffix of the version marker published by versioned caches.
pub const VERSION_SUFFIX: &str = ":VER2";

/// Prefix of the version-qualified value slot, followed by the version.
pub const VERSIONED_VALUE_INFIX: &str = ":V_";

/// Key of the stampede lock for `key`.
pub fn mutex_key(key: &str) -> String {
    format!("{key}{MUTEX_SUFFIX}")
}

/// Key of the version marker for `key`.
pub fn version_key(key: &str) -> String {
    format!("{key}{VERSION_SUFFIX}")
}

/// Key of the value slot for `key` at `version`.
pub fn versioned_value_key(key: &str, version: &str) -> String {
    format!("{key}{VERSIONED_VALUE_INFIX}{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_keys() {
        assert_eq!(mutex_key("feed:1"), "feed:1#mutex");
        assert_eq!(version_key("feed:1"), "feed:1:VER2");
        assert_eq!(versioned_value_key("feed:1", "abc"), "feed:1:V_abc");
    }
}
