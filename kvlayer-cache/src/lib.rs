//! kvlayer Cache - Read-Through Caching Combinators
//!
//! Wraps expensive computations so their results are cached under keys
//! derived from the call's arguments:
//!
//! | Combinator | Caches |
//! |---|---|
//! | [`cache`] | a single result, optionally with stampede protection |
//! | [`pcache`] | the first `count` items of a paged list |
//! | [`pcache2`] | the same, together with the total item count |
//! | [`listcache`] | a list of fixed-width numbers, packed for append/prepend |
//! | [`delete_cache`] | nothing: deletes the key after a mutating call |
//! | [`cache_in_obj`] | an attribute memoized on an object |
//!
//! Every combinator fails open: when the store is unreachable, reads miss
//! and the computation runs directly. Registration errors (variadic
//! functions, unknown placeholders, paged functions without `limit`) are
//! returned immediately as [`kvlayer_core::ConfigError`]s.

use std::sync::Arc;

use kvlayer_core::KvStore;

pub mod attr;
pub mod decorators;
pub mod invalidate;
pub mod key;
pub mod list;
pub mod paginated;
pub mod simple;
pub mod stampede;

pub use attr::{cache_in_obj, AttrCell, CacheObject, ObjectCache, ID_PLACEHOLDER};
pub use decorators::Decorators;
pub use invalidate::{delete_cache, Invalidating};
pub use key::{ArgValue, Args, Bound, KeyGen, KeyPattern, Param, Signature};
pub use list::{listcache, pack, unpack, ElementFormat, FixedWidth, ListCached, CHUNK_THRESHOLD};
pub use paginated::{pcache, pcache2, Paged, PagedWithTotal, DEFAULT_COUNT};
pub use simple::{cache, Cached};

/// Store handle shared by registered functions.
pub type SharedStore = Arc<dyn KvStore>;
