//! Caches of the enforcement core
//!
//! - [`EntityCache`]: entity references to resolved values (policy ids,
//!   enforcers), loaded asynchronously with at most one load per key
//! - [`ResponseReceiverCache`]: correlation ids to the receiver of a pending
//!   live response, with per-entry expiry

pub mod entity_cache;
pub mod entry;
pub mod response_receiver;
pub mod stats;

pub use entity_cache::{CacheConfig, CacheLoader, EntityCache};
pub use entry::Entry;
pub use response_receiver::{
    ResponseReceiverCache, ResponseReceiverCacheError, ResponseReceiverEntry,
    DEFAULT_FALLBACK_EXPIRY,
};
pub use stats::CacheStats;
