//! Response cache
//!
//! - [`fingerprint`]: cache key derivation
//! - [`store`]: the key-value capability and its in-process implementation
//! - [`response_cache`]: TTL'd answer cache with hit-rate statistics

pub mod fingerprint;
pub mod response_cache;
pub mod store;

pub use fingerprint::fingerprint;
pub use response_cache::{CacheEntry, CacheLookup, CacheStats, ResponseCache};
pub use store::{CacheError, KeyValueStore, MemoryStore};
