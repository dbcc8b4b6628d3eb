//! Key-value store capability
//!
//! The response cache talks to its backing store only through
//! [`KeyValueStore`], so a networked store and the in-process map are
//! interchangeable. Failures are reported, never hidden; the cache decides
//! to absorb them.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Errors raised by a key-value store
#[derive(Error, Debug)]
pub enum CacheError {
    /// The store did not answer within the I/O timeout
    #[error("Cache store timed out after {0:?}")]
    Timeout(Duration),

    /// The store is unreachable or failed the operation
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be decoded
    #[error("Cache entry could not be decoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Minimal string key-value store with per-key TTL
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a live value
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Approximate number of stored keys
    async fn len(&self) -> Result<usize, CacheError>;

    /// Drop expired keys; returns how many were removed
    async fn purge_expired(&self) -> Result<usize, CacheError>;
}

/// Deadline used when `now + ttl` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

struct StoredValue {
    value: String,
    expires_at: Instant,
}

/// In-process store backed by a concurrent map
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let found = self
            .entries
            .get(key)
            .map(|entry| (entry.value.clone(), entry.expires_at));

        match found {
            Some((value, expires_at)) if expires_at > now => Ok(Some(value)),
            Some(_) => {
                // Re-check under the shard lock; a concurrent set may have
                // refreshed the key.
                self.entries.remove_if(key, |_, v| v.expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: deadline_after(ttl),
            },
        );
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.len())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| v.expires_at > now);
        Ok(before.saturating_sub(self.entries.len()))
    }
}
