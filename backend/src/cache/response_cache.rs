//! Response cache
//!
//! Content-addressable store of prior assistant answers. Keys are
//! fingerprints of (normalized content, canonical context); one fingerprint
//! maps to one live entry and writes replace it. Every store error, timeout,
//! or undecodable entry is logged and treated as a miss.
//!
//! Lookups never write to the store. Hit counts live in process, keyed by
//! fingerprint and the entry's `created_at`, so a replaced entry starts
//! counting from zero.

use crate::cache::fingerprint::{fingerprint, normalize_content};
use crate::cache::store::{CacheError, KeyValueStore};
use crate::chat::models::{ClientContext, TokenUsage};
use crate::config::CacheConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A cached assistant answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key the entry is stored under
    pub fingerprint: String,
    /// Cached answer
    pub response: String,
    /// Tokens the original generation used
    pub token_usage: TokenUsage,
    /// Number of times the entry has been served
    pub hit_count: u64,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
    /// When the entry stops being served
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// A live entry was found (its hit count already incremented)
    Hit(CacheEntry),
    /// No usable entry
    Miss,
    /// The cache was not consulted (disabled, or content too short)
    Bypassed,
}

/// Cache counters
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Lookups that returned an entry
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 when there were no lookups
    pub hit_rate: f64,
    /// Approximate number of stored entries
    pub entries: usize,
    /// Store failures absorbed so far
    pub store_errors: u64,
    /// Whether the cache is currently consulted
    pub enabled: bool,
}

/// Longest lifetime an entry is given, whatever the configured TTL
const MAX_ENTRY_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Hits served from one generation of an entry
#[derive(Debug, Clone, Copy)]
struct HitCounter {
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    hits: u64,
}

/// Shared response cache
pub struct ResponseCache {
    store: Arc<dyn KeyValueStore>,
    hit_counts: DashMap<String, HitCounter>,
    enabled: AtomicBool,
    ttl: Duration,
    min_content_len: usize,
    io_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    store_errors: AtomicU64,
}

impl ResponseCache {
    /// Create a cache over `store`
    pub fn new(store: Arc<dyn KeyValueStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            hit_counts: DashMap::new(),
            enabled: AtomicBool::new(config.enabled),
            ttl: config.ttl(),
            min_content_len: config.min_content_len,
            io_timeout: config.io_timeout(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
        }
    }

    /// Turn the cache on or off at runtime
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether the cache is consulted
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn should_bypass(&self, content: &str) -> bool {
        !self.is_enabled() || normalize_content(content).chars().count() < self.min_content_len
    }

    /// Run one store call under the I/O timeout
    async fn guarded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        let result = match tokio::time::timeout(self.io_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.io_timeout)),
        };
        if let Err(e) = &result {
            self.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(operation = op, error = %e, "Cache store call failed, continuing without cache");
        }
        result
    }

    /// Look up a previous answer for (content, context)
    pub async fn lookup(&self, content: &str, context: &ClientContext) -> CacheLookup {
        if self.should_bypass(content) {
            return CacheLookup::Bypassed;
        }

        let key = fingerprint(content, context);
        let raw = match self.guarded("get", self.store.get(&key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) | Err(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Miss;
            }
        };

        let mut entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(fingerprint = %key, error = %e, "Discarding undecodable cache entry");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Miss;
            }
        };

        if entry.expires_at <= Utc::now() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return CacheLookup::Miss;
        }

        entry.hit_count = self.count_hit(&key, &entry);
        self.hits.fetch_add(1, Ordering::Relaxed);

        debug!(fingerprint = %key, hit_count = entry.hit_count, "Cache hit");
        CacheLookup::Hit(entry)
    }

    /// Count one hit on `entry` and return its running total
    ///
    /// A read that raced a newer write reports a count for the entry it read
    /// and leaves the newer entry's counter alone.
    fn count_hit(&self, key: &str, entry: &CacheEntry) -> u64 {
        let fresh = HitCounter {
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            hits: 0,
        };
        let mut counter = self.hit_counts.entry(key.to_string()).or_insert(fresh);
        if counter.created_at == entry.created_at {
            counter.hits += 1;
            counter.hits
        } else if counter.created_at < entry.created_at {
            *counter = HitCounter { hits: 1, ..fresh };
            1
        } else {
            entry.hit_count + 1
        }
    }

    /// Store an answer for (content, context); returns whether it was written
    pub async fn store(
        &self,
        content: &str,
        context: &ClientContext,
        response: &str,
        token_usage: TokenUsage,
    ) -> bool {
        if self.should_bypass(content) || response.trim().is_empty() {
            return false;
        }

        let key = fingerprint(content, context);
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(self.ttl.min(MAX_ENTRY_TTL))
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(now);
        let entry = CacheEntry {
            fingerprint: key.clone(),
            response: response.to_string(),
            token_usage,
            hit_count: 0,
            created_at: now,
            expires_at,
        };

        let serialized = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to serialize cache entry");
                return false;
            }
        };

        let written = self
            .guarded("set", self.store.set(&key, serialized, self.ttl.min(MAX_ENTRY_TTL)))
            .await
            .is_ok();
        if written {
            self.hit_counts.insert(
                key.clone(),
                HitCounter {
                    created_at: now,
                    expires_at,
                    hits: 0,
                },
            );
            debug!(fingerprint = %key, ttl_secs = self.ttl.as_secs(), "Cached response");
        }
        written
    }

    /// Drop expired entries from the backing store
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        self.hit_counts.retain(|_, counter| counter.expires_at > now);
        self.guarded("purge", self.store.purge_expired())
            .await
            .unwrap_or(0)
    }

    /// Current counters
    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let entries = self.guarded("len", self.store.len()).await.unwrap_or(0);

        CacheStats {
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            entries,
            store_errors: self.store_errors.load(Ordering::Relaxed),
            enabled: self.is_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn len(&self) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn purge_expired(&self) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    struct StalledStore;

    #[async_trait]
    impl KeyValueStore for StalledStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
        async fn len(&self) -> Result<usize, CacheError> {
            Ok(0)
        }
        async fn purge_expired(&self) -> Result<usize, CacheError> {
            Ok(0)
        }
    }

    /// Reads the value first, then answers late
    struct SlowReadStore {
        inner: MemoryStore,
        read_delay_ms: AtomicU64,
    }

    #[async_trait]
    impl KeyValueStore for SlowReadStore {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            let value = self.inner.get(key).await?;
            let delay = self.read_delay_ms.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(value)
        }
        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
            self.inner.set(key, value, ttl).await
        }
        async fn len(&self) -> Result<usize, CacheError> {
            self.inner.len().await
        }
        async fn purge_expired(&self) -> Result<usize, CacheError> {
            self.inner.purge_expired().await
        }
    }

    fn cache_over(store: Arc<dyn KeyValueStore>) -> ResponseCache {
        ResponseCache::new(
            store,
            &CacheConfig {
                enabled: true,
                ttl_secs: 60,
                min_content_len: 10,
                io_timeout_ms: 50,
            },
        )
    }

    const QUESTION: &str = "What are Lambda best practices?";

    #[tokio::test]
    async fn test_store_then_lookup_increments_hit_count() {
        let cache = cache_over(Arc::new(MemoryStore::new()));
        let context = ClientContext::for_client("Acme Corp");
        let usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 20,
            total_tokens: 30,
        };
        assert!(cache.store(QUESTION, &context, "Use small handlers.", usage).await);

        match cache.lookup(QUESTION, &context).await {
            CacheLookup::Hit(entry) => {
                assert_eq!(entry.response, "Use small handlers.");
                assert_eq!(entry.hit_count, 1);
                assert_eq!(entry.token_usage, usage);
            }
            other => panic!("Expected hit, got {:?}", other),
        }
        match cache.lookup(QUESTION, &context).await {
            CacheLookup::Hit(entry) => assert_eq!(entry.hit_count, 2),
            other => panic!("Expected hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_different_context_is_a_miss() {
        let cache = cache_over(Arc::new(MemoryStore::new()));
        cache
            .store(
                QUESTION,
                &ClientContext::for_client("Acme Corp"),
                "Acme answer",
                TokenUsage::default(),
            )
            .await;

        let other = cache
            .lookup(QUESTION, &ClientContext::for_client("Globex"))
            .await;
        assert_eq!(other, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn test_overwrite_is_last_write_wins() {
        let cache = cache_over(Arc::new(MemoryStore::new()));
        let context = ClientContext::default();
        cache
            .store(QUESTION, &context, "first", TokenUsage::default())
            .await;
        cache
            .store(QUESTION, &context, "second", TokenUsage::default())
            .await;

        match cache.lookup(QUESTION, &context).await {
            CacheLookup::Hit(entry) => assert_eq!(entry.response, "second"),
            other => panic!("Expected hit, got {:?}", other),
        }
        assert_eq!(cache.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_slow_lookup_does_not_undo_a_newer_store() {
        let store = Arc::new(SlowReadStore {
            inner: MemoryStore::new(),
            read_delay_ms: AtomicU64::new(200),
        });
        let cache = Arc::new(ResponseCache::new(
            store.clone(),
            &CacheConfig {
                enabled: true,
                ttl_secs: 60,
                min_content_len: 10,
                io_timeout_ms: 2_000,
            },
        ));
        let context = ClientContext::default();
        cache
            .store(QUESTION, &context, "OLD", TokenUsage::default())
            .await;

        let slow_lookup = {
            let cache = cache.clone();
            let context = context.clone();
            tokio::spawn(async move { cache.lookup(QUESTION, &context).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.store(QUESTION, &context, "NEW", TokenUsage::default()).await);

        match slow_lookup.await.unwrap() {
            CacheLookup::Hit(entry) => assert_eq!(entry.response, "OLD"),
            other => panic!("Expected hit, got {:?}", other),
        }

        store.read_delay_ms.store(0, Ordering::SeqCst);
        match cache.lookup(QUESTION, &context).await {
            CacheLookup::Hit(entry) => {
                assert_eq!(entry.response, "NEW");
                assert_eq!(entry.hit_count, 1);
            }
            other => panic!("Expected hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_purge_drops_hit_counters_of_expired_entries() {
        let cache = ResponseCache::new(
            Arc::new(MemoryStore::new()),
            &CacheConfig {
                enabled: true,
                ttl_secs: 0,
                min_content_len: 10,
                io_timeout_ms: 50,
            },
        );
        let context = ClientContext::default();
        cache
            .store(QUESTION, &context, "answer", TokenUsage::default())
            .await;
        assert_eq!(cache.hit_counts.len(), 1);

        cache.purge_expired().await;
        assert!(cache.hit_counts.is_empty());
        assert_eq!(cache.lookup(QUESTION, &context).await, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn test_huge_ttl_keeps_entries() {
        let cache = ResponseCache::new(
            Arc::new(MemoryStore::new()),
            &CacheConfig {
                enabled: true,
                ttl_secs: u64::MAX,
                min_content_len: 10,
                io_timeout_ms: 50,
            },
        );
        let context = ClientContext::default();
        assert!(cache.store(QUESTION, &context, "answer", TokenUsage::default()).await);
        assert!(matches!(
            cache.lookup(QUESTION, &context).await,
            CacheLookup::Hit(_)
        ));
    }

    #[tokio::test]
    async fn test_short_content_is_never_cached() {
        let cache = cache_over(Arc::new(MemoryStore::new()));
        let context = ClientContext::default();
        assert!(!cache.store("hi", &context, "Hello!", TokenUsage::default()).await);
        assert_eq!(cache.lookup("hi", &context).await, CacheLookup::Bypassed);
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_disabled_cache_is_bypassed() {
        let cache = cache_over(Arc::new(MemoryStore::new()));
        let context = ClientContext::default();
        cache
            .store(QUESTION, &context, "answer", TokenUsage::default())
            .await;

        cache.set_enabled(false);
        assert_eq!(cache.lookup(QUESTION, &context).await, CacheLookup::Bypassed);
        assert!(!cache.store(QUESTION, &context, "new", TokenUsage::default()).await);

        cache.set_enabled(true);
        assert!(matches!(
            cache.lookup(QUESTION, &context).await,
            CacheLookup::Hit(_)
        ));
    }

    #[tokio::test]
    async fn test_store_errors_are_misses() {
        let cache = cache_over(Arc::new(BrokenStore));
        let context = ClientContext::default();
        assert!(!cache.store(QUESTION, &context, "answer", TokenUsage::default()).await);
        assert_eq!(cache.lookup(QUESTION, &context).await, CacheLookup::Miss);

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert!(stats.store_errors >= 2);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_stalled_store_times_out_to_miss() {
        let cache = cache_over(Arc::new(StalledStore));
        let context = ClientContext::default();
        let started = std::time::Instant::now();
        assert_eq!(cache.lookup(QUESTION, &context).await, CacheLookup::Miss);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_hit_rate() {
        let cache = cache_over(Arc::new(MemoryStore::new()));
        let context = ClientContext::default();
        cache
            .store(QUESTION, &context, "answer", TokenUsage::default())
            .await;
        cache.lookup(QUESTION, &context).await;
        cache.lookup("Something else entirely?", &context).await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
