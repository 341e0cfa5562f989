//! Response Cache
//!
//! Ephemeral, in-process map from a request key to a successful response.
//!
//! - Key: SHA-256 over (route id, trimmed payload, option fingerprint)
//! - TTL checked lazily on read; there is no background sweep
//! - Bounded: on overflow, expired entries are purged first, then the oldest
//! - Last write wins for concurrent puts to one key
//!
//! Only the dispatcher writes here, and only for successful responses on
//! cacheable routes. Timestamps use `tokio::time::Instant` so paused-time tests
//! can move past the TTL.

use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Cache key: hex SHA-256
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for a request
    ///
    /// Payload whitespace at either end does not change the key; the
    /// dispatcher sends the same trimmed payload to the backend.
    #[must_use]
    pub fn new(route_id: u32, payload: &str, options_fingerprint: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(route_id.to_be_bytes());
        hasher.update([0u8]);
        hasher.update(payload.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(options_fingerprint.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Hex digest
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One cached response
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// Response text
    pub response: String,
    /// Insertion time
    pub created_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < ttl
    }
}

/// TTL-bounded response cache
pub struct ResponseCache {
    entries: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    /// Create a cache
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Configured TTL
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live response for `key`; an expired entry is removed and reported as a miss
    pub fn get(&self, key: &CacheKey) -> Option<String> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if entry.is_live(self.ttl, now) {
                return Some(entry.response.clone());
            }
        }
        self.entries
            .remove_if(key, |_, entry| !entry.is_live(self.ttl, now));
        None
    }

    /// Store a response
    pub fn put(&self, key: CacheKey, response: impl Into<String>) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.make_room();
        }
        self.entries.insert(
            key,
            CacheEntry {
                response: response.into(),
                created_at: Instant::now(),
            },
        );
    }

    /// Whether a live entry exists for `key`
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| entry.is_live(self.ttl, now))
    }

    /// Entry count, including not-yet-purged expired entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remove expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(self.ttl, now));
        before.saturating_sub(self.entries.len())
    }

    fn make_room(&self) {
        if self.purge_expired() > 0 && self.entries.len() < self.max_entries {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().created_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            tracing::debug!(key = %key.as_str(), "Evicted oldest cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(route: u32, payload: &str) -> CacheKey {
        CacheKey::new(route, payload, "")
    }

    #[test]
    fn test_key_stability() {
        assert_eq!(key(2, "hi"), key(2, "  hi\n"));
        assert_ne!(key(2, "hi"), key(3, "hi"));
        assert_ne!(CacheKey::new(2, "hi", "a"), CacheKey::new(2, "hi", "b"));
        assert_eq!(key(2, "hi").as_str().len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = ResponseCache::new(Duration::from_secs(60), 16);
        cache.put(key(1, "x"), "cached");
        assert_eq!(cache.get(&key(1, "x")).as_deref(), Some("cached"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.contains(&key(1, "x")));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&key(1, "x")), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_evicts_oldest() {
        let cache = ResponseCache::new(Duration::from_secs(60), 2);
        cache.put(key(1, "a"), "a");
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.put(key(1, "b"), "b");
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.put(key(1, "c"), "c");

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&key(1, "a")));
        assert!(cache.contains(&key(1, "b")));
        assert!(cache.contains(&key(1, "c")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_prefers_expired() {
        let cache = ResponseCache::new(Duration::from_secs(5), 2);
        cache.put(key(1, "old"), "old");
        tokio::time::advance(Duration::from_secs(4)).await;
        cache.put(key(1, "mid"), "mid");
        tokio::time::advance(Duration::from_secs(2)).await;
        cache.put(key(1, "new"), "new");

        assert!(cache.contains(&key(1, "mid")));
        assert!(cache.contains(&key(1, "new")));
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cache = ResponseCache::new(Duration::from_secs(60), 4);
        cache.put(key(1, "x"), "first");
        cache.put(key(1, "x"), "second");
        assert_eq!(cache.get(&key(1, "x")).as_deref(), Some("second"));
        assert_eq!(cache.len(), 1);
    }
}
