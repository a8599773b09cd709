//! TTL cache for review responses, keyed by diff fingerprint.
//!
//! The cache is shared across all workers. Besides the entry map it
//! maintains a per-fingerprint flight lock: a caller that misses takes
//! the lock for its fingerprint before calling upstream, so concurrent
//! misses for the same fingerprint produce exactly one upstream call
//! (the losers re-check the cache once the winner has filled it).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use reviewd_core::LlmReview;

struct CacheEntry {
    review: LlmReview,
    expires_at: Instant,
}

pub struct ReviewCache {
    ttl: Duration,
    entries: std::sync::Mutex<HashMap<String, CacheEntry>>,
    /// Per-fingerprint locks serializing upstream calls for the same input.
    flights: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl ReviewCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: std::sync::Mutex::new(HashMap::new()),
            flights: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a fingerprint, dropping the entry if it has expired.
    pub fn get(&self, fingerprint: &str) -> Option<LlmReview> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(fingerprint) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.review.clone()),
            Some(_) => {
                entries.remove(fingerprint);
                None
            }
            None => None,
        }
    }

    /// Store a response under its fingerprint. Expired entries are
    /// swept opportunistically so the map stays bounded by live inputs.
    pub fn insert(&self, fingerprint: String, review: LlmReview) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            fingerprint,
            CacheEntry {
                review,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Get or create the flight lock for a fingerprint.
    pub async fn flight_lock(&self, fingerprint: &str) -> Arc<Mutex<()>> {
        // Fast path: lock already exists
        {
            let flights = self.flights.read().await;
            if let Some(lock) = flights.get(fingerprint) {
                return lock.clone();
            }
        }

        let mut flights = self.flights.write().await;
        // Fingerprints are unbounded, so drop locks nobody holds any
        // more while we have the write lock anyway.
        flights.retain(|_, lock| Arc::strong_count(lock) > 1);
        flights
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }

    #[cfg(test)]
    pub async fn flights_len(&self) -> usize {
        self.flights.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review(summary: &str) -> LlmReview {
        LlmReview {
            summary: summary.to_string(),
            comments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_hit_within_ttl() {
        let cache = ReviewCache::new(Duration::from_secs(60));
        cache.insert("fp1".to_string(), review("cached"));

        let hit = cache.get("fp1").unwrap();
        assert_eq!(hit.summary, "cached");
        assert!(cache.get("other").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = ReviewCache::new(Duration::from_secs(60));
        cache.insert("fp1".to_string(), review("cached"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("fp1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_swept_on_insert() {
        let cache = ReviewCache::new(Duration::from_secs(60));
        cache.insert("old".to_string(), review("stale"));

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.insert("new".to_string(), review("fresh"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_flight_lock_is_per_fingerprint() {
        let cache = ReviewCache::new(Duration::from_secs(60));
        let a1 = cache.flight_lock("a").await;
        let a2 = cache.flight_lock("a").await;
        let b = cache.flight_lock("b").await;

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    #[tokio::test]
    async fn test_released_flight_locks_are_pruned() {
        let cache = ReviewCache::new(Duration::from_secs(60));

        let held = cache.flight_lock("held").await;
        let released = cache.flight_lock("released").await;
        drop(released);

        // The next miss sweeps locks nobody holds.
        cache.flight_lock("new").await;
        assert_eq!(cache.flights_len().await, 2);

        drop(held);
        cache.flight_lock("newer").await;
        assert_eq!(cache.flights_len().await, 1);
    }
}
