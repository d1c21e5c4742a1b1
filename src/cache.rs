use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::identity::TokenRecord;

/// Concurrent id↔name map with per-key request coalescing.
///
/// `get`/`put` follow a many-reader / single-writer discipline; entries are
/// never evicted (cardinality is bounded by the identifier space).
/// `get_or_fetch` guarantees that concurrent misses for the same key issue
/// at most one backend lookup.
#[derive(Default)]
pub struct NameCache {
    map: RwLock<HashMap<String, String>>,
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.map.read().get(key).cloned()
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.map.write().insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Returns the cached value for `key`, or runs `fetch` to resolve and
    /// store it. Concurrent callers for the same key wait on the in-flight
    /// resolution instead of issuing their own.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let flight = {
            let mut flights = self.flights.lock();
            Arc::clone(
                flights
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _guard = flight.lock().await;

        // A winner of the flight lock may already have filled the entry.
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let value = fetch().await?;
        self.put(key, value.clone());
        Ok(value)
    }
}

/// Token cache with three coupled indices under one reader-writer lock:
/// records by token string, token strings bucketed by expiry instant, and
/// an earliest-first sequence of expiry instants. Every lookup first evicts
/// the expired prefix, so the amount of work per call is bounded by the
/// number of tokens that actually expired.
#[derive(Default)]
pub struct TokenCache {
    inner: RwLock<TokenCacheInner>,
}

#[derive(Default)]
struct TokenCacheInner {
    by_id: HashMap<String, TokenRecord>,
    by_expiry: HashMap<DateTime<Utc>, Vec<String>>,
    expiry_order: VecDeque<DateTime<Utc>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, record: TokenRecord) {
        let token = token.into();
        let expiry = record.expires_at;
        let mut inner = self.inner.write();

        inner.by_id.insert(token.clone(), record);
        inner.by_expiry.entry(expiry).or_default().push(token);

        // The sequence is expected to be nearly sorted already (tokens are
        // usually issued with equal lifetimes), so append and shift the new
        // instant backwards through the tail until order is restored.
        inner.expiry_order.push_back(expiry);
        let mut index = inner.expiry_order.len() - 1;
        while index > 0 && inner.expiry_order[index - 1] > inner.expiry_order[index] {
            inner.expiry_order.swap(index - 1, index);
            index -= 1;
        }

        tracing::debug!(size = inner.by_id.len(), "added token to cache");
    }

    pub fn get(&self, token: &str) -> Option<TokenRecord> {
        self.get_at(token, Utc::now())
    }

    pub(crate) fn get_at(&self, token: &str, now: DateTime<Utc>) -> Option<TokenRecord> {
        let has_expired = {
            let inner = self.inner.read();
            inner
                .expiry_order
                .front()
                .is_some_and(|instant| *instant <= now)
        };

        if has_expired {
            let mut inner = self.inner.write();
            let mut removed = 0usize;
            while let Some(instant) = inner.expiry_order.front().copied() {
                if instant > now {
                    break;
                }
                inner.expiry_order.pop_front();
                if let Some(tokens) = inner.by_expiry.remove(&instant) {
                    for expired in tokens {
                        inner.by_id.remove(&expired);
                        removed += 1;
                    }
                }
            }
            if removed > 0 {
                tracing::debug!(
                    removed,
                    size = inner.by_id.len(),
                    "evicted expired tokens from cache"
                );
            }
        }

        let inner = self.inner.read();
        let record = inner.by_id.get(token)?;
        if record.expires_at <= now {
            return None;
        }
        Some(record.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::AuditError;

    fn record_expiring_at(expires_at: DateTime<Utc>) -> TokenRecord {
        TokenRecord {
            expires_at,
            ..TokenRecord::default()
        }
    }

    #[test]
    fn name_cache_put_then_get() {
        let cache = NameCache::new();
        assert_eq!(cache.get("d-1"), None);

        cache.put("d-1", "monsoon");
        assert_eq!(cache.get("d-1").as_deref(), Some("monsoon"));

        cache.put("d-1", "monsoon2");
        assert_eq!(cache.get("d-1").as_deref(), Some("monsoon2"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_issue_one_fetch() {
        let cache = Arc::new(NameCache::new());
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let cache = Arc::clone(&cache);
            let fetches = Arc::clone(&fetches);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("u1", || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        Ok("alice".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            let name = handle.await.unwrap().unwrap();
            assert_eq!(name, "alice");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = NameCache::new();
        let result = cache
            .get_or_fetch("u2", || async { Err(AuditError::Identity("boom".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.get("u2"), None);

        let name = cache
            .get_or_fetch("u2", || async { Ok("bob".to_string()) })
            .await
            .unwrap();
        assert_eq!(name, "bob");
    }

    #[test]
    fn token_cache_never_returns_expired_tokens() {
        let cache = TokenCache::new();
        let now = Utc::now();
        cache.insert("stale", record_expiring_at(now - Duration::seconds(1)));
        assert!(cache.get_at("stale", now).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn get_evicts_expired_prefix_but_keeps_live_tokens() {
        let cache = TokenCache::new();
        let now = Utc::now();
        cache.insert("t1", record_expiring_at(now + Duration::seconds(1)));
        cache.insert("t2", record_expiring_at(now + Duration::seconds(2)));
        assert_eq!(cache.len(), 2);

        let later = now + Duration::milliseconds(1500);
        assert!(cache.get_at("t1", later).is_none());
        assert!(cache.get_at("t2", later).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn out_of_order_inserts_keep_expiry_sequence_sorted() {
        let cache = TokenCache::new();
        let now = Utc::now();
        cache.insert("late", record_expiring_at(now + Duration::seconds(30)));
        cache.insert("early", record_expiring_at(now + Duration::seconds(5)));
        cache.insert("middle", record_expiring_at(now + Duration::seconds(10)));

        // Evicting at +6s must remove only the earliest entry.
        let later = now + Duration::seconds(6);
        assert!(cache.get_at("early", later).is_none());
        assert!(cache.get_at("middle", later).is_some());
        assert!(cache.get_at("late", later).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn tokens_sharing_an_expiry_are_evicted_together() {
        let cache = TokenCache::new();
        let now = Utc::now();
        let shared = now + Duration::seconds(1);
        cache.insert("a", record_expiring_at(shared));
        cache.insert("b", record_expiring_at(shared));
        cache.insert("c", record_expiring_at(now + Duration::seconds(60)));

        let later = now + Duration::seconds(2);
        assert!(cache.get_at("a", later).is_none());
        assert!(cache.get_at("b", later).is_none());
        assert!(cache.get_at("c", later).is_some());
        assert_eq!(cache.len(), 1);
    }
}
