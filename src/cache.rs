//! Tiered TTL cache for event state, fixture lists and match aliases.
//!
//! Purely a memoization layer in front of the resolver: callers populate it
//! after a provider fetch, it never performs I/O and never blocks on one.
//! Entries expire by TTL only; `purge_expired` just reclaims memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// TTL class of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Live / in-play event state
    Live,
    /// Upcoming fixtures and same-day candidate lists
    Upcoming,
    /// Finished results, league metadata
    Long,
}

#[derive(Debug, Clone, Copy)]
pub struct TierTtls {
    pub live: Duration,
    pub upcoming: Duration,
    pub long: Duration,
}

impl Default for TierTtls {
    fn default() -> Self {
        TierTtls {
            live: Duration::from_secs(120),
            upcoming: Duration::from_secs(3_600),
            long: Duration::from_secs(86_400),
        }
    }
}

impl TierTtls {
    fn ttl(&self, tier: CacheTier) -> Duration {
        match tier {
            CacheTier::Live => self.live,
            CacheTier::Upcoming => self.upcoming,
            CacheTier::Long => self.long,
        }
    }
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Thread-safe, in-memory TTL cache keyed by string.
#[derive(Clone)]
pub struct TtlCache<V> {
    inner: Arc<RwLock<HashMap<String, Entry<V>>>>,
    ttls: TierTtls,
}

impl<V: Clone + Send + Sync> TtlCache<V> {
    pub fn new(ttls: TierTtls) -> Self {
        TtlCache {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ttls,
        }
    }

    /// Unexpired value for `key`, if any.
    pub async fn get(&self, key: &str) -> Option<V> {
        let inner = self.inner.read().await;
        inner
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    /// Last writer wins.
    pub async fn set(&self, key: impl Into<String>, value: V, tier: CacheTier) {
        let expires_at = Instant::now() + self.ttls.ttl(tier);
        self.inner
            .write()
            .await
            .insert(key.into(), Entry { value, expires_at });
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let before = inner.len();
        inner.retain(|_, e| e.expires_at > now);
        let removed = before - inner.len();
        if removed > 0 {
            debug!("Cache purge: {} expired, {} remaining", removed, inner.len());
        }
        removed
    }

    /// Number of stored entries, expired or not.
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

pub fn event_key(event_id: &str) -> String {
    format!("event:{}", event_id)
}

/// Fixture-filter signature for a day's candidate list.
pub fn candidates_key(sport: &str, date: chrono::NaiveDate) -> String {
    format!("candidates:{}:{}", sport.to_lowercase(), date.format("%Y-%m-%d"))
}

pub fn alias_key(event_id: &str) -> String {
    format!("alias:{}", event_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_ttls() -> TierTtls {
        TierTtls {
            live: Duration::from_millis(20),
            upcoming: Duration::from_secs(60),
            long: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn test_get_returns_unexpired_value() {
        let cache: TtlCache<u32> = TtlCache::new(short_ttls());
        cache.set(event_key("1"), 7, CacheTier::Upcoming).await;
        assert_eq!(cache.get("event:1").await, Some(7));
        assert_eq!(cache.get("event:2").await, None);
    }

    #[tokio::test]
    async fn test_live_tier_expires_first() {
        let cache: TtlCache<&'static str> = TtlCache::new(short_ttls());
        cache.set("live", "in-play", CacheTier::Live).await;
        cache.set("long", "final", CacheTier::Long).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("live").await, None);
        assert_eq!(cache.get("long").await, Some("final"));
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let cache: TtlCache<u32> = TtlCache::new(short_ttls());
        cache.set("k", 1, CacheTier::Long).await;
        cache.set("k", 2, CacheTier::Long).await;
        assert_eq!(cache.get("k").await, Some(2));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_purge_expired_removes_only_dead_entries() {
        let cache: TtlCache<u32> = TtlCache::new(short_ttls());
        cache.set("a", 1, CacheTier::Live).await;
        cache.set("b", 2, CacheTier::Upcoming).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("b").await, Some(2));
    }

    #[test]
    fn test_candidates_key_format() {
        let d = chrono::NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(candidates_key("Soccer", d), "candidates:soccer:2024-03-09");
    }
}
