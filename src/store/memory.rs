//! In-process counter store.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{CounterStore, PurgeSchedule, PURGE_INTERVAL};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// A single counter and its deadline.
#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A process-local counter store.
///
/// Counters live in a sharded concurrent map; each increment holds the
/// shard lock for its key, so concurrent increments never lose updates.
/// Expired entries read as absent. They are dropped when read, by a full
/// purge that increments trigger at most once a minute of store time, or by
/// [`purge_expired`](MemoryStore::purge_expired) and the optional sweeper.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
    purge: PurgeSchedule,
}

impl MemoryStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            purge: PurgeSchedule::new(PURGE_INTERVAL),
        }
    }

    /// Drop every expired counter, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_at(self.clock.now())
    }

    fn purge_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Periodically purge expired counters in the background.
    ///
    /// The task stops on its own once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.purge_expired();
                if removed > 0 {
                    debug!(removed = removed, "Purged expired counters");
                }
            }
        })
    }

    /// Remove every counter.
    pub fn clear_all(&self) {
        self.entries.clear();
    }

    /// Number of counters currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// `now + expiry` seconds, clamped to the representable range.
pub(crate) fn deadline(now: DateTime<Utc>, expiry: i64) -> DateTime<Utc> {
    let ttl = Duration::try_seconds(expiry).unwrap_or(if expiry < 0 {
        Duration::MIN
    } else {
        Duration::MAX
    });
    now.checked_add_signed(ttl).unwrap_or(if expiry < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<i64> {
        let now = self.clock.now();
        let live = self
            .entries
            .get(key)
            .map(|entry| (!entry.is_expired(now)).then_some(entry.value));

        match live {
            Some(Some(value)) => Ok(value),
            Some(None) => {
                self.entries.remove_if(key, |_, entry| entry.is_expired(now));
                Ok(0)
            }
            None => Ok(0),
        }
    }

    async fn incr(&self, key: &str, expiry: i64, elastic: bool, amount: i64) -> Result<i64> {
        let now = self.clock.now();
        let expires_at = deadline(now, expiry);

        // Must run before taking the entry below; retain locks every shard.
        if self.purge.claim(now) {
            let removed = self.purge_at(now);
            if removed > 0 {
                debug!(removed = removed, "Purged expired counters");
            }
        }

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert(Entry { value: 0, expires_at });

        if entry.is_expired(now) {
            *entry = Entry { value: 0, expires_at };
        }
        entry.value = entry.value.saturating_add(amount);
        if elastic {
            entry.expires_at = expires_at;
        }

        trace!(key = %key, value = entry.value, expires_at = %entry.expires_at, "Incremented counter");
        Ok(entry.value)
    }

    async fn get_expiry(&self, key: &str) -> Result<DateTime<Utc>> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.expires_at)
            .unwrap_or(now))
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn check(&self) -> bool {
        true
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures::future::join_all;

    fn store_with_clock() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::default();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_absent_key() {
        let (store, clock) = store_with_clock();

        assert_eq!(store.get("missing").await.unwrap(), 0);
        assert!(store.get_expiry("missing").await.unwrap() <= clock.now());
        store.clear("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_counter_contract() {
        let (store, clock) = store_with_clock();
        let key = uuid::Uuid::new_v4().to_string();

        assert_eq!(store.incr(&key, 3, false, 1).await.unwrap(), 1);
        let initial_expiry = store.get_expiry(&key).await.unwrap();
        assert_eq!(initial_expiry, clock.now() + Duration::seconds(3));

        clock.advance(Duration::seconds(1));

        // Non-elastic increments keep the original deadline
        assert_eq!(store.incr(&key, 5, false, 2).await.unwrap(), 3);
        assert_eq!(store.get_expiry(&key).await.unwrap(), initial_expiry);

        // Elastic increments move it
        assert_eq!(store.incr(&key, 4, true, 1).await.unwrap(), 4);
        assert_ne!(store.get_expiry(&key).await.unwrap(), initial_expiry);

        assert_eq!(store.get(&key).await.unwrap(), 4);

        store.clear(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_negative_expiry_expires_immediately() {
        let (store, _clock) = store_with_clock();

        assert_eq!(store.incr("auto-remove", -1, false, 1).await.unwrap(), 1);
        assert_eq!(store.get("auto-remove").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_negative_amount_does_not_corrupt() {
        let (store, _clock) = store_with_clock();

        assert_eq!(store.incr("k", 60, false, 2).await.unwrap(), 2);
        assert_eq!(store.incr("k", 60, false, -5).await.unwrap(), -3);
        assert_eq!(store.incr("k", 60, false, i64::MIN).await.unwrap(), i64::MIN);
        assert_eq!(store.incr("k", 60, false, 1).await.unwrap(), i64::MIN + 1);
    }

    #[tokio::test]
    async fn test_window_rolls_over_after_expiry() {
        let (store, clock) = store_with_clock();

        store.incr("k", 10, false, 7).await.unwrap();
        clock.advance(Duration::seconds(10));

        assert_eq!(store.get("k").await.unwrap(), 0);
        assert_eq!(store.incr("k", 10, false, 1).await.unwrap(), 1);
        assert_eq!(
            store.get_expiry("k").await.unwrap(),
            clock.now() + Duration::seconds(10)
        );
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();

        store.incr("short", 1, false, 1).await.unwrap();
        store.incr("long", 100, false, 1).await.unwrap();
        clock.advance(Duration::seconds(2));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_increments_reclaim_abandoned_counters() {
        let (store, clock) = store_with_clock();

        // A fresh key per second, never read again, like moving-window sub-windows.
        let mut peak = 0;
        for i in 0..1000 {
            store.incr(&format!("limit/{}", i), 2, false, 1).await.unwrap();
            peak = peak.max(store.len());
            clock.advance(Duration::seconds(1));
        }

        assert!(peak <= 61, "held {} counters", peak);
        assert!(store.len() <= 61);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());

        let tasks = (0..64).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..10 {
                    store.incr("shared", 60, false, 1).await.unwrap();
                }
            })
        });
        for result in join_all(tasks).await {
            result.unwrap();
        }

        assert_eq!(store.get("shared").await.unwrap(), 640);
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_store_dropped() {
        let store = Arc::new(MemoryStore::new());
        let handle = store.spawn_sweeper(std::time::Duration::from_millis(5));

        drop(store);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
