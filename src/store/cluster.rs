//! Counter store distributed over the gossip mesh.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::{CounterStore, PurgeSchedule, PURGE_INTERVAL};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::mesh::{Cluster, Contribution, CounterState};

/// The window a counter is currently in, as seen from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveWindow {
    start_ms: i64,
    expires_ms: i64,
    total: i64,
}

/// Find the live window for a counter.
///
/// The window is the one whose latest expiry is still in the future; its
/// value is the sum of every node's contribution to it. Windows opened at or
/// before the most recent clear are ignored.
fn active_window(state: &CounterState, now_ms: i64) -> Option<ActiveWindow> {
    let cleared_at = state.cleared_at_ms.unwrap_or(i64::MIN);
    let counted = || {
        state
            .contributions()
            .filter(move |c| c.window_start_ms > cleared_at)
    };

    let newest = counted()
        .filter(|c| c.expires_ms > now_ms)
        .max_by_key(|c| (c.expires_ms, c.window_start_ms))?;

    let start_ms = newest.window_start_ms;
    let (total, expires_ms) = counted()
        .filter(|c| c.window_start_ms == start_ms)
        .fold((0i64, newest.expires_ms), |(total, expires), c| {
            (total.saturating_add(c.value), expires.max(c.expires_ms))
        });

    Some(ActiveWindow {
        start_ms,
        expires_ms,
        total,
    })
}

/// A counter store whose counters are shared by every node of a chitchat
/// cluster.
///
/// Each node records only its own hits; reads sum the contributions of all
/// live nodes. Increments made through one node are serialized by that
/// node's cluster lock. Peers' increments become visible after a gossip
/// round, so the cluster-wide count may briefly lag behind.
#[derive(Debug)]
pub struct ClusterStore {
    cluster: Arc<Cluster>,
    clock: Arc<dyn Clock>,
    purge: PurgeSchedule,
}

impl ClusterStore {
    /// Create a store on top of a running cluster node.
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self::with_clock(cluster, Arc::new(SystemClock))
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock(cluster: Arc<Cluster>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cluster,
            clock,
            purge: PurgeSchedule::new(PURGE_INTERVAL),
        }
    }

    /// Get the cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

#[async_trait]
impl CounterStore for ClusterStore {
    async fn get(&self, key: &str) -> Result<i64> {
        let state = self.cluster.read_counter(key).await;
        Ok(active_window(&state, self.now_ms()).map_or(0, |w| w.total))
    }

    async fn incr(&self, key: &str, expiry: i64, elastic: bool, amount: i64) -> Result<i64> {
        let now_ms = self.now_ms();
        let ttl_ms = expiry.saturating_mul(1000);

        if self.purge.claim(self.clock.now()) {
            let removed = self.cluster.purge_expired(now_ms).await;
            if removed > 0 {
                debug!(removed = removed, "Stopped gossiping expired counters");
            }
        }
        let deadline_ms = now_ms.saturating_add(ttl_ms);

        let state = self
            .cluster
            .update_counter(key, |state| match active_window(state, now_ms) {
                Some(window) => {
                    let base = state
                        .local
                        .filter(|c| c.window_start_ms == window.start_ms)
                        .map_or(0, |c| c.value);
                    Contribution {
                        value: base.saturating_add(amount),
                        window_start_ms: window.start_ms,
                        expires_ms: if elastic { deadline_ms } else { window.expires_ms },
                    }
                }
                None => Contribution {
                    value: amount,
                    window_start_ms: state
                        .cleared_at_ms
                        .map_or(now_ms, |cleared| now_ms.max(cleared.saturating_add(1))),
                    expires_ms: deadline_ms,
                },
            })
            .await;

        // The fresh contribution is counted even if its window is already over
        let start_ms = state.local.map_or(now_ms, |c| c.window_start_ms);
        let total = state
            .contributions()
            .filter(|c| c.window_start_ms == start_ms)
            .fold(0i64, |total, c| total.saturating_add(c.value));

        trace!(key = %key, total = total, "Incremented cluster counter");
        Ok(total)
    }

    async fn get_expiry(&self, key: &str) -> Result<DateTime<Utc>> {
        let now = self.clock.now();
        let state = self.cluster.read_counter(key).await;
        Ok(active_window(&state, now.timestamp_millis())
            .and_then(|w| DateTime::<Utc>::from_timestamp_millis(w.expires_ms))
            .unwrap_or(now))
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.cluster.clear_counter(key, self.now_ms()).await;
        Ok(())
    }

    async fn check(&self) -> bool {
        self.cluster.live_node_count().await > 0
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn name(&self) -> &'static str {
        "cluster"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mesh::{test_config, ClusterConfig};
    use chrono::Duration;

    fn contribution(value: i64, window_start_ms: i64, expires_ms: i64) -> Contribution {
        Contribution {
            value,
            window_start_ms,
            expires_ms,
        }
    }

    #[test]
    fn test_active_window_sums_same_window() {
        let state = CounterState {
            local: Some(contribution(2, 1_000, 61_000)),
            peers: vec![contribution(3, 1_000, 61_000), contribution(9, 500, 60_500)],
            cleared_at_ms: None,
        };

        let window = active_window(&state, 30_000).unwrap();
        assert_eq!(window.start_ms, 1_000);
        assert_eq!(window.total, 5);
        assert_eq!(window.expires_ms, 61_000);
    }

    #[test]
    fn test_active_window_uses_latest_elastic_expiry() {
        let state = CounterState {
            local: Some(contribution(1, 1_000, 40_000)),
            peers: vec![contribution(4, 1_000, 90_000)],
            cleared_at_ms: None,
        };

        // The local share has lapsed but still belongs to the refreshed window
        let window = active_window(&state, 50_000).unwrap();
        assert_eq!(window.total, 5);
        assert_eq!(window.expires_ms, 90_000);
    }

    #[test]
    fn test_active_window_expired_or_cleared() {
        let state = CounterState {
            local: Some(contribution(2, 1_000, 61_000)),
            peers: Vec::new(),
            cleared_at_ms: None,
        };
        assert!(active_window(&state, 61_000).is_none());

        let cleared = CounterState {
            cleared_at_ms: Some(1_000),
            ..state
        };
        assert!(active_window(&cleared, 30_000).is_none());
    }

    #[tokio::test]
    async fn test_cluster_store_contract() {
        let cluster = Arc::new(Cluster::start(test_config(18946)).await.unwrap());
        let clock = ManualClock::default();

        {
            let store = ClusterStore::with_clock(cluster.clone(), Arc::new(clock.clone()));
            assert!(store.check().await);

            assert_eq!(store.get("k").await.unwrap(), 0);
            assert!(store.get_expiry("k").await.unwrap() <= clock.now());

            assert_eq!(store.incr("k", 3, false, 1).await.unwrap(), 1);
            let initial_expiry = store.get_expiry("k").await.unwrap();

            clock.advance(Duration::seconds(1));
            assert_eq!(store.incr("k", 5, false, 2).await.unwrap(), 3);
            assert_eq!(store.get_expiry("k").await.unwrap(), initial_expiry);

            assert_eq!(store.incr("k", 4, true, 1).await.unwrap(), 4);
            assert!(store.get_expiry("k").await.unwrap() > initial_expiry);
            assert_eq!(store.get("k").await.unwrap(), 4);

            store.clear("k").await.unwrap();
            assert_eq!(store.get("k").await.unwrap(), 0);
            assert_eq!(store.incr("k", 3, false, 1).await.unwrap(), 1);

            assert_eq!(store.incr("auto-remove", -1, false, 1).await.unwrap(), 1);
            assert_eq!(store.get("auto-remove").await.unwrap(), 0);

            clock.advance(Duration::seconds(3));
            assert_eq!(store.get("k").await.unwrap(), 0);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_counters_leave_gossip_state() {
        let cluster = Arc::new(Cluster::start(test_config(18952)).await.unwrap());
        let clock = ManualClock::default();

        {
            let store = ClusterStore::with_clock(cluster.clone(), Arc::new(clock.clone()));
            let mut peak = 0;
            for i in 0..200 {
                store.incr(&format!("limit/{}", i), 2, false, 1).await.unwrap();
                let chitchat = cluster.chitchat();
                let mut guard = chitchat.lock().await;
                let held = guard
                    .self_node_state()
                    .key_values()
                    .filter(|(key, _)| key.starts_with("counter|"))
                    .count();
                peak = peak.max(held);
                clock.advance(Duration::seconds(1));
            }
            assert!(peak <= 61, "gossiping {} counters", peak);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_store_two_nodes() {
        let cluster1 = Arc::new(Cluster::start(test_config(18950)).await.unwrap());
        let cluster2 = Arc::new(
            Cluster::start(ClusterConfig {
                seed_nodes: vec!["127.0.0.1:18950".to_string()],
                ..test_config(18951)
            })
            .await
            .unwrap(),
        );
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        {
            let store1 = ClusterStore::new(cluster1.clone());
            let store2 = ClusterStore::new(cluster2.clone());

            assert_eq!(store1.incr("shared", 60, false, 5).await.unwrap(), 5);

            // one gossip round
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            assert_eq!(store2.get("shared").await.unwrap(), 5);

            assert_eq!(store2.incr("shared", 60, false, 3).await.unwrap(), 8);

            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            assert_eq!(store1.get("shared").await.unwrap(), 8);
            assert_eq!(
                store1.get_expiry("shared").await.unwrap(),
                store2.get_expiry("shared").await.unwrap()
            );
        }

        Arc::try_unwrap(cluster1).unwrap().shutdown().await.unwrap();
        Arc::try_unwrap(cluster2).unwrap().shutdown().await.unwrap();
    }
}
