//! Gossip mesh for shared counters.
//!
//! Each node publishes its own contribution to a counter as a chitchat
//! key-value pair; readers sum what the live nodes have published. Membership
//! and failure detection come from chitchat itself.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Failures starting or stopping a mesh node.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Could not join mesh: {0}")]
    StartError(String),
    #[error("Could not leave mesh: {0}")]
    ShutdownError(String),
}

/// Settings for one mesh node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Node name, random unless set.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// UDP address gossip is received on.
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,
    /// Address peers use to reach this node.
    #[serde(default = "default_gossip_addr")]
    pub advertise_addr: SocketAddr,
    /// Peers contacted on startup.
    #[serde(default)]
    pub seed_nodes: Vec<String>,
    /// Nodes only gossip with peers sharing this name.
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,
    /// Gossip round period, in milliseconds when serialized.
    #[serde(default = "default_gossip_interval", with = "millis")]
    pub gossip_interval: Duration,
    /// How long a dead node's contributions linger before being dropped.
    #[serde(default = "default_dead_node_grace_period", with = "millis")]
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = default_gossip_addr();
        Self {
            node_id: default_node_id(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval: default_gossip_interval(),
            dead_node_grace_period: default_dead_node_grace_period(),
        }
    }
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "ratekeeper".to_string()
}

fn default_gossip_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_dead_node_grace_period() -> Duration {
    Duration::from_secs(3600)
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// One node's share of a counter.
///
/// Every node only ever writes its own contribution; the cluster-wide value
/// of a counter is the sum of the contributions belonging to the same window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contribution {
    /// Hits recorded by this node in the window.
    pub value: i64,
    /// When the window was opened (epoch milliseconds); identifies the window.
    pub window_start_ms: i64,
    /// When this node last saw the window expiring (epoch milliseconds).
    pub expires_ms: i64,
}

impl Contribution {
    /// Encode as a chitchat value: `"{value}|{window_start_ms}|{expires_ms}"`.
    pub fn encode(&self) -> String {
        format!("{}|{}|{}", self.value, self.window_start_ms, self.expires_ms)
    }

    /// Decode a chitchat value produced by [`encode`](Self::encode).
    pub fn decode(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, '|');
        let value = parts.next()?.parse().ok()?;
        let window_start_ms = parts.next()?.parse().ok()?;
        let expires_ms = parts.next()?.parse().ok()?;
        Some(Self {
            value,
            window_start_ms,
            expires_ms,
        })
    }
}

/// Every live node's view of one counter.
#[derive(Debug, Clone, Default)]
pub struct CounterState {
    /// This node's contribution, if it has ever written one.
    pub local: Option<Contribution>,
    /// Contributions from other live nodes.
    pub peers: Vec<Contribution>,
    /// Latest clear across the cluster (epoch milliseconds).
    pub cleared_at_ms: Option<i64>,
}

impl CounterState {
    /// All contributions, local first.
    pub fn contributions(&self) -> impl Iterator<Item = &Contribution> {
        self.local.iter().chain(self.peers.iter())
    }
}

const CONTRIBUTION_PREFIX: &str = "counter|";

/// Chitchat key holding a node's contribution to `key`.
fn contribution_key(key: &str) -> String {
    format!("{}{}", CONTRIBUTION_PREFIX, key)
}

/// Chitchat key holding the last time a node cleared `key`.
fn cleared_key(key: &str) -> String {
    format!("cleared|{}", key)
}

/// A running mesh node.
pub struct Cluster {
    node_id: String,
    handle: ChitchatHandle,
    config: ClusterConfig,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Bind the gossip socket and begin gossiping with the seed nodes.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node = %config.node_id,
            mesh = %config.cluster_id,
            listen = %config.listen_addr,
            advertise = %config.advertise_addr,
            seeds = config.seed_nodes.len(),
            "Joining counter mesh"
        );

        let chitchat_config = ChitchatConfig {
            chitchat_id: ChitchatId {
                node_id: config.node_id.clone(),
                generation_id: 0,
                gossip_advertise_addr: config.advertise_addr,
            },
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let handle = spawn_chitchat(chitchat_config, Vec::new(), &UdpTransport)
            .await
            .map_err(|err| ClusterError::StartError(err.to_string()))?;

        info!(node = %config.node_id, "Joined counter mesh");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            config,
        })
    }

    /// This node's name.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The configuration this node was started with.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The underlying chitchat state.
    pub fn chitchat(&self) -> Arc<Mutex<Chitchat>> {
        self.handle.chitchat()
    }

    /// Read every live node's contribution to `key`.
    pub async fn read_counter(&self, key: &str) -> CounterState {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        self.counter_state_internal(&mut chitchat, key)
    }

    /// Replace our contribution to `key` with the one computed by `update`
    /// from the current cluster view, and return the updated view.
    ///
    /// The read and the write happen under the chitchat lock, so updates made
    /// through this node never race each other.
    pub async fn update_counter<F>(&self, key: &str, update: F) -> CounterState
    where
        F: FnOnce(&CounterState) -> Contribution,
    {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let mut state = self.counter_state_internal(&mut chitchat, key);
        let contribution = update(&state);

        chitchat
            .self_node_state()
            .set(contribution_key(key), contribution.encode());

        debug!(
            key = %key,
            local_value = contribution.value,
            window_start_ms = contribution.window_start_ms,
            "Updated local counter contribution"
        );

        state.local = Some(contribution);
        state
    }

    /// Record that `key` was cleared at `at_ms`. Contributions to windows
    /// opened at or before that instant are ignored from then on.
    pub async fn clear_counter(&self, key: &str, at_ms: i64) {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let cleared = cleared_key(key);
        let node_state = chitchat.self_node_state();
        let previous: i64 = node_state
            .get(&cleared)
            .and_then(|v| v.parse().ok())
            .unwrap_or(i64::MIN);
        node_state.set(cleared, previous.max(at_ms).to_string());

        debug!(key = %key, cleared_at_ms = at_ms, "Cleared counter");
    }

    /// Delete this node's contributions to windows that are over at `now_ms`,
    /// returning how many were removed.
    ///
    /// A lapsed contribution is kept while a peer still holds the same window
    /// open, since it counts toward that window's total.
    pub async fn purge_expired(&self, now_ms: i64) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let lapsed: Vec<String> = chitchat
            .self_node_state()
            .iter_prefix(CONTRIBUTION_PREFIX)
            .filter_map(|(chitchat_key, versioned)| {
                let contribution = Contribution::decode(&versioned.value)?;
                (contribution.expires_ms <= now_ms).then(|| chitchat_key.to_string())
            })
            .collect();

        let mut removed = 0;
        for chitchat_key in lapsed {
            let key = &chitchat_key[CONTRIBUTION_PREFIX.len()..];
            let state = self.counter_state_internal(&mut chitchat, key);
            let Some(local) = state.local else {
                continue;
            };
            let window_open = state.peers.iter().any(|peer| {
                peer.window_start_ms == local.window_start_ms && peer.expires_ms > now_ms
            });
            if !window_open {
                chitchat.self_node_state().delete(&chitchat_key);
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed = removed, "Deleted expired counter contributions");
        }
        removed
    }

    /// Gather the local contribution, live peers' contributions and the
    /// newest clear tombstone for `key`.
    fn counter_state_internal(&self, chitchat: &mut Chitchat, key: &str) -> CounterState {
        let counter = contribution_key(key);
        let cleared = cleared_key(key);

        let (local, mut cleared_at_ms) = {
            let node_state = chitchat.self_node_state();
            (
                node_state.get(&counter).and_then(Contribution::decode),
                node_state.get(&cleared).and_then(|v| v.parse::<i64>().ok()),
            )
        };

        let mut peers = Vec::new();
        for node_id in chitchat.live_nodes() {
            if node_id.node_id == self.node_id {
                continue;
            }
            if let Some(node_state) = chitchat.node_state(node_id) {
                if let Some(contribution) = node_state.get(&counter).and_then(Contribution::decode)
                {
                    peers.push(contribution);
                }
                if let Some(at) = node_state.get(&cleared).and_then(|v| v.parse::<i64>().ok()) {
                    cleared_at_ms = Some(cleared_at_ms.map_or(at, |c| c.max(at)));
                }
            }
        }

        CounterState {
            local,
            peers,
            cleared_at_ms,
        }
    }

    /// Live members, this node included.
    pub async fn live_node_count(&self) -> usize {
        self.handle.chitchat().lock().await.live_nodes().count()
    }

    /// Names of the live members, this node included.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat = self.handle.chitchat();
        let guard = chitchat.lock().await;
        guard.live_nodes().map(|id| id.node_id.clone()).collect()
    }

    /// Stop gossiping. Peers drop this node's contributions once they
    /// consider it dead.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node = %self.node_id, "Leaving counter mesh");
        self.handle
            .shutdown()
            .await
            .map_err(|err| ClusterError::ShutdownError(format!("{:?}", err)))
    }
}
