//! Peer mesh networking using Chitchat.
//!
//! Nodes in the mesh gossip their own contribution to each counter; the
//! [`ClusterStore`](crate::store::ClusterStore) sums them into cluster-wide
//! counter values.

mod cluster;

pub use cluster::{Cluster, ClusterConfig, ClusterError, Contribution, CounterState};

#[cfg(test)]
pub(crate) use cluster::tests::test_config;
