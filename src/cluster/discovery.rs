//! Swarm discovery records of managed clusters
//!
//! Classic swarm managers find their peers through time-limited records in
//! the key-value store. Record failures are logged and never propagated.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::docker::info::NodeInfo;
use crate::events::{Action, NodeEvent};
use crate::store::{KvStore, WriteOptions};

pub const DEFAULT_DISCOVERY_TTL: Duration = Duration::from_secs(60);

pub fn discovery_key(cluster: &str, address: &str) -> String {
    format!("/discovery/{}/docker/swarm/nodes/{}", cluster, address)
}

pub struct SwarmDiscovery {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl SwarmDiscovery {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub async fn register(&self, cluster: &str, address: &str) {
        if cluster.contains('/') {
            warn!("Bad cluster name for discovery: '{}'", cluster);
            return;
        }
        let options = WriteOptions::default().with_ttl(self.ttl);
        match self.kv.set(&discovery_key(cluster, address), address, &options).await {
            Ok(()) => debug!("Registered {} in swarm discovery of '{}'", address, cluster),
            Err(e) => warn!(
                "Can not update swarm registration of node {} in cluster '{}': {}",
                address, cluster, e
            ),
        }
    }

    pub async fn unregister(&self, cluster: &str, address: &str) {
        if let Err(e) = self.kv.delete(&discovery_key(cluster, address)).await {
            warn!(
                "Can not delete swarm registration of node {} from cluster '{}': {}",
                address, cluster, e
            );
        }
    }

    /// Applies a node event. `is_managed` tells which cluster names are
    /// managed clusters keeping discovery records.
    pub async fn on_node_event(&self, event: &NodeEvent, is_managed: &(dyn Fn(&str) -> bool + Send + Sync)) {
        let Some(ref address) = event.address else {
            return;
        };
        let current = match event.action {
            Action::Delete => None,
            _ => event.cluster.as_deref(),
        };
        if let Some(previous) = event.previous_cluster.as_deref() {
            if Some(previous) != current && is_managed(previous) {
                self.unregister(previous, address).await;
            }
        }
        if let Some(cluster) = current {
            if is_managed(cluster) {
                self.register(cluster, address).await;
            }
        }
    }

    /// Re-registers every node of a cluster before its records expire
    pub async fn refresh(&self, cluster: &str, nodes: &[NodeInfo]) {
        for node in nodes {
            self.register(cluster, &node.address).await;
        }
    }
}
