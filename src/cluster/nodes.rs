//! Node directory
//!
//! Keeps the last known record of every node, the endpoint bound to it and
//! which node runs which container. Membership changes are published as
//! node events carrying the previously claimed cluster.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::docker::info::{NodeInfo, NodeInfoProvider, NodeMetrics};
use crate::docker::{DockerApi, EndpointFactory};
use crate::events::{Action, EventBus, NodeEvent};

use super::config::EndpointConfig;

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

pub trait NodeDirectory: Send + Sync {
    fn nodes(&self) -> Vec<NodeInfo>;

    fn node(&self, name: &str) -> Option<NodeInfo>;

    /// Endpoint of a node, bound on first use when possible
    fn node_endpoint(&self, name: &str) -> Option<Arc<dyn DockerApi>>;

    /// Node running a container, full or abbreviated id
    fn container_node(&self, container_id: &str) -> Option<String>;

    fn nodes_in_cluster(&self, cluster: &str) -> Vec<NodeInfo> {
        self.nodes()
            .into_iter()
            .filter(|n| n.cluster.as_deref() == Some(cluster))
            .collect()
    }
}

struct DirectoryInfo(Arc<dyn NodeDirectory>);

impl NodeInfoProvider for DirectoryInfo {
    fn node_info(&self, name: &str) -> Option<NodeInfo> {
        self.0.node(name)
    }
}

/// Node records of a directory as seen by endpoints merging self-info
pub fn info_provider(directory: Arc<dyn NodeDirectory>) -> Arc<dyn NodeInfoProvider> {
    Arc::new(DirectoryInfo(directory))
}

// ============================================================================
// In-memory directory
// ============================================================================

pub struct NodeStorage {
    nodes: DashMap<String, NodeInfo>,
    endpoints: DashMap<String, Arc<dyn DockerApi>>,
    /// container id -> node name
    containers: DashMap<String, String>,
    factory: Option<(Arc<EndpointFactory>, EndpointConfig)>,
    events: EventBus,
}

impl NodeStorage {
    pub fn new(events: EventBus) -> Self {
        Self {
            nodes: DashMap::new(),
            endpoints: DashMap::new(),
            containers: DashMap::new(),
            factory: None,
            events,
        }
    }

    /// Bind node endpoints lazily from node addresses
    pub fn with_endpoint_factory(mut self, factory: Arc<EndpointFactory>, config: EndpointConfig) -> Self {
        self.factory = Some((factory, config));
        self
    }

    /// Adds or replaces a node record
    pub fn register_node(&self, info: NodeInfo) {
        let previous = self.nodes.insert(info.name.clone(), info.clone());
        let action = if previous.is_some() {
            Action::Update
        } else {
            Action::Create
        };
        if let Some(ref old) = previous {
            if old.address != info.address {
                self.endpoints.remove(&info.name);
            }
        }
        debug!("Node '{}' {:?} in cluster {:?}", info.name, action, info.cluster);
        self.events.publish_node(NodeEvent {
            node: info.name,
            action,
            address: Some(info.address),
            cluster: info.cluster,
            previous_cluster: previous.and_then(|p| p.cluster),
        });
    }

    /// Moves a node to another cluster, or out of any. Returns false for unknown nodes.
    pub fn set_node_cluster(&self, name: &str, cluster: Option<&str>) -> bool {
        let (previous, address) = match self.nodes.get_mut(name) {
            Some(mut node) => {
                let previous = std::mem::replace(&mut node.cluster, cluster.map(String::from));
                (previous, node.address.clone())
            }
            None => return false,
        };
        self.events.publish_node(NodeEvent {
            node: name.to_string(),
            action: Action::Update,
            address: Some(address),
            cluster: cluster.map(String::from),
            previous_cluster: previous,
        });
        true
    }

    pub fn update_health(&self, name: &str, health: NodeMetrics) -> bool {
        match self.nodes.get_mut(name) {
            Some(mut node) => {
                node.health = health;
                true
            }
            None => false,
        }
    }

    pub fn remove_node(&self, name: &str) -> Option<NodeInfo> {
        let (_, removed) = self.nodes.remove(name)?;
        self.endpoints.remove(name);
        self.containers.retain(|_, node| node.as_str() != name);
        self.events.publish_node(NodeEvent {
            node: name.to_string(),
            action: Action::Delete,
            address: Some(removed.address.clone()),
            cluster: None,
            previous_cluster: removed.cluster.clone(),
        });
        Some(removed)
    }

    pub fn attach_endpoint(&self, name: &str, endpoint: Arc<dyn DockerApi>) {
        self.endpoints.insert(name.to_string(), endpoint);
    }

    pub fn record_container(&self, container_id: &str, node: &str) {
        self.containers
            .insert(container_id.to_string(), node.to_string());
    }

    fn bind(&self, name: &str) -> Option<Arc<dyn DockerApi>> {
        let (factory, config) = self.factory.as_ref()?;
        let address = self.nodes.get(name)?.address.clone();
        match factory.for_node(name, &address, config) {
            Ok(endpoint) => {
                let endpoint: Arc<dyn DockerApi> = endpoint;
                Some(
                    self.endpoints
                        .entry(name.to_string())
                        .or_insert(endpoint)
                        .clone(),
                )
            }
            Err(e) => {
                warn!("Can not bind endpoint of node '{}' at {}: {}", name, address, e);
                None
            }
        }
    }
}

impl NodeDirectory for NodeStorage {
    fn nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    fn node(&self, name: &str) -> Option<NodeInfo> {
        self.nodes.get(name).map(|n| n.value().clone())
    }

    fn node_endpoint(&self, name: &str) -> Option<Arc<dyn DockerApi>> {
        if let Some(endpoint) = self.endpoints.get(name) {
            return Some(endpoint.value().clone());
        }
        self.bind(name)
    }

    fn container_node(&self, container_id: &str) -> Option<String> {
        if let Some(node) = self.containers.get(container_id) {
            return Some(node.value().clone());
        }
        self.containers
            .iter()
            .find(|e| e.key().starts_with(container_id) || container_id.starts_with(e.key().as_str()))
            .map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::transport::mock::MockTransportFactory;

    fn storage() -> (NodeStorage, EventBus) {
        let events = EventBus::new(64);
        (NodeStorage::new(events.clone()), events)
    }

    #[tokio::test]
    async fn test_register_and_move_publish_previous_cluster() {
        let (nodes, events) = storage();
        let mut rx = events.subscribe_nodes();

        nodes.register_node(NodeInfo::new("n1", "10.0.0.1:2375").with_cluster("a"));
        let created = rx.recv().await.unwrap();
        assert_eq!(created.action, Action::Create);
        assert_eq!(created.cluster.as_deref(), Some("a"));

        assert!(nodes.set_node_cluster("n1", Some("b")));
        let moved = rx.recv().await.unwrap();
        assert_eq!(moved.action, Action::Update);
        assert_eq!(moved.cluster.as_deref(), Some("b"));
        assert_eq!(moved.previous_cluster.as_deref(), Some("a"));
        assert!(!nodes.set_node_cluster("ghost", None));

        assert_eq!(nodes.nodes_in_cluster("b").len(), 1);
        assert!(nodes.nodes_in_cluster("a").is_empty());

        let removed = nodes.remove_node("n1").unwrap();
        assert_eq!(removed.name, "n1");
        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.action, Action::Delete);
        assert_eq!(deleted.previous_cluster.as_deref(), Some("b"));
        assert!(nodes.node("n1").is_none());
    }

    #[test]
    fn test_container_lookup_accepts_short_ids() {
        let (nodes, _) = storage();
        nodes.register_node(NodeInfo::new("n1", "10.0.0.1:2375"));
        nodes.record_container("abcdef0123456789", "n1");
        assert_eq!(nodes.container_node("abcdef0123456789").as_deref(), Some("n1"));
        assert_eq!(nodes.container_node("abcdef").as_deref(), Some("n1"));
        assert!(nodes.container_node("ffff").is_none());

        nodes.remove_node("n1");
        assert!(nodes.container_node("abcdef").is_none());
    }

    #[test]
    fn test_endpoint_is_bound_lazily_once() {
        let events = EventBus::new(64);
        let transports = Arc::new(MockTransportFactory::default());
        let factory = Arc::new(EndpointFactory::new(transports.clone(), events.clone()));
        let nodes = NodeStorage::new(events).with_endpoint_factory(factory, EndpointConfig::default());

        assert!(nodes.node_endpoint("n1").is_none());
        nodes.register_node(NodeInfo::new("n1", "10.0.0.1:2375"));
        let first = nodes.node_endpoint("n1").unwrap();
        let second = nodes.node_endpoint("n1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.node(), Some("n1"));
        assert_eq!(transports.transport("10.0.0.1:2375").call_count(), 0);
    }
}
