//! Fan-out endpoint over the nodes of a virtual group
//!
//! Listings are merged from every member whose endpoint is bound and not
//! inside an offline backoff window.
//! Authorization failures of single members are expected and swallowed.
//! Point operations are routed to the endpoint owning the container.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cache::SingleValueCache;
use super::info::{DockerServiceInfo, NodeInfo, NodeInfoProvider, NodeMetrics, NodeState};
use super::model::*;
use super::{CallResult, DockerApi, EndpointError};

/// Names of the nodes currently in the group
pub type NodeList = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Endpoint of a node, or of the node owning a container
pub type EndpointResolver = Arc<dyn Fn(&str) -> Option<Arc<dyn DockerApi>> + Send + Sync>;

pub struct AggregatingEndpoint {
    id: String,
    nodes: NodeList,
    node_endpoint: EndpointResolver,
    container_endpoint: EndpointResolver,
    node_info: Option<Arc<dyn NodeInfoProvider>>,
    /// container id -> node, learned from listings
    owners: DashMap<String, String>,
    info_cache: SingleValueCache<Arc<DockerServiceInfo>>,
}

impl AggregatingEndpoint {
    pub fn new(
        id: &str,
        nodes: NodeList,
        node_endpoint: EndpointResolver,
        container_endpoint: EndpointResolver,
    ) -> Self {
        Self {
            id: id.to_string(),
            nodes,
            node_endpoint,
            container_endpoint,
            node_info: None,
            owners: DashMap::new(),
            info_cache: SingleValueCache::new(Duration::from_secs(10)),
        }
    }

    pub fn with_node_info(mut self, provider: Arc<dyn NodeInfoProvider>) -> Self {
        self.node_info = Some(provider);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.info_cache = SingleValueCache::new(ttl);
        self
    }

    fn unknown_container(id: &str) -> CallResult {
        CallResult::error(format!("Can not find service for container: {}", id))
    }

    /// Available endpoints of the current members
    fn members(&self) -> Vec<(String, Arc<dyn DockerApi>)> {
        (self.nodes)()
            .into_iter()
            .filter_map(|node| {
                let endpoint = (self.node_endpoint)(&node)?;
                if !endpoint.is_available() {
                    debug!("Skipping offline node {} of {}", node, self.id);
                    return None;
                }
                Some((node, endpoint))
            })
            .collect()
    }

    /// Run `op` on every online member, keeping the successful results
    async fn collect<T, F, Fut>(&self, what: &str, op: F) -> Vec<(String, Vec<T>)>
    where
        F: Fn(Arc<dyn DockerApi>) -> Fut,
        Fut: Future<Output = Result<Vec<T>, EndpointError>>,
    {
        let members = self.members();
        let calls = members.iter().map(|(_, endpoint)| op(endpoint.clone()));
        let results = join_all(calls).await;
        members
            .into_iter()
            .zip(results)
            .filter_map(|((node, _), result)| match result {
                Ok(items) => Some((node, items)),
                Err(e) if e.is_unauthorized() => {
                    debug!("No access to {} of node {}", what, node);
                    None
                }
                Err(e) => {
                    warn!("Can not list {} of node {}: {}", what, node, e);
                    None
                }
            })
            .collect()
    }

    fn owner(&self, container_id: &str) -> Option<Arc<dyn DockerApi>> {
        if let Some(endpoint) = (self.container_endpoint)(container_id) {
            return Some(endpoint);
        }
        let node = match self.owners.get(container_id) {
            Some(node) => node.clone(),
            // short ids are prefixes of the full id
            None => self
                .owners
                .iter()
                .find(|e| e.key().starts_with(container_id))
                .map(|e| e.value().clone())?,
        };
        (self.node_endpoint)(&node)
    }

    /// Delegate a point operation to the container's owner
    async fn on_owner<F, Fut>(&self, id: &str, op: F) -> Result<CallResult, EndpointError>
    where
        F: FnOnce(Arc<dyn DockerApi>) -> Fut,
        Fut: Future<Output = Result<CallResult, EndpointError>>,
    {
        match self.owner(id) {
            Some(endpoint) if endpoint.is_available() => op(endpoint).await,
            _ => Ok(Self::unknown_container(id)),
        }
    }

    async fn load_info(&self) -> Result<Arc<DockerServiceInfo>, EndpointError> {
        let mut info = DockerServiceInfo {
            id: self.id.clone(),
            name: self.id.clone(),
            ..Default::default()
        };
        let names = (self.nodes)();
        let mut probes = Vec::new();
        for name in &names {
            let record = self.node_info.as_ref().and_then(|p| p.node_info(name));
            let endpoint = (self.node_endpoint)(name);
            probes.push((name.clone(), record, endpoint));
        }
        let infos = join_all(probes.iter().map(|(_, _, endpoint)| async move {
            match endpoint {
                Some(e) if e.is_available() => e.get_info().await.ok(),
                _ => None,
            }
        }))
        .await;

        for ((name, record, _), node_info) in probes.into_iter().zip(infos) {
            let mut node = record.unwrap_or_else(|| NodeInfo::new(&name, ""));
            match node_info {
                Some(ref ni) => {
                    info.containers += ni.containers;
                    info.off_containers += ni.off_containers;
                    info.images += ni.images;
                    info.ncpu += ni.ncpu;
                    info.memory += ni.memory;
                    if !node.on {
                        info.off_node_count += 1;
                    }
                }
                None => {
                    // unreachable and powered off look the same from here
                    info.off_node_count += 1;
                    node.health = node
                        .health
                        .merge_non_null(&NodeMetrics::with_state(NodeState::Disconnected));
                }
            }
            info.nodes.push(node);
        }
        info.node_count = names.len() as u32;
        Ok(Arc::new(info))
    }
}

#[async_trait]
impl DockerApi for AggregatingEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn cluster(&self) -> Option<&str> {
        Some(&self.id)
    }

    fn node(&self) -> Option<&str> {
        None
    }

    fn is_online(&self) -> bool {
        true
    }

    async fn get_info(&self) -> Result<Arc<DockerServiceInfo>, EndpointError> {
        self.info_cache.get_or_load(|| self.load_info()).await
    }

    async fn list_containers(&self, arg: &GetContainersArg) -> Result<Vec<Container>, EndpointError> {
        let members: HashSet<String> = (self.nodes)().into_iter().collect();
        self.owners.retain(|_, node| members.contains(node.as_str()));
        let per_node = self
            .collect("containers", |e| {
                let arg = arg.clone();
                async move { e.list_containers(&arg).await }
            })
            .await;
        let mut all = Vec::new();
        for (node, containers) in per_node {
            // only a listing with stopped containers is complete for the node
            if arg.all {
                let listed: HashSet<&str> = containers.iter().map(|c| c.id.as_str()).collect();
                self.owners
                    .retain(|id, owner| *owner != node || listed.contains(id.as_str()));
            }
            for mut container in containers {
                self.owners.insert(container.id.clone(), node.clone());
                container.node = Some(node.clone());
                all.push(container);
            }
        }
        Ok(all)
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerDetails>, EndpointError> {
        if let Some(endpoint) = self.owner(id).filter(|e| e.is_available()) {
            return endpoint.get_container(id).await;
        }
        // unknown owner, first member that knows the container wins
        for (node, endpoint) in self.members() {
            match endpoint.get_container(id).await {
                Ok(Some(details)) => {
                    self.owners.insert(details.id.clone(), node);
                    return Ok(Some(details));
                }
                Ok(None) => {}
                Err(e) => debug!("Lookup of {} on {} failed: {}", id, node, e),
            }
        }
        Ok(None)
    }

    async fn create_container(&self, _cmd: &CreateContainerCmd) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("create container"))
    }

    async fn start_container(&self, id: &str) -> Result<CallResult, EndpointError> {
        self.on_owner(id, |e| async move { e.start_container(id).await })
            .await
    }

    async fn stop_container(&self, arg: &StopContainerArg) -> Result<CallResult, EndpointError> {
        self.on_owner(&arg.id, |e| async move { e.stop_container(arg).await })
            .await
    }

    async fn restart_container(&self, arg: &StopContainerArg) -> Result<CallResult, EndpointError> {
        self.on_owner(&arg.id, |e| async move { e.restart_container(arg).await })
            .await
    }

    async fn kill_container(&self, id: &str, signal: Option<&str>) -> Result<CallResult, EndpointError> {
        self.on_owner(id, |e| async move { e.kill_container(id, signal).await })
            .await
    }

    async fn pause_container(&self, id: &str) -> Result<CallResult, EndpointError> {
        self.on_owner(id, |e| async move { e.pause_container(id).await })
            .await
    }

    async fn unpause_container(&self, id: &str) -> Result<CallResult, EndpointError> {
        self.on_owner(id, |e| async move { e.unpause_container(id).await })
            .await
    }

    async fn delete_container(&self, arg: &DeleteContainerArg) -> Result<CallResult, EndpointError> {
        let result = self
            .on_owner(&arg.id, |e| async move { e.delete_container(arg).await })
            .await;
        if matches!(result, Ok(ref r) if r.is_ok()) {
            self.owners.remove(&arg.id);
        }
        result
    }

    async fn update_container(&self, cmd: &UpdateContainerCmd) -> Result<CallResult, EndpointError> {
        self.on_owner(&cmd.id, |e| async move { e.update_container(cmd).await })
            .await
    }

    async fn rename_container(&self, _id: &str, _new_name: &str) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("rename container"))
    }

    async fn container_logs(
        &self,
        arg: &GetLogsArg,
        sink: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<CallResult, EndpointError> {
        self.on_owner(&arg.id, |e| async move { e.container_logs(arg, sink, cancel).await })
            .await
    }

    async fn container_stats(
        &self,
        id: &str,
        sink: mpsc::Sender<serde_json::Value>,
        cancel: CancellationToken,
    ) -> Result<CallResult, EndpointError> {
        self.on_owner(id, |e| async move { e.container_stats(id, sink, cancel).await })
            .await
    }

    async fn subscribe_events(
        &self,
        _sink: mpsc::Sender<DockerEvent>,
        _cancel: CancellationToken,
    ) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("subscribe events"))
    }

    async fn list_services(&self) -> Result<Vec<Service>, EndpointError> {
        let per_node = self.collect("services", |e| async move { e.list_services().await }).await;
        Ok(per_node.into_iter().flat_map(|(_, items)| items).collect())
    }

    async fn get_service(&self, id: &str) -> Result<Option<Service>, EndpointError> {
        for (node, endpoint) in self.members() {
            match endpoint.get_service(id).await {
                Ok(Some(service)) => return Ok(Some(service)),
                Ok(None) => {}
                Err(e) => debug!("Lookup of service {} on {} failed: {}", id, node, e),
            }
        }
        Ok(None)
    }

    async fn create_service(&self, _spec: &ServiceSpec) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("create service"))
    }

    async fn update_service(&self, _cmd: &UpdateServiceCmd) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("update service"))
    }

    async fn delete_service(&self, _id: &str) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("delete service"))
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, EndpointError> {
        let per_node = self
            .collect("tasks", |e| {
                let filter = filter.clone();
                async move { e.list_tasks(&filter).await }
            })
            .await;
        Ok(per_node.into_iter().flat_map(|(_, items)| items).collect())
    }

    async fn service_logs(
        &self,
        _arg: &GetLogsArg,
        _sink: mpsc::Sender<String>,
        _cancel: CancellationToken,
    ) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("service logs"))
    }

    async fn pull_image(&self, _name: &str) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("pull image"))
    }

    async fn list_images(&self, arg: &GetImagesArg) -> Result<Vec<ImageItem>, EndpointError> {
        let per_node = self
            .collect("images", |e| {
                let arg = arg.clone();
                async move { e.list_images(&arg).await }
            })
            .await;
        let mut all = Vec::new();
        for (node, images) in per_node {
            all.extend(images.into_iter().map(|mut image| {
                image.node = Some(node.clone());
                image
            }));
        }
        Ok(all)
    }

    async fn inspect_image(&self, name: &str) -> Result<Option<ImageDetails>, EndpointError> {
        for (node, endpoint) in self.members() {
            match endpoint.inspect_image(name).await {
                Ok(Some(image)) => return Ok(Some(image)),
                Ok(None) => {}
                Err(e) => debug!("Lookup of image {} on {} failed: {}", name, node, e),
            }
        }
        Ok(None)
    }

    async fn remove_image(&self, _name: &str, _force: bool) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("remove image"))
    }

    async fn create_network(&self, _cmd: &CreateNetworkCmd) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("create network"))
    }

    async fn list_networks(&self) -> Result<Vec<Network>, EndpointError> {
        let per_node = self.collect("networks", |e| async move { e.list_networks().await }).await;
        Ok(per_node.into_iter().flat_map(|(_, items)| items).collect())
    }

    async fn delete_network(&self, _id: &str) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("delete network"))
    }

    async fn init_swarm(&self, _cmd: &SwarmInitCmd) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("init swarm"))
    }

    async fn join_swarm(&self, _cmd: &SwarmJoinCmd) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("join swarm"))
    }

    async fn leave_swarm(&self, _force: bool) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("leave swarm"))
    }

    async fn inspect_swarm(&self) -> Result<Option<SwarmInspect>, EndpointError> {
        Err(EndpointError::NotSupported("inspect swarm"))
    }

    async fn list_nodes(&self) -> Result<Vec<SwarmNode>, EndpointError> {
        let per_node = self.collect("nodes", |e| async move { e.list_nodes().await }).await;
        Ok(per_node.into_iter().flat_map(|(_, items)| items).collect())
    }

    async fn update_node(&self, _cmd: &UpdateNodeCmd) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("update node"))
    }

    async fn remove_node(&self, _id: &str, _force: bool) -> Result<CallResult, EndpointError> {
        Err(EndpointError::NotSupported("remove node"))
    }
}
