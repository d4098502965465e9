//! Runtime node group
//!
//! One `NodeGroup` exists per live config and only the registry creates
//! them. The config and the bound endpoint are replaced whole under a short
//! lock that is never held across an await point.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::docker::endpoint::InfoHook;
use crate::docker::info::{DockerServiceInfo, NodeInfo, NodeMetrics, NodeState};
use crate::docker::{AggregatingEndpoint, DockerApi, EndpointFactory};
use crate::events::{Action, EventBus, GroupEvent};
use crate::filter::{Filter, FilterFactory};
use crate::security::Acl;
use crate::store::KvMap;

use super::config::{GroupConfig, GroupKind, ManagedClusterConfig, SwarmModeClusterConfig, VirtualGroupConfig};
use super::containers::{ContainersManager, DockerContainersManager, SwarmModeContainersManager};
use super::nodes::{info_provider, NodeDirectory};
use super::RegistryError;

/// Shared collaborators of every group
pub struct GroupContext {
    pub events: EventBus,
    pub directory: Arc<dyn NodeDirectory>,
    pub endpoints: Arc<EndpointFactory>,
    pub filters: Arc<FilterFactory>,
    pub configs: Arc<KvMap<GroupConfig>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupFeature {
    /// Classic swarm behind one manager address
    Swarm,
    /// Backend runs services and tasks itself
    SwarmMode,
    /// Nodes join by matching the filter, never by explicit addition
    ForbidNodeAddition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InitState {
    Begin = 0,
    Initing = 1,
    Inited = 2,
    Failed = 3,
}

impl InitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => InitState::Initing,
            2 => InitState::Inited,
            3 => InitState::Failed,
            _ => InitState::Begin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupState {
    pub state: InitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl GroupState {
    pub fn is_ok(&self) -> bool {
        self.state == InitState::Inited
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Overlays live membership of a managed cluster on the backend's report.
/// Members the backend does not list yet are kept as pending.
pub fn apply_membership(group: &str, members: Vec<NodeInfo>, info: &mut DockerServiceInfo) {
    info.name = group.to_string();
    for member in members {
        if info.nodes.iter().any(|n| n.name == member.name) {
            continue;
        }
        info.nodes.push(NodeInfo {
            health: NodeMetrics::with_state(NodeState::Pending),
            ..member
        });
    }
    info.node_count = info.nodes.len() as u32;
    info.off_node_count = info
        .nodes
        .iter()
        .filter(|n| {
            !n.on
                || matches!(
                    n.health.state,
                    Some(NodeState::Pending) | Some(NodeState::Disconnected)
                )
        })
        .count() as u32;
}

/// Config fields whose change requires binding the backend again
fn requires_rebind(changed: &[String]) -> bool {
    changed
        .iter()
        .any(|f| matches!(f.as_str(), "endpoint" | "managers" | "node_filter"))
}

struct GroupInner {
    config: Arc<GroupConfig>,
    docker: Option<Arc<dyn DockerApi>>,
    containers: Option<Arc<dyn ContainersManager>>,
    filter: Option<Filter>,
}

struct Binding {
    docker: Arc<dyn DockerApi>,
    containers: Arc<dyn ContainersManager>,
    filter: Option<Filter>,
}

pub struct NodeGroup {
    name: String,
    features: Vec<GroupFeature>,
    ctx: Arc<GroupContext>,
    inner: Mutex<GroupInner>,
    state: AtomicU8,
    message: Mutex<Option<String>>,
    closed: AtomicBool,
    /// Serializes read-modify-write of the config
    update_lock: tokio::sync::Mutex<()>,
}

impl NodeGroup {
    pub(crate) fn new(config: GroupConfig, ctx: Arc<GroupContext>) -> Self {
        let features = match config.kind() {
            GroupKind::Managed => vec![GroupFeature::Swarm],
            GroupKind::SwarmMode => vec![GroupFeature::SwarmMode],
            GroupKind::Virtual => vec![GroupFeature::ForbidNodeAddition],
        };
        Self {
            name: config.name().to_string(),
            features,
            ctx,
            inner: Mutex::new(GroupInner {
                config: Arc::new(config),
                docker: None,
                containers: None,
                filter: None,
            }),
            state: AtomicU8::new(InitState::Begin as u8),
            message: Mutex::new(None),
            closed: AtomicBool::new(false),
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, GroupInner> {
        // writers only swap whole values, a poisoned guard is still consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> &[GroupFeature] {
        &self.features
    }

    pub fn kind(&self) -> GroupKind {
        self.inner().config.kind()
    }

    /// Whether nodes claiming this group are swarm members
    pub fn is_swarm(&self) -> bool {
        self.features
            .iter()
            .any(|f| matches!(f, GroupFeature::Swarm | GroupFeature::SwarmMode))
    }

    pub fn get_config(&self) -> GroupConfig {
        self.inner().config.as_ref().clone()
    }

    pub fn acl(&self) -> Acl {
        self.inner().config.common().acl.clone()
    }

    pub fn state(&self) -> GroupState {
        let message = self.message.lock().ok().and_then(|m| m.clone());
        GroupState {
            state: InitState::from_u8(self.state.load(Ordering::Acquire)),
            message,
        }
    }

    fn set_state(&self, state: InitState, message: Option<String>) {
        if let Ok(mut slot) = self.message.lock() {
            *slot = message;
        }
        self.state.store(state as u8, Ordering::Release);
    }

    /// Error message of a failed init, carried by update events
    fn error_message(&self) -> Option<String> {
        let state = self.state();
        match state.state {
            InitState::Failed => state.message,
            _ => None,
        }
    }

    pub fn docker(&self) -> Option<Arc<dyn DockerApi>> {
        self.inner().docker.clone()
    }

    pub fn containers(&self) -> Option<Arc<dyn ContainersManager>> {
        self.inner().containers.clone()
    }

    // ------------------------------------------------------------------------
    // Binding
    // ------------------------------------------------------------------------

    /// Claims the right to bind. Only one caller binds at a time and a bound
    /// group is never bound again.
    fn begin_init(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            match InitState::from_u8(current) {
                InitState::Inited | InitState::Initing => return false,
                InitState::Begin | InitState::Failed => {
                    if self
                        .state
                        .compare_exchange(current, InitState::Initing as u8, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                }
            }
        }
    }

    /// Binds the group to its backend. Safe to call any number of times,
    /// failures are recorded in `state()` and retried on the next call.
    pub async fn init(&self) {
        if self.closed.load(Ordering::Acquire) || !self.begin_init() {
            return;
        }
        let config = self.inner().config.clone();
        let bound = match config.as_ref() {
            GroupConfig::Virtual(c) => self.bind_virtual(c),
            GroupConfig::Managed(c) => self.bind_managed(c),
            GroupConfig::SwarmMode(c) => self.bind_swarm_mode(c).await,
        };
        match bound {
            Ok(binding) => {
                {
                    let mut inner = self.inner();
                    if !Arc::ptr_eq(&inner.config, &config) {
                        // config replaced meanwhile, the next init binds it
                        drop(inner);
                        self.set_state(InitState::Begin, None);
                        return;
                    }
                    inner.docker = Some(binding.docker);
                    inner.containers = Some(binding.containers);
                    inner.filter = binding.filter;
                }
                self.set_state(InitState::Inited, None);
                debug!("Group '{}' bound", self.name);
            }
            Err(e) => {
                error!("Can not init group '{}': {}", self.name, e);
                self.set_state(InitState::Failed, Some(e.to_string()));
            }
        }
    }

    fn bind_virtual(&self, config: &VirtualGroupConfig) -> Result<Binding, RegistryError> {
        let filter = self.ctx.filters.parse(&config.node_filter)?;
        let directory = self.ctx.directory.clone();

        let members = {
            let directory = directory.clone();
            let filter = filter.clone();
            Arc::new(move || {
                directory
                    .nodes()
                    .into_iter()
                    .filter(|n| filter.matches(n))
                    .map(|n| n.name)
                    .collect::<Vec<_>>()
            })
        };
        let node_endpoint = {
            let directory = directory.clone();
            Arc::new(move |node: &str| directory.node_endpoint(node))
        };
        let container_endpoint = {
            let directory = directory.clone();
            Arc::new(move |id: &str| {
                directory
                    .container_node(id)
                    .and_then(|node| directory.node_endpoint(&node))
            })
        };
        let docker: Arc<dyn DockerApi> = Arc::new(
            AggregatingEndpoint::new(&self.name, members, node_endpoint, container_endpoint)
                .with_node_info(info_provider(directory)),
        );
        Ok(Binding {
            containers: Arc::new(DockerContainersManager::new(docker.clone())),
            docker,
            filter: Some(filter),
        })
    }

    fn bind_managed(&self, config: &ManagedClusterConfig) -> Result<Binding, RegistryError> {
        let name = self.name.clone();
        let directory = self.ctx.directory.clone();
        let hook: InfoHook = Arc::new(move |info: &mut DockerServiceInfo| {
            apply_membership(&name, directory.nodes_in_cluster(&name), info);
        });
        let endpoint = self.ctx.endpoints.for_cluster(
            &self.name,
            &config.endpoint,
            Some(info_provider(self.ctx.directory.clone())),
            Some(hook),
        )?;
        let docker: Arc<dyn DockerApi> = endpoint;
        Ok(Binding {
            containers: Arc::new(DockerContainersManager::new(docker.clone())),
            docker,
            filter: None,
        })
    }

    async fn bind_swarm_mode(&self, config: &SwarmModeClusterConfig) -> Result<Binding, RegistryError> {
        let name = self.name.clone();
        let hook: InfoHook = Arc::new(move |info: &mut DockerServiceInfo| {
            info.name = name.clone();
        });
        let endpoint = self.ctx.endpoints.for_cluster(
            &self.name,
            &config.endpoint,
            Some(info_provider(self.ctx.directory.clone())),
            Some(hook),
        )?;
        let swarm = endpoint.inspect_swarm().await?;
        if swarm.is_none() {
            return Err(RegistryError::NotSupported(format!(
                "backend of '{}' is not a swarm manager",
                self.name
            )));
        }
        let docker: Arc<dyn DockerApi> = endpoint;
        let containers = SwarmModeContainersManager::new(
            docker.clone(),
            self.ctx.directory.clone(),
            config.endpoint.cache_time_after_write(),
        );
        Ok(Binding {
            containers: Arc::new(containers),
            docker,
            filter: None,
        })
    }

    // ------------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------------

    /// Applies `mutate` to a copy of the config, persists it and publishes
    /// an update event naming the changed fields.
    pub async fn update_config<F>(&self, mutate: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut GroupConfig) + Send,
    {
        let _serial = self.update_lock.lock().await;
        let current = self.inner().config.clone();
        let mut next = current.as_ref().clone();
        mutate(&mut next);
        if next.name() != self.name {
            return Err(RegistryError::IllegalOperation(format!(
                "can not rename group '{}'",
                self.name
            )));
        }
        if next.kind() != current.kind() {
            return Err(RegistryError::IllegalOperation(format!(
                "can not change kind of group '{}'",
                self.name
            )));
        }
        next.validate()?;
        let changed = current.changed_fields(&next);
        if changed.is_empty() {
            return Ok(());
        }
        self.ctx.configs.put(&self.name, &next).await?;
        self.replace_config(next, changed).await;
        Ok(())
    }

    pub async fn set_config(&self, config: GroupConfig) -> Result<(), RegistryError> {
        self.update_config(move |c| *c = config).await
    }

    /// Takes a config that is already persisted
    pub(crate) async fn replace_config(&self, next: GroupConfig, changed: Vec<String>) {
        let rebind = requires_rebind(&changed);
        {
            let mut inner = self.inner();
            inner.config = Arc::new(next);
            if rebind {
                inner.docker = None;
                inner.containers = None;
                inner.filter = None;
            }
        }
        if rebind {
            info!("Group '{}' changed {:?}, binding again", self.name, changed);
            self.set_state(InitState::Begin, None);
            self.init().await;
        }
        self.ctx.events.publish_group(
            GroupEvent::new(&self.name, Action::Update, self.error_message()).with_changed(changed),
        );
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    pub fn get_nodes(&self) -> Vec<NodeInfo> {
        let (kind, filter) = {
            let inner = self.inner();
            (inner.config.kind(), inner.filter.clone())
        };
        match kind {
            GroupKind::Virtual => {
                let filter = match filter {
                    Some(f) => f,
                    None => {
                        let expr = match self.get_config() {
                            GroupConfig::Virtual(c) => c.node_filter,
                            _ => return Vec::new(),
                        };
                        match self.ctx.filters.parse(&expr) {
                            Ok(f) => f,
                            Err(e) => {
                                warn!("Group '{}' has a broken filter: {}", self.name, e);
                                return Vec::new();
                            }
                        }
                    }
                };
                self.ctx
                    .directory
                    .nodes()
                    .into_iter()
                    .filter(|n| filter.matches(n))
                    .collect()
            }
            _ => self.ctx.directory.nodes_in_cluster(&self.name),
        }
    }

    pub fn has_node(&self, node: &str) -> bool {
        self.get_nodes().iter().any(|n| n.name == node)
    }

    /// Real clusters visible through a virtual group, empty for real clusters
    pub fn get_groups(&self) -> Vec<String> {
        if self.kind() != GroupKind::Virtual {
            return Vec::new();
        }
        self.get_nodes()
            .into_iter()
            .filter_map(|n| n.cluster)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Releases the backend binding. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.inner();
        inner.docker = None;
        inner.containers = None;
        debug!("Group '{}' closed", self.name);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for NodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeGroup")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::config::EndpointConfig;
    use crate::cluster::nodes::NodeStorage;
    use crate::docker::transport::mock::MockTransportFactory;
    use crate::docker::transport::Method;
    use crate::store::InMemoryStore;
    use serde_json::json;

    pub(crate) struct Fixture {
        pub ctx: Arc<GroupContext>,
        pub nodes: Arc<NodeStorage>,
        pub transports: Arc<MockTransportFactory>,
        pub events: EventBus,
    }

    pub(crate) fn fixture() -> Fixture {
        let events = EventBus::new(256);
        let transports = Arc::new(MockTransportFactory::default());
        let endpoints = Arc::new(EndpointFactory::new(transports.clone(), events.clone()));
        let nodes = Arc::new(
            NodeStorage::new(events.clone()).with_endpoint_factory(endpoints.clone(), EndpointConfig::default()),
        );
        let store = Arc::new(InMemoryStore::new());
        let ctx = Arc::new(GroupContext {
            events: events.clone(),
            directory: nodes.clone(),
            endpoints,
            filters: Arc::new(FilterFactory::new()),
            configs: Arc::new(KvMap::new(store, "clusters")),
        });
        Fixture {
            ctx,
            nodes,
            transports,
            events,
        }
    }

    #[test]
    fn test_apply_membership_keeps_unseen_members_pending() {
        let mut info = DockerServiceInfo {
            name: "backend-name".to_string(),
            nodes: vec![NodeInfo::new("n1", "10.0.0.1:2375")],
            ..DockerServiceInfo::default()
        };
        let mut off = NodeInfo::new("n3", "10.0.0.3:2375");
        off.on = false;
        apply_membership(
            "prod",
            vec![NodeInfo::new("n1", "10.0.0.1:2375"), NodeInfo::new("n2", "10.0.0.2:2375"), off],
            &mut info,
        );
        assert_eq!(info.name, "prod");
        assert_eq!(info.node_count, 3);
        assert_eq!(info.off_node_count, 2);
        let n2 = info.nodes.iter().find(|n| n.name == "n2").unwrap();
        assert_eq!(n2.health.state, Some(NodeState::Pending));
    }

    #[tokio::test]
    async fn test_virtual_group_membership_and_groups() {
        let fx = fixture();
        fx.nodes.register_node(NodeInfo::new("n1", "10.0.0.1:2375").with_label("zone", "edge").with_cluster("a"));
        fx.nodes.register_node(NodeInfo::new("n2", "10.0.0.2:2375").with_label("zone", "edge").with_cluster("b"));
        fx.nodes.register_node(NodeInfo::new("n3", "10.0.0.3:2375").with_label("zone", "core").with_cluster("a"));

        let group = NodeGroup::new(GroupConfig::virtual_group("edge", "label:zone=edge"), fx.ctx.clone());
        assert!(group.features().contains(&GroupFeature::ForbidNodeAddition));
        assert!(group.has_node("n1"));
        assert!(!group.has_node("n3"));
        assert_eq!(group.get_groups(), vec!["a", "b"]);

        group.init().await;
        assert!(group.state().is_ok());
        assert!(group.docker().is_some());
        let err = group
            .containers()
            .unwrap()
            .create_service(&crate::docker::model::ServiceSpec::new("web", "nginx"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::docker::EndpointError::NotSupported(_)));
    }

    #[tokio::test]
    async fn test_debug_names_group_and_state() {
        let fx = fixture();
        let group = NodeGroup::new(GroupConfig::virtual_group("edge", "any:*"), fx.ctx.clone());
        let shown = format!("{:?}", group);
        assert!(shown.contains("\"edge\""));
        assert!(shown.contains("Virtual"));
        assert!(shown.contains("Begin"));
    }

    #[tokio::test]
    async fn test_managed_init_is_idempotent() {
        let fx = fixture();
        let endpoint = EndpointConfig::default().with_host("10.1.0.1:2375");
        let group = NodeGroup::new(GroupConfig::managed("prod", endpoint), fx.ctx.clone());
        assert_eq!(group.state().state, InitState::Begin);
        group.init().await;
        let first = group.docker().unwrap();
        group.init().await;
        let second = group.docker().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.cluster(), Some("prod"));
    }

    #[tokio::test]
    async fn test_managed_info_overlays_group_name_and_members() {
        let fx = fixture();
        let mock = fx.transports.transport("10.1.0.1:2375");
        mock.set_json(
            Method::Get,
            "/info",
            200,
            json!({"ID": "x", "Name": "swarm-manager", "Containers": 4, "ContainersRunning": 3}),
        );
        fx.nodes.register_node(NodeInfo::new("n1", "10.0.0.1:2375").with_cluster("prod"));
        let endpoint = EndpointConfig::default().with_host("10.1.0.1:2375");
        let group = NodeGroup::new(GroupConfig::managed("prod", endpoint), fx.ctx.clone());
        group.init().await;

        let info = group.docker().unwrap().get_info().await.unwrap();
        assert_eq!(info.name, "prod");
        assert_eq!(info.node_count, 1);
        assert_eq!(info.off_node_count, 1);
    }

    #[tokio::test]
    async fn test_failed_init_is_reported_and_retried() {
        let fx = fixture();
        // no hosts: binding fails
        let group = NodeGroup::new(GroupConfig::managed("prod", EndpointConfig::default()), fx.ctx.clone());
        group.init().await;
        let state = group.state();
        assert_eq!(state.state, InitState::Failed);
        assert!(state.message.unwrap().contains("no hosts"));
        assert!(group.docker().is_none());

        let mut rx = fx.events.subscribe_groups();
        group
            .update_config(|c| {
                if let GroupConfig::Managed(m) = c {
                    m.endpoint.hosts.push("10.1.0.1:2375".to_string());
                }
            })
            .await
            .unwrap();
        assert!(group.state().is_ok());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.action, Action::Update);
        assert_eq!(event.changed, vec!["endpoint"]);
        assert_eq!(event.severity, crate::events::Severity::Info);
        let stored = fx.ctx.configs.get("prod").await.unwrap().unwrap();
        assert_eq!(stored, group.get_config());
    }

    #[tokio::test]
    async fn test_swarm_mode_requires_manager() {
        let fx = fixture();
        let endpoint = EndpointConfig::default().with_host("10.2.0.1:2375");
        let group = NodeGroup::new(
            GroupConfig::swarm_mode("sm", endpoint, vec!["m1".to_string()]),
            fx.ctx.clone(),
        );
        group.init().await;
        assert_eq!(group.state().state, InitState::Failed);

        fx.transports
            .transport("10.2.0.1:2375")
            .set_json(Method::Get, "/swarm", 200, json!({"ID": "swarm-1"}));
        group.init().await;
        assert!(group.state().is_ok());
        assert!(group.features().contains(&GroupFeature::SwarmMode));
    }

    #[tokio::test]
    async fn test_update_rejects_rename_and_publishes_nothing_without_change() {
        let fx = fixture();
        let group = NodeGroup::new(GroupConfig::virtual_group("edge", "any:*"), fx.ctx.clone());
        let err = group
            .update_config(|c| c.common_mut().name = "other".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::IllegalOperation(_)));

        let mut rx = fx.events.subscribe_groups();
        group.update_config(|_| {}).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let fx = fixture();
        let group = NodeGroup::new(GroupConfig::virtual_group("edge", "any:*"), fx.ctx.clone());
        group.init().await;
        group.close();
        group.close();
        assert!(group.is_closed());
        assert!(group.docker().is_none());
        group.init().await;
        assert!(group.docker().is_none());
    }
}
