//! Cluster registry
//!
//! Single owner of every `NodeGroup`. Configs are persisted under the
//! `clusters` prefix of the key-value store and groups are rebuilt from
//! them on load. Creation is checked against the caller's right to create
//! groups, every look-up against its right to read the group found.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, OnceCell};
use tracing::{debug, error, info, warn};

use crate::docker::info::NodeInfo;
use crate::docker::EndpointFactory;
use crate::events::{Action as EventAction, EventBus, GroupEvent, NodeEvent};
use crate::filter::{FilterError, FilterFactory, NodePredicate, ANY};
use crate::security::{AccessContext, Acl, Action, ObjectId, SystemContext, ROLE_USER};
use crate::store::{self, KvMap, KvMapEvent, KvStore, Origin};

use super::config::{validate_name, EndpointConfig, GroupConfig, GroupKind};
use super::discovery::{SwarmDiscovery, DEFAULT_DISCOVERY_TTL};
use super::group::{GroupContext, InitState, NodeGroup};
use super::nodes::NodeDirectory;
use super::RegistryError;

/// Virtual group of every known node
pub const GROUP_ALL: &str = "all";
/// Virtual group of nodes outside any swarm
pub const GROUP_ORPHANS: &str = "orphans";
pub const ORPHANS_FILTER: &str = "orphans:*";
/// Store prefix of group configs
pub const CLUSTERS_PREFIX: &str = "clusters";

/// Builds the config of a group created on first access
pub type ConfigFactory = Box<dyn FnOnce(&str) -> GroupConfig + Send>;

type GroupMap = DashMap<String, Arc<NodeGroup>>;

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Workers handling node events
    pub dispatch_workers: usize,
    /// Node events waiting for a worker before new ones are dropped
    pub dispatch_queue: usize,
    pub discovery_ttl: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            dispatch_workers: 4,
            dispatch_queue: 256,
            discovery_ttl: DEFAULT_DISCOVERY_TTL,
        }
    }
}

impl RegistryOptions {
    pub fn with_dispatch_workers(mut self, workers: usize) -> Self {
        self.dispatch_workers = workers.max(1);
        self
    }

    pub fn with_discovery_ttl(mut self, ttl: Duration) -> Self {
        self.discovery_ttl = ttl;
        self
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// A node is an orphan unless it claims an existing swarm-type group
fn is_orphan(node: &NodeInfo, groups: &Weak<GroupMap>) -> bool {
    let Some(cluster) = node.cluster.as_deref() else {
        return true;
    };
    let Some(groups) = groups.upgrade() else {
        return true;
    };
    let group = groups.get(cluster).map(|g| g.value().clone());
    group.map_or(true, |g| !g.is_swarm())
}

fn system_group(name: &str, filter: &str) -> GroupConfig {
    let mut config = GroupConfig::virtual_group(name, filter);
    config.common_mut().acl = Acl::default().grant(&format!("role:{}", ROLE_USER), &[Action::Read]);
    config
}

fn is_system_group(name: &str) -> bool {
    name == GROUP_ALL || name == GROUP_ORPHANS
}

#[derive(Clone)]
pub struct ClusterRegistry {
    groups: Arc<GroupMap>,
    ctx: Arc<GroupContext>,
    discovery: Arc<SwarmDiscovery>,
    options: RegistryOptions,
    loaded: Arc<OnceCell<()>>,
}

impl ClusterRegistry {
    pub fn new(
        store: Arc<dyn KvStore>,
        directory: Arc<dyn NodeDirectory>,
        endpoints: Arc<EndpointFactory>,
        events: EventBus,
        options: RegistryOptions,
    ) -> Self {
        let groups: Arc<GroupMap> = Arc::new(DashMap::new());
        let filters = Arc::new(FilterFactory::new());
        let weak = Arc::downgrade(&groups);
        filters.register(
            "orphans",
            Arc::new(move |_arg: &str| -> Result<NodePredicate, FilterError> {
                let groups = weak.clone();
                Ok(Arc::new(move |node: &NodeInfo| is_orphan(node, &groups)))
            }),
        );
        let ctx = Arc::new(GroupContext {
            events,
            directory,
            endpoints,
            filters,
            configs: Arc::new(KvMap::new(store.clone(), CLUSTERS_PREFIX)),
        });
        Self {
            groups,
            ctx,
            discovery: Arc::new(SwarmDiscovery::new(store, options.discovery_ttl)),
            options,
            loaded: Arc::new(OnceCell::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn filters(&self) -> &FilterFactory {
        &self.ctx.filters
    }

    /// Rebuilds groups from the store and creates the system groups.
    /// Only the first call does any work.
    pub async fn load(&self) -> Result<(), RegistryError> {
        self.loaded
            .get_or_try_init(|| self.load_inner())
            .await
            .map(|_| ())
    }

    async fn load_inner(&self) -> Result<(), RegistryError> {
        let stored = self.ctx.configs.load_all().await?;
        info!("Loading {} groups from storage", stored.len());
        for (name, config) in stored {
            if config.name() != name {
                error!("Group record '{}' holds config of '{}', skipped", name, config.name());
                continue;
            }
            if let Err(e) = config.validate() {
                error!("Group record '{}' is invalid, skipped: {}", name, e);
                continue;
            }
            self.groups
                .insert(name, Arc::new(NodeGroup::new(config, self.ctx.clone())));
        }
        for (name, filter) in [(GROUP_ALL, ANY), (GROUP_ORPHANS, ORPHANS_FILTER)] {
            if !self.groups.contains_key(name) {
                self.get_or_create_group(&SystemContext, system_group(name, filter))
                    .await?;
            }
        }
        let groups = self.snapshot();
        join_all(groups.iter().map(|g| g.init())).await;
        Ok(())
    }

    /// Groups sorted by name, detached from the map
    fn snapshot(&self) -> Vec<Arc<NodeGroup>> {
        let mut groups: Vec<Arc<NodeGroup>> = self.groups.iter().map(|e| e.value().clone()).collect();
        groups.sort_by(|a, b| a.name().cmp(b.name()));
        groups
    }

    fn find(&self, name: &str) -> Option<Arc<NodeGroup>> {
        self.groups.get(name).map(|g| g.value().clone())
    }

    fn assert_readable(&self, ac: &dyn AccessContext, group: &NodeGroup) -> Result<(), RegistryError> {
        let acl = group.acl();
        ac.assert_granted(&ObjectId::Cluster(group.name().to_string()), Some(&acl), Action::Read)?;
        Ok(())
    }

    fn is_readable(ac: &dyn AccessContext, group: &NodeGroup) -> bool {
        let acl = group.acl();
        ac.is_granted(&ObjectId::Cluster(group.name().to_string()), Some(&acl), Action::Read)
    }

    pub fn get_cluster(&self, ac: &dyn AccessContext, name: &str) -> Result<Option<Arc<NodeGroup>>, RegistryError> {
        match self.find(name) {
            Some(group) => {
                self.assert_readable(ac, &group)?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    /// Existing group of that name, or a new one built by `factory`. Without
    /// a factory a managed cluster with an empty endpoint is created.
    pub async fn get_or_create_cluster(
        &self,
        ac: &dyn AccessContext,
        name: &str,
        factory: Option<ConfigFactory>,
    ) -> Result<Arc<NodeGroup>, RegistryError> {
        validate_name(name)?;
        if let Some(group) = self.find(name) {
            self.assert_readable(ac, &group)?;
            return Ok(group);
        }
        let config = match factory {
            Some(factory) => factory(name),
            None => GroupConfig::managed(name, EndpointConfig::default()),
        };
        if config.name() != name {
            return Err(RegistryError::InvalidConfig(format!(
                "factory for '{}' built config of '{}'",
                name,
                config.name()
            )));
        }
        self.get_or_create_group(ac, config).await
    }

    pub async fn get_or_create_group(
        &self,
        ac: &dyn AccessContext,
        mut config: GroupConfig,
    ) -> Result<Arc<NodeGroup>, RegistryError> {
        config.validate()?;
        let name = config.name().to_string();
        if let Some(group) = self.find(&name) {
            self.assert_readable(ac, &group)?;
            return Ok(group);
        }
        ac.assert_granted(&ObjectId::ClusterType, None, Action::Create)?;
        if config.common().acl.owner.is_none() {
            config.common_mut().acl.owner = Some(ac.principal().to_string());
        }
        let group = Arc::new(NodeGroup::new(config.clone(), self.ctx.clone()));
        let raced = match self.groups.entry(name.clone()) {
            Entry::Occupied(existing) => Some(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(group.clone());
                None
            }
        };
        if let Some(existing) = raced {
            self.assert_readable(ac, &existing)?;
            return Ok(existing);
        }
        if let Err(e) = self.ctx.configs.put(&name, &config).await {
            self.groups.remove(&name);
            return Err(e.into());
        }
        info!("Created group '{}' of kind {:?}", name, config.kind());
        self.ctx
            .events
            .publish_group(GroupEvent::new(&name, EventAction::Create, None));
        group.init().await;
        Ok(group)
    }

    pub async fn delete_cluster(&self, ac: &dyn AccessContext, name: &str) -> Result<(), RegistryError> {
        if is_system_group(name) {
            return Err(RegistryError::IllegalOperation(format!(
                "can not delete system group '{}'",
                name
            )));
        }
        let group = self
            .find(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let acl = group.acl();
        ac.assert_granted(&ObjectId::Cluster(name.to_string()), Some(&acl), Action::Delete)?;
        self.ctx.configs.remove(name).await?;
        if let Some((_, removed)) = self.groups.remove(name) {
            removed.close();
        }
        warn!("Deleted group '{}'", name);
        self.ctx
            .events
            .publish_group(GroupEvent::new(name, EventAction::Delete, None));
        Ok(())
    }

    /// Group claimed by a node, if the node claims one
    pub fn get_cluster_for_node(
        &self,
        ac: &dyn AccessContext,
        node: &str,
    ) -> Result<Option<Arc<NodeGroup>>, RegistryError> {
        let cluster = self.ctx.directory.node(node).and_then(|n| n.cluster);
        match cluster {
            Some(cluster) => self.get_cluster(ac, &cluster),
            None => Ok(None),
        }
    }

    /// Groups the caller may read, sorted by name
    pub fn get_clusters(&self, ac: &dyn AccessContext) -> Vec<Arc<NodeGroup>> {
        self.snapshot()
            .into_iter()
            .filter(|g| Self::is_readable(ac, g))
            .collect()
    }

    /// Names of the groups the caller may read
    pub fn get_services(&self, ac: &dyn AccessContext) -> Vec<String> {
        self.get_clusters(ac)
            .iter()
            .map(|g| g.name().to_string())
            .collect()
    }

    fn is_managed(&self, name: &str) -> bool {
        self.find(name)
            .map_or(false, |g| g.kind() == GroupKind::Managed)
    }

    // ------------------------------------------------------------------------
    // Node events
    // ------------------------------------------------------------------------

    async fn handle_node_event(&self, event: NodeEvent) {
        debug!("Node event {:?} of '{}'", event.action, event.node);
        let registry = self.clone();
        let is_managed = move |name: &str| registry.is_managed(name);
        self.discovery.on_node_event(&event, &is_managed).await;

        let mut touched: Vec<&str> = Vec::new();
        if let Some(cluster) = event.cluster.as_deref() {
            touched.push(cluster);
        }
        if let Some(previous) = event.previous_cluster.as_deref() {
            if !touched.contains(&previous) {
                touched.push(previous);
            }
        }
        for name in touched {
            if let Some(group) = self.find(name) {
                group.init().await;
            }
        }
    }

    /// Hands node events to a small worker pool so that slow binds never
    /// hold up the publisher. Events beyond the queue capacity are dropped.
    pub fn spawn_node_dispatch(&self) -> watch::Sender<bool> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel::<NodeEvent>(self.options.dispatch_queue.max(1));
        let queue_rx = Arc::new(AsyncMutex::new(queue_rx));

        for worker in 0..self.options.dispatch_workers.max(1) {
            let registry = self.clone();
            let queue = queue_rx.clone();
            tokio::spawn(async move {
                loop {
                    let next = queue.lock().await.recv().await;
                    match next {
                        Some(event) => registry.handle_node_event(event).await,
                        None => break,
                    }
                }
                debug!("Node dispatch worker {} stopped", worker);
            });
        }

        let mut nodes = self.ctx.events.subscribe_nodes();
        let mut shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = nodes.recv() => match received {
                        Ok(event) => {
                            if let Err(e) = queue_tx.try_send(event) {
                                warn!("Node event dropped, dispatch queue is busy: {}", e);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Node dispatch lagged by {} events", skipped);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Node dispatch shutting down");
                            break;
                        }
                    }
                }
            }
        });
        shutdown_tx
    }

    // ------------------------------------------------------------------------
    // Background refresh
    // ------------------------------------------------------------------------

    /// One pass over every group: retry failed binds, refresh self-info and
    /// renew discovery records of managed clusters.
    pub async fn refresh_all(&self) {
        for group in self.snapshot() {
            if group.state().state != InitState::Inited {
                group.init().await;
            }
            if let Some(docker) = group.docker() {
                if let Err(e) = docker.get_info().await {
                    debug!("Info of group '{}' unavailable: {}", group.name(), e);
                }
            }
            if group.kind() == GroupKind::Managed {
                self.discovery.refresh(group.name(), &group.get_nodes()).await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Store reconciliation
    // ------------------------------------------------------------------------

    /// Applies a change written to the store by another process
    pub(crate) async fn apply_store_event(&self, event: KvMapEvent<GroupConfig>) {
        if event.origin != Origin::Storage {
            return;
        }
        let name = event.key;
        match (event.action, event.value) {
            (EventAction::Delete, _) => {
                if is_system_group(&name) {
                    return;
                }
                if let Some((_, removed)) = self.groups.remove(&name) {
                    removed.close();
                    info!("Group '{}' deleted in storage", name);
                    self.ctx
                        .events
                        .publish_group(GroupEvent::new(&name, EventAction::Delete, None));
                }
            }
            (_, Some(config)) => {
                if config.name() != name || config.validate().is_err() {
                    warn!("Ignoring invalid stored config of '{}'", name);
                    return;
                }
                match self.find(&name) {
                    Some(group) => {
                        let current = group.get_config();
                        if current.kind() != config.kind() {
                            warn!("Stored config changes kind of '{}', ignored", name);
                            return;
                        }
                        let changed = current.changed_fields(&config);
                        if !changed.is_empty() {
                            group.replace_config(config, changed).await;
                        }
                    }
                    None => {
                        let group = Arc::new(NodeGroup::new(config, self.ctx.clone()));
                        let inserted = match self.groups.entry(name.clone()) {
                            Entry::Occupied(_) => false,
                            Entry::Vacant(slot) => {
                                slot.insert(group.clone());
                                true
                            }
                        };
                        if inserted {
                            info!("Group '{}' created in storage", name);
                            self.ctx
                                .events
                                .publish_group(GroupEvent::new(&name, EventAction::Create, None));
                            group.init().await;
                        }
                    }
                }
            }
            (_, None) => {}
        }
    }

    /// Follows foreign changes of group configs in the store
    pub fn spawn_store_watch(&self) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let mut changes = self.ctx.configs.subscribe();
        let watch = store::spawn_watch(self.ctx.configs.clone());
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = changes.recv() => match received {
                        Ok(event) => registry.apply_store_event(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Group store watch lagged by {} events", skipped);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            let _ = watch.send(true);
        });
        shutdown_tx
    }
}

/// Periodically runs `ClusterRegistry::refresh_all`
pub fn spawn_info_refresher(registry: ClusterRegistry, interval: Duration) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown) = watch::channel(false);
    tokio::spawn(async move {
        info!("Starting info refresher, interval={}s", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => registry.refresh_all().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Info refresher shutting down");
                        break;
                    }
                }
            }
        }
    });
    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::nodes::NodeStorage;
    use crate::docker::transport::mock::MockTransportFactory;
    use crate::security::UserContext;
    use crate::store::{InMemoryStore, WriteOptions};

    struct Fixture {
        registry: ClusterRegistry,
        nodes: Arc<NodeStorage>,
        store: Arc<InMemoryStore>,
        events: EventBus,
    }

    async fn fixture() -> Fixture {
        let events = EventBus::new(256);
        let transports = Arc::new(MockTransportFactory::default());
        let endpoints = Arc::new(EndpointFactory::new(transports, events.clone()));
        let nodes = Arc::new(NodeStorage::new(events.clone()));
        let store = Arc::new(InMemoryStore::new());
        let registry = ClusterRegistry::new(
            store.clone(),
            nodes.clone(),
            endpoints,
            events.clone(),
            RegistryOptions::default(),
        );
        registry.load().await.unwrap();
        Fixture {
            registry,
            nodes,
            store,
            events,
        }
    }

    fn creator(name: &str) -> UserContext {
        UserContext::new(name).with_grant(ObjectId::ClusterType, Action::Create)
    }

    #[tokio::test]
    async fn test_system_groups_are_bootstrapped_and_readable() {
        let fx = fixture().await;
        let names = fx.registry.get_services(&UserContext::new("bob"));
        assert_eq!(names, vec![GROUP_ALL, GROUP_ORPHANS]);
        // loading again does nothing
        fx.registry.load().await.unwrap();
        assert_eq!(fx.registry.get_clusters(&SystemContext).len(), 2);
    }

    #[tokio::test]
    async fn test_system_groups_can_not_be_deleted() {
        let fx = fixture().await;
        for name in [GROUP_ALL, GROUP_ORPHANS] {
            let err = fx.registry.delete_cluster(&SystemContext, name).await.unwrap_err();
            assert!(matches!(err, RegistryError::IllegalOperation(_)));
        }
    }

    #[tokio::test]
    async fn test_create_requires_grant_and_creator_owns_group() {
        let fx = fixture().await;
        let err = fx
            .registry
            .get_or_create_cluster(&UserContext::new("bob"), "prod", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Access(_)));

        let alice = creator("alice");
        let group = fx.registry.get_or_create_cluster(&alice, "prod", None).await.unwrap();
        assert_eq!(group.acl().owner.as_deref(), Some("alice"));
        let again = fx.registry.get_or_create_cluster(&alice, "prod", None).await.unwrap();
        assert!(Arc::ptr_eq(&group, &again));

        let bob = UserContext::new("bob");
        assert!(!fx.registry.get_services(&bob).contains(&"prod".to_string()));
        assert!(matches!(
            fx.registry.get_cluster(&bob, "prod"),
            Err(RegistryError::Access(_))
        ));
    }

    #[tokio::test]
    async fn test_create_and_delete_publish_events_and_persist() {
        let fx = fixture().await;
        let mut rx = fx.events.subscribe_groups();
        let alice = creator("alice");
        fx.registry
            .get_or_create_group(&alice, GroupConfig::virtual_group("edge", "label:zone=edge"))
            .await
            .unwrap();
        assert!(fx.store.get("clusters/edge").await.unwrap().is_some());
        let created = rx.recv().await.unwrap();
        assert_eq!((created.group.as_str(), created.action), ("edge", EventAction::Create));

        fx.registry.delete_cluster(&alice, "edge").await.unwrap();
        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.action, EventAction::Delete);
        assert!(fx.registry.get_cluster(&alice, "edge").unwrap().is_none());
        assert!(fx.store.get("clusters/edge").await.unwrap().is_none());
        assert!(matches!(
            fx.registry.delete_cluster(&alice, "edge").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_names_are_rejected() {
        let fx = fixture().await;
        let err = fx
            .registry
            .get_or_create_cluster(&SystemContext, "bad/name", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_orphans_follow_swarm_membership() {
        let fx = fixture().await;
        fx.registry
            .get_or_create_cluster(&SystemContext, "prod", None)
            .await
            .unwrap();
        fx.registry
            .get_or_create_group(&SystemContext, GroupConfig::virtual_group("edge", "any:*"))
            .await
            .unwrap();
        fx.nodes.register_node(NodeInfo::new("n1", "10.0.0.1:2375").with_cluster("prod"));
        fx.nodes.register_node(NodeInfo::new("n2", "10.0.0.2:2375"));
        fx.nodes.register_node(NodeInfo::new("n3", "10.0.0.3:2375").with_cluster("edge"));
        fx.nodes.register_node(NodeInfo::new("n4", "10.0.0.4:2375").with_cluster("gone"));

        let orphans = fx.registry.get_cluster(&SystemContext, GROUP_ORPHANS).unwrap().unwrap();
        let names: Vec<String> = orphans.get_nodes().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["n2", "n3", "n4"]);

        let all = fx.registry.get_cluster(&SystemContext, GROUP_ALL).unwrap().unwrap();
        assert_eq!(all.get_nodes().len(), 4);
        assert_eq!(all.get_groups(), vec!["edge", "gone", "prod"]);

        let for_node = fx.registry.get_cluster_for_node(&SystemContext, "n1").unwrap().unwrap();
        assert_eq!(for_node.name(), "prod");
        assert!(fx.registry.get_cluster_for_node(&SystemContext, "n2").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_groups_are_rebuilt_from_storage() {
        let store = Arc::new(InMemoryStore::new());
        let config = GroupConfig::virtual_group("edge", "label:zone=edge");
        store
            .set(
                "clusters/edge",
                &serde_json::to_string(&config).unwrap(),
                &WriteOptions::default(),
            )
            .await
            .unwrap();
        store
            .set("clusters/broken", "{}", &WriteOptions::default())
            .await
            .unwrap();
        let events = EventBus::new(64);
        let endpoints = Arc::new(EndpointFactory::new(
            Arc::new(MockTransportFactory::default()),
            events.clone(),
        ));
        let registry = ClusterRegistry::new(
            store,
            Arc::new(NodeStorage::new(events.clone())),
            endpoints,
            events,
            RegistryOptions::default(),
        );
        registry.load().await.unwrap();
        let edge = registry.get_cluster(&SystemContext, "edge").unwrap().unwrap();
        assert!(edge.state().is_ok());
        assert_eq!(registry.get_services(&SystemContext).len(), 3);
    }

    #[tokio::test]
    async fn test_storage_changes_are_reconciled() {
        let fx = fixture().await;
        let mut rx = fx.events.subscribe_groups();
        let foreign: KvMap<GroupConfig> = KvMap::new(fx.store.clone(), CLUSTERS_PREFIX);

        let config = GroupConfig::virtual_group("edge", "any:*");
        foreign.put("edge", &config).await.unwrap();
        fx.registry
            .apply_store_event(KvMapEvent {
                key: "edge".to_string(),
                action: EventAction::Create,
                origin: Origin::Storage,
                value: Some(config.clone()),
            })
            .await;
        assert!(fx.registry.get_cluster(&SystemContext, "edge").unwrap().is_some());
        assert_eq!(rx.recv().await.unwrap().action, EventAction::Create);

        let mut updated = config.clone();
        updated.common_mut().title = Some("Edge".to_string());
        fx.registry
            .apply_store_event(KvMapEvent {
                key: "edge".to_string(),
                action: EventAction::Update,
                origin: Origin::Storage,
                value: Some(updated),
            })
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.action, EventAction::Update);
        assert_eq!(event.changed, vec!["title"]);

        fx.registry
            .apply_store_event(KvMapEvent {
                key: "edge".to_string(),
                action: EventAction::Delete,
                origin: Origin::Storage,
                value: None,
            })
            .await;
        assert!(fx.registry.get_cluster(&SystemContext, "edge").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_node_events_bind_groups_off_the_publisher() {
        let fx = fixture().await;
        let group = fx
            .registry
            .get_or_create_cluster(&SystemContext, "prod", None)
            .await
            .unwrap();
        // empty endpoint: bind failed
        assert_eq!(group.state().state, InitState::Failed);
        group
            .update_config(|c| {
                if let GroupConfig::Managed(m) = c {
                    m.endpoint.hosts = vec!["10.9.0.1:2375".to_string()];
                }
            })
            .await
            .unwrap();
        assert!(group.state().is_ok());

        let shutdown = fx.registry.spawn_node_dispatch();
        tokio::task::yield_now().await;
        fx.nodes.register_node(NodeInfo::new("n1", "10.0.0.1:2375").with_cluster("prod"));

        let key = crate::cluster::discovery::discovery_key("prod", "10.0.0.1:2375");
        let mut registered = false;
        for _ in 0..50 {
            if fx.store.get(&key).await.unwrap().is_some() {
                registered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registered, "discovery record written by dispatch worker");
        let _ = shutdown.send(true);
    }
}
