//! Domain events
//!
//! Each event category has its own broadcast channel. Publishers never block
//! and never fail when nobody is listening.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::docker::info::DockerServiceInfo;

/// Default capacity of every event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Lifecycle action carried by group and node events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    /// Severity of a group event. Updates are errors when the group reports one.
    pub fn severity(self, error: Option<&str>) -> Severity {
        match self {
            Action::Create => Severity::Info,
            Action::Update if error.is_some() => Severity::Error,
            Action::Update => Severity::Info,
            Action::Delete => Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEvent {
    pub id: Uuid,
    pub time: DateTime<Utc>,
    pub group: String,
    pub action: Action,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Top level config fields touched by an update
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<String>,
}

impl GroupEvent {
    pub fn new(group: &str, action: Action, message: Option<String>) -> Self {
        let severity = action.severity(message.as_deref());
        Self {
            id: Uuid::new_v4(),
            time: Utc::now(),
            group: group.to_string(),
            action,
            severity,
            message,
            changed: Vec::new(),
        }
    }

    pub fn with_changed(mut self, changed: Vec<String>) -> Self {
        self.changed = changed;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node: String,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Cluster claimed by the node after the change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    /// Cluster claimed by the node before the change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_cluster: Option<String>,
}

#[derive(Debug, Clone)]
pub enum EndpointEventKind {
    Online,
    Offline { cause: String },
    InfoUpdated(Arc<DockerServiceInfo>),
}

#[derive(Debug, Clone)]
pub struct EndpointEvent {
    pub endpoint: String,
    pub cluster: Option<String>,
    pub node: Option<String>,
    pub kind: EndpointEventKind,
}

impl EndpointEvent {
    pub fn severity(&self) -> Severity {
        match self.kind {
            EndpointEventKind::Offline { .. } => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

/// Publish/subscribe hub shared by the registry, groups and endpoints
#[derive(Clone)]
pub struct EventBus {
    groups: broadcast::Sender<GroupEvent>,
    nodes: broadcast::Sender<NodeEvent>,
    endpoints: broadcast::Sender<EndpointEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (groups, _) = broadcast::channel(capacity);
        let (nodes, _) = broadcast::channel(capacity);
        let (endpoints, _) = broadcast::channel(capacity);
        Self {
            groups,
            nodes,
            endpoints,
        }
    }

    // A send error only means there are no subscribers right now.

    pub fn publish_group(&self, event: GroupEvent) {
        let _ = self.groups.send(event);
    }

    pub fn publish_node(&self, event: NodeEvent) {
        let _ = self.nodes.send(event);
    }

    pub fn publish_endpoint(&self, event: EndpointEvent) {
        let _ = self.endpoints.send(event);
    }

    pub fn subscribe_groups(&self) -> broadcast::Receiver<GroupEvent> {
        self.groups.subscribe()
    }

    pub fn subscribe_nodes(&self) -> broadcast::Receiver<NodeEvent> {
        self.nodes.subscribe()
    }

    pub fn subscribe_endpoints(&self) -> broadcast::Receiver<EndpointEvent> {
        self.endpoints.subscribe()
    }
}

fn log_group_event(event: &GroupEvent) {
    let message = event.message.as_deref().unwrap_or("");
    match event.severity {
        Severity::Info => info!(
            "Group '{}' {:?} {:?} {}",
            event.group, event.action, event.changed, message
        ),
        Severity::Warning => warn!("Group '{}' {:?} {}", event.group, event.action, message),
        Severity::Error => error!("Group '{}' {:?} failed: {}", event.group, event.action, message),
    }
}

fn log_endpoint_event(event: &EndpointEvent) {
    match event.kind {
        EndpointEventKind::Offline { ref cause } => {
            warn!("Endpoint {} is offline: {}", event.endpoint, cause)
        }
        EndpointEventKind::Online => info!("Endpoint {} is online", event.endpoint),
        EndpointEventKind::InfoUpdated(ref info) => info!(
            "Endpoint {} reports {} nodes, {} off",
            event.endpoint, info.node_count, info.off_node_count
        ),
    }
}

/// Audit sink writing group and endpoint events to the log
pub fn spawn_event_log(bus: &EventBus) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown) = watch::channel(false);
    let mut groups = bus.subscribe_groups();
    let mut endpoints = bus.subscribe_endpoints();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(event) = groups.recv() => log_group_event(&event),
                Ok(event) = endpoints.recv() => log_endpoint_event(&event),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Event log shutting down");
                        break;
                    }
                }
            }
        }
    });
    shutdown_tx
}
