//! Backend self-info and its parser
//!
//! The runtime reports cluster members inside a free-form status list of
//! `[key, value]` pairs. Node headers are plain keys, node attributes are keys
//! prefixed by a tree glyph. Parsing is line oriented and a broken line never
//! aborts the whole parse.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

const NODE_ATTR_PREFIX: char = '└';
const KIB: f64 = 1024.0;
const MIB: f64 = KIB * 1024.0;
const GIB: f64 = MIB * 1024.0;
const TIB: f64 = GIB * 1024.0;
const PIB: f64 = TIB * 1024.0;

#[derive(Error, Debug, PartialEq)]
pub enum InfoParseError {
    #[error("Malformed size '{0}'")]
    BadSize(String),

    #[error("Malformed ratio '{0}'")]
    BadRatio(String),

    #[error("Missing value for '{0}'")]
    MissingValue(String),
}

// ============================================================================
// Node health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Claimed by a group but not yet seen by the backend
    Pending,
    Unhealthy,
    Healthy,
    /// Backend of the node is unreachable
    Disconnected,
    Maintenance,
}

impl NodeState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(NodeState::Pending),
            "unhealthy" => Some(NodeState::Unhealthy),
            "healthy" => Some(NodeState::Healthy),
            "disconnected" => Some(NodeState::Disconnected),
            "maintenance" => Some(NodeState::Maintenance),
            _ => None,
        }
    }
}

/// Health record of a node. Every field is optional so that partial reports
/// from different sources can be merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMetrics {
    pub time: Option<DateTime<Utc>>,
    pub state: Option<NodeState>,
    pub healthy: Option<bool>,
    pub swarm_cpus_reserved: Option<i32>,
    pub swarm_cpus_total: Option<i32>,
    pub swarm_mem_reserved: Option<i64>,
    pub swarm_mem_total: Option<i64>,
    pub sys_mem_avail: Option<i64>,
    pub sys_mem_total: Option<i64>,
}

impl NodeMetrics {
    pub fn with_state(state: NodeState) -> Self {
        Self {
            state: Some(state),
            healthy: Some(state == NodeState::Healthy),
            ..Default::default()
        }
    }

    /// Copy of `self` with every non-null field of `other` laid over it
    pub fn merge_non_null(&self, other: &NodeMetrics) -> NodeMetrics {
        NodeMetrics {
            time: other.time.or(self.time),
            state: other.state.or(self.state),
            healthy: other.healthy.or(self.healthy),
            swarm_cpus_reserved: other.swarm_cpus_reserved.or(self.swarm_cpus_reserved),
            swarm_cpus_total: other.swarm_cpus_total.or(self.swarm_cpus_total),
            swarm_mem_reserved: other.swarm_mem_reserved.or(self.swarm_mem_reserved),
            swarm_mem_total: other.swarm_mem_total.or(self.swarm_mem_total),
            sys_mem_avail: other.sys_mem_avail.or(self.sys_mem_avail),
            sys_mem_total: other.sys_mem_total.or(self.sys_mem_total),
        }
    }
}

/// Known facts about a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub address: String,
    /// Cluster the node claims to belong to
    #[serde(default)]
    pub cluster: Option<String>,
    /// Whether the node is powered on as last reported
    #[serde(default = "default_on")]
    pub on: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub health: NodeMetrics,
}

fn default_on() -> bool {
    true
}

impl NodeInfo {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            cluster: None,
            on: true,
            labels: HashMap::new(),
            health: NodeMetrics::default(),
        }
    }

    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.cluster = Some(cluster.to_string());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_health(mut self, health: NodeMetrics) -> Self {
        self.health = health;
        self
    }
}

/// Source of node records known outside the backend's own report
pub trait NodeInfoProvider: Send + Sync {
    fn node_info(&self, name: &str) -> Option<NodeInfo>;
}

// ============================================================================
// Self-info
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmInfo {
    pub node_id: String,
    pub cluster_id: Option<String>,
    pub manager: bool,
    pub managers: Vec<String>,
}

/// Normalized self-info of an endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerServiceInfo {
    pub id: String,
    pub name: String,
    pub system_time: Option<DateTime<Utc>>,
    pub containers: u32,
    pub off_containers: u32,
    pub images: u32,
    pub ncpu: u32,
    pub memory: i64,
    pub node_count: u32,
    pub off_node_count: u32,
    pub nodes: Vec<NodeInfo>,
    pub labels: HashMap<String, String>,
    pub swarm: Option<SwarmInfo>,
}

// ============================================================================
// Wire form of the runtime's /info reply
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawRemoteManager {
    pub addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawSwarmCluster {
    #[serde(rename = "ID")]
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawSwarm {
    #[serde(rename = "NodeID")]
    pub node_id: String,
    pub control_available: bool,
    pub cluster: Option<RawSwarmCluster>,
    pub remote_managers: Option<Vec<RawRemoteManager>>,
    pub nodes: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawInfo {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub containers: u32,
    pub containers_running: u32,
    pub images: u32,
    #[serde(rename = "NCPU")]
    pub ncpu: u32,
    pub mem_total: i64,
    pub system_time: Option<String>,
    pub labels: Option<Vec<String>>,
    pub system_status: Option<Vec<Vec<String>>>,
    pub driver_status: Option<Vec<Vec<String>>>,
    pub swarm: Option<RawSwarm>,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse a human readable size like `1.5 GiB` into bytes.
///
/// Units are base 1024. An unknown unit is treated as plain bytes.
pub fn parse_size(s: &str) -> Result<i64, InfoParseError> {
    let mut parts = s.split_whitespace();
    let number = parts
        .next()
        .ok_or_else(|| InfoParseError::BadSize(s.to_string()))?;
    let value: f64 = number
        .parse()
        .map_err(|_| InfoParseError::BadSize(s.to_string()))?;
    let mult = match parts.next() {
        Some("KiB") => KIB,
        Some("MiB") => MIB,
        Some("GiB") => GIB,
        Some("TiB") => TIB,
        Some("PiB") => PIB,
        _ => 1.0,
    };
    Ok((value * mult).round() as i64)
}

fn split_ratio(val: &str) -> Result<(&str, &str), InfoParseError> {
    let mut parts = val.splitn(2, '/');
    match (parts.next(), parts.next()) {
        (Some(a), Some(b)) => Ok((a.trim(), b.trim())),
        _ => Err(InfoParseError::BadRatio(val.to_string())),
    }
}

fn parse_count(s: &str) -> Result<i32, InfoParseError> {
    s.parse()
        .map_err(|_| InfoParseError::BadRatio(s.to_string()))
}

/// Accumulates nodes while walking the status list
#[derive(Default)]
struct StatusListParser {
    in_nodes: bool,
    node_count: Option<u32>,
    nodes: Vec<NodeInfo>,
    current: Option<NodeInfo>,
    metrics: Option<NodeMetrics>,
}

impl StatusListParser {
    fn finish_node(&mut self) {
        if let Some(mut node) = self.current.take() {
            if let Some(metrics) = self.metrics.take() {
                node.health = metrics;
            }
            self.nodes.push(node);
        }
        self.metrics = None;
    }

    fn header(&mut self, key: &str, value: Option<&String>) {
        self.finish_node();
        let name = key.trim();
        // transient nodes like ' (unknown)' show up while the cluster starts
        if name.contains('(') {
            return;
        }
        let address = value.map(|v| v.trim()).unwrap_or_default();
        self.current = Some(NodeInfo::new(name, address));
    }

    fn attribute(&mut self, key: &str, value: Option<&String>) -> Result<(), InfoParseError> {
        if self.current.is_none() {
            // attributes of a skipped header
            return Ok(());
        }
        let attr = key
            .split_once(NODE_ATTR_PREFIX)
            .map(|(_, rest)| rest.trim_start())
            .unwrap_or(key);
        let val = value.ok_or_else(|| InfoParseError::MissingValue(attr.to_string()))?;
        let metrics = self.metrics.get_or_insert_with(NodeMetrics::default);
        match attr {
            "Status" => {
                let state = NodeState::parse(val);
                metrics.state = state;
                metrics.healthy = Some(state == Some(NodeState::Healthy));
            }
            "Reserved CPUs" => {
                let (reserved, total) = split_ratio(val)?;
                metrics.swarm_cpus_reserved = Some(parse_count(reserved)?);
                metrics.swarm_cpus_total = Some(parse_count(total)?);
            }
            "Reserved Memory" => {
                let (reserved, total) = split_ratio(val)?;
                metrics.swarm_mem_reserved = Some(parse_size(reserved)?);
                metrics.swarm_mem_total = Some(parse_size(total)?);
            }
            _ => {}
        }
        Ok(())
    }

    fn parse(mut self, list: &[Vec<String>]) -> (Option<u32>, Vec<NodeInfo>) {
        for (i, line) in list.iter().enumerate() {
            let Some(key) = line.first() else {
                continue;
            };
            let value = line.get(1);
            if !self.in_nodes {
                if key.ends_with("Nodes") {
                    self.in_nodes = true;
                    match value.map(|v| v.trim().parse::<u32>()) {
                        Some(Ok(count)) => self.node_count = Some(count),
                        _ => error!("Can not parse node count {:?} at {} entry", line, i),
                    }
                }
                continue;
            }
            if !key.contains(NODE_ATTR_PREFIX) {
                self.header(key, value);
            } else if let Err(e) = self.attribute(key, value) {
                error!("Can not parse attr {:?} at {} entry: {}", line, i, e);
            }
        }
        self.finish_node();
        (self.node_count, self.nodes)
    }
}

/// Parse a status list into the aggregate node count and per-node records
pub fn parse_status_list(list: &[Vec<String>]) -> (Option<u32>, Vec<NodeInfo>) {
    StatusListParser::default().parse(list)
}

fn parse_labels(labels: &[String]) -> HashMap<String, String> {
    labels
        .iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn convert_swarm(raw: &RawSwarm) -> SwarmInfo {
    SwarmInfo {
        node_id: raw.node_id.clone(),
        // the runtime may report an empty id
        cluster_id: raw
            .cluster
            .as_ref()
            .map(|c| c.id.clone())
            .filter(|id| !id.is_empty()),
        manager: raw.control_available,
        managers: raw
            .remote_managers
            .iter()
            .flatten()
            .map(|m| m.addr.clone())
            .collect(),
    }
}

/// Normalize the runtime's /info reply
pub fn parse_info(raw: &RawInfo) -> DockerServiceInfo {
    debug!("Parsing info of {}", raw.name);
    let mut info = DockerServiceInfo {
        id: raw.id.clone(),
        name: raw.name.clone(),
        system_time: raw
            .system_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc)),
        containers: raw.containers,
        off_containers: raw.containers.saturating_sub(raw.containers_running),
        images: raw.images,
        ncpu: raw.ncpu,
        memory: raw.mem_total,
        labels: raw.labels.as_deref().map(parse_labels).unwrap_or_default(),
        ..Default::default()
    };

    // older clusters report members in DriverStatus
    let status = raw.system_status.as_ref().or(raw.driver_status.as_ref());
    if let Some(list) = status {
        let (count, nodes) = parse_status_list(list);
        info.node_count = count.unwrap_or(nodes.len() as u32);
        info.nodes = nodes;
    }

    if let Some(swarm) = raw.swarm.as_ref().filter(|s| !s.node_id.is_empty()) {
        info.swarm = Some(convert_swarm(swarm));
        info.node_count = swarm.nodes;
    }
    info
}
