//! Container runtime objects as exchanged with a backend
//!
//! Field names follow the runtime's REST wire format. Fields the control plane
//! does not interpret are kept as opaque JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Containers
// ============================================================================

/// Generic container state shared by plain containers and swarm tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Restarting,
    Running,
    Paused,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "restarting" => ContainerState::Restarting,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    pub fn is_run(self) -> bool {
        matches!(
            self,
            ContainerState::Running | ContainerState::Restarting | ContainerState::Paused
        )
    }
}

/// Entry of a container listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Container {
    #[serde(rename = "Id")]
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    #[serde(rename = "ImageID")]
    pub image_id: String,
    pub command: String,
    pub created: i64,
    pub state: ContainerState,
    pub status: String,
    pub labels: HashMap<String, String>,
    /// Node the container was listed from, filled in by the control plane
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

impl Container {
    /// Container name without the leading slash or classic swarm node prefix
    pub fn name(&self) -> &str {
        let raw = self.names.first().map(String::as_str).unwrap_or("");
        raw.rsplit('/').next().unwrap_or(raw)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerStatus {
    pub status: ContainerState,
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    pub exit_code: i64,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerConfig {
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub cmd: Vec<String>,
}

/// Node section reported by classic swarm for a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerNode {
    pub name: String,
    pub addr: String,
}

/// Result of inspecting a single container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerDetails {
    #[serde(rename = "Id")]
    pub id: String,
    pub name: String,
    pub image: String,
    pub created: String,
    pub state: ContainerStatus,
    pub config: ContainerConfig,
    pub restart_count: i64,
    pub node: Option<ContainerNode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerCmd {
    #[serde(skip)]
    pub name: Option<String>,
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub labels: HashMap<String, String>,
}

/// Resource limits change for a running container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateContainerCmd {
    #[serde(skip)]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct GetContainersArg {
    pub all: bool,
}

#[derive(Debug, Clone)]
pub struct StopContainerArg {
    pub id: String,
    /// Seconds the runtime waits before killing the container
    pub timeout: Option<u32>,
}

impl StopContainerArg {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteContainerArg {
    pub id: String,
    pub force: bool,
    pub remove_volumes: bool,
}

impl DeleteContainerArg {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            force: false,
            remove_volumes: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetLogsArg {
    pub id: String,
    pub follow: bool,
    pub tail: Option<u32>,
    pub stdout: bool,
    pub stderr: bool,
}

impl GetLogsArg {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            follow: false,
            tail: None,
            stdout: true,
            stderr: true,
        }
    }
}

// ============================================================================
// Images and networks
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageItem {
    #[serde(rename = "Id")]
    pub id: String,
    pub repo_tags: Vec<String>,
    pub created: i64,
    pub size: i64,
    pub labels: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageDetails {
    #[serde(rename = "Id")]
    pub id: String,
    pub repo_tags: Vec<String>,
    pub created: String,
    pub size: i64,
    pub os: String,
    pub architecture: String,
}

#[derive(Debug, Clone, Default)]
pub struct GetImagesArg {
    pub all: bool,
    /// Full image name including repository
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Network {
    #[serde(rename = "Id")]
    pub id: String,
    pub name: String,
    pub driver: String,
    pub scope: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateNetworkCmd {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    pub attachable: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub labels: HashMap<String, String>,
}

// ============================================================================
// Swarm mode: services, tasks, nodes
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ObjectVersion {
    pub index: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceSpecWire {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub task_template: serde_json::Value,
    pub mode: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Service {
    #[serde(rename = "ID")]
    pub id: String,
    pub version: ObjectVersion,
    pub spec: ServiceSpecWire,
}

impl Service {
    /// Image of the service's container template
    pub fn image(&self) -> Option<&str> {
        self.spec
            .task_template
            .get("ContainerSpec")
            .and_then(|c| c.get("Image"))
            .and_then(|i| i.as_str())
    }
}

/// Simplified service definition used when creating or updating services
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default = "default_replicas")]
    pub replicas: u64,
}

fn default_replicas() -> u64 {
    1
}

impl ServiceSpec {
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            env: Vec::new(),
            labels: HashMap::new(),
            replicas: 1,
        }
    }

    /// Wire form of the service spec
    pub fn to_wire(&self) -> ServiceSpecWire {
        ServiceSpecWire {
            name: self.name.clone(),
            labels: self.labels.clone(),
            task_template: serde_json::json!({
                "ContainerSpec": { "Image": self.image, "Env": self.env }
            }),
            mode: serde_json::json!({ "Replicated": { "Replicas": self.replicas } }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateServiceCmd {
    pub service_id: String,
    pub version: u64,
    pub spec: ServiceSpec,
}

/// Swarm task state as reported by the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    New,
    Allocated,
    Pending,
    Assigned,
    Accepted,
    Preparing,
    Ready,
    Starting,
    Running,
    Complete,
    Shutdown,
    Failed,
    Rejected,
    Remove,
    Orphaned,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TaskContainerStatus {
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    pub exit_code: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TaskStatus {
    pub timestamp: String,
    pub state: TaskState,
    pub message: String,
    pub err: Option<String>,
    pub container_status: Option<TaskContainerStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Task {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    #[serde(rename = "NodeID")]
    pub node_id: String,
    pub slot: Option<u64>,
    pub status: TaskStatus,
    pub desired_state: TaskState,
    pub spec: serde_json::Value,
    pub created_at: String,
}

impl Task {
    pub fn image(&self) -> Option<&str> {
        self.spec
            .get("ContainerSpec")
            .and_then(|c| c.get("Image"))
            .and_then(|i| i.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub service: Option<String>,
    pub node: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SwarmNodeDescription {
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SwarmNodeStatus {
    pub state: String,
    pub addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SwarmNodeSpec {
    pub role: String,
    pub availability: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SwarmNode {
    #[serde(rename = "ID")]
    pub id: String,
    pub version: ObjectVersion,
    pub description: SwarmNodeDescription,
    pub status: SwarmNodeStatus,
    pub spec: SwarmNodeSpec,
}

#[derive(Debug, Clone)]
pub struct UpdateNodeCmd {
    pub node_id: String,
    pub version: u64,
    pub spec: SwarmNodeSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct JoinTokens {
    pub worker: String,
    pub manager: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SwarmInspect {
    #[serde(rename = "ID")]
    pub id: String,
    pub join_tokens: JoinTokens,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SwarmInitCmd {
    pub listen_addr: String,
    pub advertise_addr: String,
    pub force_new_cluster: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SwarmJoinCmd {
    pub listen_addr: String,
    pub remote_addrs: Vec<String>,
    pub join_token: String,
}

// ============================================================================
// Runtime events
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EventActor {
    #[serde(rename = "ID")]
    pub id: String,
    pub attributes: HashMap<String, String>,
}

/// One entry of the runtime's event stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerEvent {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Actor")]
    pub actor: EventActor,
    pub time: i64,
}
