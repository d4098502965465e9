//! Container runtime endpoints
//!
//! `DockerApi` is the operation set every endpoint exposes. A `DockerEndpoint`
//! talks to one physical backend; an `AggregatingEndpoint` fans out over the
//! endpoints of many nodes.

pub mod aggregate;
pub mod cache;
pub mod endpoint;
pub mod info;
pub mod model;
pub mod offline;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use aggregate::AggregatingEndpoint;
pub use endpoint::{DockerEndpoint, EndpointFactory};
pub use info::{DockerServiceInfo, NodeInfo, NodeMetrics, NodeState};
pub use transport::{Credentials, HttpTransport, Transport, TransportError};

use model::*;

/// Errors of endpoint calls that have no degraded result
#[derive(Error, Debug, Clone)]
pub enum EndpointError {
    #[error("Backend '{endpoint}' is offline: {cause}")]
    Offline { endpoint: String, cause: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Backend replied {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Access denied by backend: {0}")]
    Unauthorized(String),

    #[error("Operation '{0}' is not supported by this endpoint")]
    NotSupported(&'static str),

    #[error("Can not decode backend reply: {0}")]
    Decode(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl EndpointError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, EndpointError::Unauthorized(_))
    }
}

/// Coarse outcome of a mutating call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Ok,
    NotModified,
    NotFound,
    Conflict,
    Error,
}

impl ResultCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => ResultCode::Ok,
            304 => ResultCode::NotModified,
            404 => ResultCode::NotFound,
            409 => ResultCode::Conflict,
            _ => ResultCode::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResult {
    pub code: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Id of a created object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl CallResult {
    pub fn new(code: ResultCode, message: Option<String>) -> Self {
        Self {
            code,
            message,
            id: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(ResultCode::Ok, None)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Error, Some(message.into()))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.code, ResultCode::Ok | ResultCode::NotModified)
    }
}

impl fmt::Display for CallResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(ref m) => write!(f, "{:?}: {}", self.code, m),
            None => write!(f, "{:?}", self.code),
        }
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

/// Operation set of a container runtime endpoint.
///
/// Look-ups return `Ok(None)` for objects the backend does not know. Mutating
/// calls report runtime conditions, including an offline backend, through
/// `CallResult`; they return `Err` only for capabilities the endpoint lacks
/// and for invalid arguments.
#[async_trait]
pub trait DockerApi: Send + Sync {
    /// Stable id of the endpoint, usually the backend address
    fn id(&self) -> &str;

    /// Cluster the endpoint is bound to
    fn cluster(&self) -> Option<&str>;

    /// Node the endpoint is bound to
    fn node(&self) -> Option<&str>;

    fn is_online(&self) -> bool;

    /// False only while an offline marker is still actual. A lapsed marker
    /// lets the next call through to probe the backend.
    fn is_available(&self) -> bool {
        self.is_online()
    }

    async fn get_info(&self) -> Result<Arc<DockerServiceInfo>, EndpointError>;

    // Containers

    async fn list_containers(&self, arg: &GetContainersArg) -> Result<Vec<Container>, EndpointError>;

    async fn get_container(&self, id: &str) -> Result<Option<ContainerDetails>, EndpointError>;

    async fn create_container(&self, cmd: &CreateContainerCmd) -> Result<CallResult, EndpointError>;

    async fn start_container(&self, id: &str) -> Result<CallResult, EndpointError>;

    async fn stop_container(&self, arg: &StopContainerArg) -> Result<CallResult, EndpointError>;

    async fn restart_container(&self, arg: &StopContainerArg) -> Result<CallResult, EndpointError>;

    async fn kill_container(&self, id: &str, signal: Option<&str>) -> Result<CallResult, EndpointError>;

    async fn pause_container(&self, id: &str) -> Result<CallResult, EndpointError>;

    async fn unpause_container(&self, id: &str) -> Result<CallResult, EndpointError>;

    async fn delete_container(&self, arg: &DeleteContainerArg) -> Result<CallResult, EndpointError>;

    async fn update_container(&self, cmd: &UpdateContainerCmd) -> Result<CallResult, EndpointError>;

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<CallResult, EndpointError>;

    // Streams, each runs until the backend closes it or `cancel` fires

    async fn container_logs(
        &self,
        arg: &GetLogsArg,
        sink: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<CallResult, EndpointError>;

    async fn container_stats(
        &self,
        id: &str,
        sink: mpsc::Sender<serde_json::Value>,
        cancel: CancellationToken,
    ) -> Result<CallResult, EndpointError>;

    async fn subscribe_events(
        &self,
        sink: mpsc::Sender<DockerEvent>,
        cancel: CancellationToken,
    ) -> Result<CallResult, EndpointError>;

    // Services and tasks

    async fn list_services(&self) -> Result<Vec<Service>, EndpointError>;

    async fn get_service(&self, id: &str) -> Result<Option<Service>, EndpointError>;

    async fn create_service(&self, spec: &ServiceSpec) -> Result<CallResult, EndpointError>;

    async fn update_service(&self, cmd: &UpdateServiceCmd) -> Result<CallResult, EndpointError>;

    async fn delete_service(&self, id: &str) -> Result<CallResult, EndpointError>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, EndpointError>;

    /// `arg.id` names the service
    async fn service_logs(
        &self,
        arg: &GetLogsArg,
        sink: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<CallResult, EndpointError>;

    // Images

    async fn pull_image(&self, name: &str) -> Result<CallResult, EndpointError>;

    async fn list_images(&self, arg: &GetImagesArg) -> Result<Vec<ImageItem>, EndpointError>;

    async fn inspect_image(&self, name: &str) -> Result<Option<ImageDetails>, EndpointError>;

    async fn remove_image(&self, name: &str, force: bool) -> Result<CallResult, EndpointError>;

    // Networks

    async fn create_network(&self, cmd: &CreateNetworkCmd) -> Result<CallResult, EndpointError>;

    async fn list_networks(&self) -> Result<Vec<Network>, EndpointError>;

    async fn delete_network(&self, id: &str) -> Result<CallResult, EndpointError>;

    // Swarm

    async fn init_swarm(&self, cmd: &SwarmInitCmd) -> Result<CallResult, EndpointError>;

    async fn join_swarm(&self, cmd: &SwarmJoinCmd) -> Result<CallResult, EndpointError>;

    async fn leave_swarm(&self, force: bool) -> Result<CallResult, EndpointError>;

    async fn inspect_swarm(&self) -> Result<Option<SwarmInspect>, EndpointError>;

    async fn list_nodes(&self) -> Result<Vec<SwarmNode>, EndpointError>;

    async fn update_node(&self, cmd: &UpdateNodeCmd) -> Result<CallResult, EndpointError>;

    async fn remove_node(&self, id: &str, force: bool) -> Result<CallResult, EndpointError>;
}
