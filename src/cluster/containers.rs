//! Container operations of a node group
//!
//! Plain groups pass straight through to their endpoint. Swarm mode groups
//! enumerate tasks instead of containers and route point operations to the
//! node running the task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use tracing::debug;

use crate::docker::cache::SingleValueCache;
use crate::docker::model::*;
use crate::docker::{CallResult, DockerApi, EndpointError};

use super::nodes::NodeDirectory;

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Generic state of a container backing a swarm task
pub fn map_task_state(state: TaskState) -> ContainerState {
    match state {
        TaskState::New
        | TaskState::Allocated
        | TaskState::Pending
        | TaskState::Assigned
        | TaskState::Accepted
        | TaskState::Preparing
        | TaskState::Ready
        | TaskState::Starting => ContainerState::Created,
        TaskState::Running => ContainerState::Running,
        TaskState::Complete | TaskState::Shutdown => ContainerState::Exited,
        TaskState::Failed | TaskState::Rejected => ContainerState::Dead,
        TaskState::Remove | TaskState::Orphaned | TaskState::Unknown => ContainerState::Unknown,
    }
}

/// Listing entry for a task. `service_names` maps service id to name and
/// `node_names` maps swarm node id to hostname.
pub fn container_from_task(
    task: &Task,
    service_names: &HashMap<String, String>,
    node_names: &HashMap<String, String>,
) -> Container {
    let service = service_names
        .get(&task.service_id)
        .cloned()
        .unwrap_or_else(|| task.service_id.clone());
    let name = match task.slot {
        Some(slot) => format!("{}.{}", service, slot),
        None => format!("{}.{}", service, task.node_id),
    };
    let id = task
        .status
        .container_status
        .as_ref()
        .map(|c| c.container_id.clone())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| task.id.clone());
    let created = DateTime::parse_from_rfc3339(&task.created_at)
        .map(|t| t.timestamp())
        .unwrap_or(0);
    let mut labels = HashMap::new();
    labels.insert("com.docker.swarm.service.id".to_string(), task.service_id.clone());
    labels.insert("com.docker.swarm.task.id".to_string(), task.id.clone());
    Container {
        id,
        names: vec![format!("/{}", name)],
        image: task.image().unwrap_or_default().to_string(),
        created,
        state: map_task_state(task.status.state),
        status: task
            .status
            .err
            .clone()
            .unwrap_or_else(|| task.status.message.clone()),
        labels,
        node: node_names
            .get(&task.node_id)
            .cloned()
            .or_else(|| Some(task.node_id.clone())),
        ..Container::default()
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait ContainersManager: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<Container>, EndpointError>;

    async fn get_container(&self, id: &str) -> Result<Option<ContainerDetails>, EndpointError>;

    async fn start_container(&self, id: &str) -> Result<CallResult, EndpointError>;

    async fn stop_container(&self, arg: &StopContainerArg) -> Result<CallResult, EndpointError>;

    async fn restart_container(&self, arg: &StopContainerArg) -> Result<CallResult, EndpointError>;

    async fn delete_container(&self, arg: &DeleteContainerArg) -> Result<CallResult, EndpointError>;

    async fn list_services(&self) -> Result<Vec<Service>, EndpointError>;

    async fn get_service(&self, id: &str) -> Result<Option<Service>, EndpointError>;

    async fn create_service(&self, spec: &ServiceSpec) -> Result<CallResult, EndpointError>;

    async fn update_service(&self, cmd: &UpdateServiceCmd) -> Result<CallResult, EndpointError>;

    async fn delete_service(&self, id: &str) -> Result<CallResult, EndpointError>;
}

// ============================================================================
// Plain containers
// ============================================================================

/// Pass-through to the group's endpoint. Virtual groups get an aggregating
/// endpoint here, which rejects service operations.
pub struct DockerContainersManager {
    docker: Arc<dyn DockerApi>,
}

impl DockerContainersManager {
    pub fn new(docker: Arc<dyn DockerApi>) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainersManager for DockerContainersManager {
    async fn list_containers(&self) -> Result<Vec<Container>, EndpointError> {
        self.docker
            .list_containers(&GetContainersArg { all: true })
            .await
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerDetails>, EndpointError> {
        self.docker.get_container(id).await
    }

    async fn start_container(&self, id: &str) -> Result<CallResult, EndpointError> {
        self.docker.start_container(id).await
    }

    async fn stop_container(&self, arg: &StopContainerArg) -> Result<CallResult, EndpointError> {
        self.docker.stop_container(arg).await
    }

    async fn restart_container(&self, arg: &StopContainerArg) -> Result<CallResult, EndpointError> {
        self.docker.restart_container(arg).await
    }

    async fn delete_container(&self, arg: &DeleteContainerArg) -> Result<CallResult, EndpointError> {
        self.docker.delete_container(arg).await
    }

    async fn list_services(&self) -> Result<Vec<Service>, EndpointError> {
        self.docker.list_services().await
    }

    async fn get_service(&self, id: &str) -> Result<Option<Service>, EndpointError> {
        self.docker.get_service(id).await
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<CallResult, EndpointError> {
        self.docker.create_service(spec).await
    }

    async fn update_service(&self, cmd: &UpdateServiceCmd) -> Result<CallResult, EndpointError> {
        self.docker.update_service(cmd).await
    }

    async fn delete_service(&self, id: &str) -> Result<CallResult, EndpointError> {
        self.docker.delete_service(id).await
    }
}

// ============================================================================
// Swarm mode
// ============================================================================

pub struct SwarmModeContainersManager {
    docker: Arc<dyn DockerApi>,
    directory: Arc<dyn NodeDirectory>,
    services: SingleValueCache<Arc<Vec<Service>>>,
}

impl SwarmModeContainersManager {
    pub fn new(docker: Arc<dyn DockerApi>, directory: Arc<dyn NodeDirectory>, cache_ttl: Duration) -> Self {
        Self {
            docker,
            directory,
            services: SingleValueCache::new(cache_ttl),
        }
    }

    async fn services(&self) -> Result<Arc<Vec<Service>>, EndpointError> {
        self.services
            .get_or_load(|| async { self.docker.list_services().await.map(Arc::new) })
            .await
    }

    /// Endpoint of the node running a container, the manager otherwise
    fn container_endpoint(&self, id: &str) -> Arc<dyn DockerApi> {
        self.directory
            .container_node(id)
            .and_then(|node| self.directory.node_endpoint(&node))
            .unwrap_or_else(|| self.docker.clone())
    }

    fn service_changed(&self, result: Result<CallResult, EndpointError>) -> Result<CallResult, EndpointError> {
        self.services.invalidate();
        result
    }
}

#[async_trait]
impl ContainersManager for SwarmModeContainersManager {
    async fn list_containers(&self) -> Result<Vec<Container>, EndpointError> {
        let tasks = self.docker.list_tasks(&TaskFilter::default()).await?;
        let service_names: HashMap<String, String> = self
            .services()
            .await?
            .iter()
            .map(|s| (s.id.clone(), s.spec.name.clone()))
            .collect();
        let node_names: HashMap<String, String> = match self.docker.list_nodes().await {
            Ok(nodes) => nodes
                .into_iter()
                .map(|n| (n.id, n.description.hostname))
                .collect(),
            Err(e) => {
                debug!("Swarm nodes unavailable for task listing: {}", e);
                HashMap::new()
            }
        };
        Ok(tasks
            .iter()
            .map(|t| container_from_task(t, &service_names, &node_names))
            .collect())
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerDetails>, EndpointError> {
        self.container_endpoint(id).get_container(id).await
    }

    async fn start_container(&self, id: &str) -> Result<CallResult, EndpointError> {
        self.container_endpoint(id).start_container(id).await
    }

    async fn stop_container(&self, arg: &StopContainerArg) -> Result<CallResult, EndpointError> {
        self.container_endpoint(&arg.id).stop_container(arg).await
    }

    async fn restart_container(&self, arg: &StopContainerArg) -> Result<CallResult, EndpointError> {
        self.container_endpoint(&arg.id).restart_container(arg).await
    }

    async fn delete_container(&self, arg: &DeleteContainerArg) -> Result<CallResult, EndpointError> {
        self.container_endpoint(&arg.id).delete_container(arg).await
    }

    async fn list_services(&self) -> Result<Vec<Service>, EndpointError> {
        Ok(self.services().await?.as_ref().clone())
    }

    async fn get_service(&self, id: &str) -> Result<Option<Service>, EndpointError> {
        self.docker.get_service(id).await
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<CallResult, EndpointError> {
        let result = self.docker.create_service(spec).await;
        self.service_changed(result)
    }

    async fn update_service(&self, cmd: &UpdateServiceCmd) -> Result<CallResult, EndpointError> {
        let result = self.docker.update_service(cmd).await;
        self.service_changed(result)
    }

    async fn delete_service(&self, id: &str) -> Result<CallResult, EndpointError> {
        let result = self.docker.delete_service(id).await;
        self.service_changed(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::nodes::NodeStorage;
    use crate::docker::transport::mock::MockTransport;
    use crate::docker::transport::Method;
    use crate::docker::DockerEndpoint;
    use crate::events::EventBus;
    use serde_json::json;

    #[test]
    fn test_map_task_state() {
        for state in [TaskState::New, TaskState::Pending, TaskState::Preparing, TaskState::Starting] {
            assert_eq!(map_task_state(state), ContainerState::Created);
        }
        assert_eq!(map_task_state(TaskState::Running), ContainerState::Running);
        assert_eq!(map_task_state(TaskState::Complete), ContainerState::Exited);
        assert_eq!(map_task_state(TaskState::Shutdown), ContainerState::Exited);
        assert_eq!(map_task_state(TaskState::Failed), ContainerState::Dead);
        assert_eq!(map_task_state(TaskState::Rejected), ContainerState::Dead);
        assert_eq!(map_task_state(TaskState::Orphaned), ContainerState::Unknown);
    }

    fn swarm_backend() -> Arc<MockTransport> {
        Arc::new(
            MockTransport::new("10.0.0.1:2375")
                .with_json(
                    Method::Get,
                    "/tasks",
                    200,
                    json!([{
                        "ID": "t1",
                        "ServiceID": "s1",
                        "NodeID": "nd1",
                        "Slot": 2,
                        "CreatedAt": "2024-03-01T10:00:00Z",
                        "Spec": {"ContainerSpec": {"Image": "nginx:1.25"}},
                        "Status": {
                            "State": "failed",
                            "Message": "started",
                            "Err": "exit 1",
                            "ContainerStatus": {"ContainerID": "c-abc", "ExitCode": 1}
                        }
                    }]),
                )
                .with_json(
                    Method::Get,
                    "/services",
                    200,
                    json!([{"ID": "s1", "Version": {"Index": 3}, "Spec": {"Name": "web"}}]),
                )
                .with_json(
                    Method::Get,
                    "/nodes",
                    200,
                    json!([{"ID": "nd1", "Description": {"Hostname": "host-1"}}]),
                ),
        )
    }

    #[tokio::test]
    async fn test_swarm_tasks_become_containers() {
        let mock = swarm_backend();
        let docker: Arc<dyn DockerApi> = Arc::new(
            DockerEndpoint::builder(mock.clone())
                .cluster("prod")
                .build()
                .unwrap(),
        );
        let directory = Arc::new(NodeStorage::new(EventBus::new(16)));
        let manager = SwarmModeContainersManager::new(docker, directory, Duration::from_secs(30));

        let containers = manager.list_containers().await.unwrap();
        assert_eq!(containers.len(), 1);
        let c = &containers[0];
        assert_eq!(c.id, "c-abc");
        assert_eq!(c.name(), "web.2");
        assert_eq!(c.image, "nginx:1.25");
        assert_eq!(c.state, ContainerState::Dead);
        assert_eq!(c.status, "exit 1");
        assert_eq!(c.node.as_deref(), Some("host-1"));
        assert_eq!(c.created, 1709287200);

        let services = manager.list_services().await.unwrap();
        assert_eq!(services[0].spec.name, "web");
        let listed = mock
            .requests()
            .iter()
            .filter(|r| r.path == "/services")
            .count();
        assert_eq!(listed, 1, "services are cached between calls");
    }

    #[tokio::test]
    async fn test_swarm_point_operations_route_to_task_node() {
        let manager_mock = swarm_backend();
        let node_mock = Arc::new(MockTransport::new("10.0.0.2:2375").with_json(
            Method::Post,
            "/containers/c-abc/start",
            204,
            json!(null),
        ));
        let events = EventBus::new(16);
        let directory = Arc::new(NodeStorage::new(events.clone()));
        directory.register_node(crate::docker::NodeInfo::new("host-1", "10.0.0.2:2375"));
        directory.attach_endpoint(
            "host-1",
            Arc::new(DockerEndpoint::builder(node_mock.clone()).node("host-1").build().unwrap()),
        );
        directory.record_container("c-abc", "host-1");

        let docker: Arc<dyn DockerApi> = Arc::new(
            DockerEndpoint::builder(manager_mock.clone())
                .cluster("prod")
                .build()
                .unwrap(),
        );
        let manager = SwarmModeContainersManager::new(docker, directory, Duration::from_secs(30));
        let result = manager.start_container("c-abc").await.unwrap();
        assert!(result.is_ok());
        assert_eq!(node_mock.call_count(), 1);
        assert_eq!(manager_mock.call_count(), 0);
    }
}
