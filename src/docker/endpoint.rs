//! Endpoint bound to one physical backend
//!
//! Every call goes through one dispatch path: fail fast while the offline
//! marker is actual, run the transport under a timeout budget, then clear or
//! extend the marker depending on the outcome.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{KeyedCache, SingleValueCache};
use super::info::{parse_info, DockerServiceInfo, NodeInfo, NodeInfoProvider, RawInfo};
use super::model::*;
use super::offline::{OfflineMarker, FAST_TIMEOUT};
use super::transport::{Credentials, HttpTransport, Request, Response, Transport, TransportError};
use super::{CallResult, DockerApi, EndpointError, ResultCode};
use crate::cluster::config::EndpointConfig;
use crate::events::{EndpointEvent, EndpointEventKind, EventBus};

/// Post-processing applied to every freshly parsed self-info
pub type InfoHook = Arc<dyn Fn(&mut DockerServiceInfo) + Send + Sync>;

/// Default budget of mutating calls
pub const DEFAULT_DOCKER_TIMEOUT: Duration = Duration::from_secs(300);

/// Cluster-wide reads cost more than single host reads
const CLUSTER_READ_FACTOR: u32 = 3;

#[derive(Debug, Clone, Copy)]
enum Budget {
    Fast,
    Slow,
}

pub struct DockerEndpointBuilder {
    transport: Arc<dyn Transport>,
    cluster: Option<String>,
    node: Option<String>,
    fast_timeout: Duration,
    docker_timeout: Duration,
    cache_ttl: Duration,
    node_info: Option<Arc<dyn NodeInfoProvider>>,
    info_hook: Option<InfoHook>,
    events: EventBus,
}

impl DockerEndpointBuilder {
    pub fn cluster(mut self, cluster: &str) -> Self {
        self.cluster = Some(cluster.to_string());
        self
    }

    pub fn node(mut self, node: &str) -> Self {
        self.node = Some(node.to_string());
        self
    }

    pub fn fast_timeout(mut self, fast_timeout: Duration) -> Self {
        self.fast_timeout = fast_timeout;
        self
    }

    pub fn docker_timeout(mut self, docker_timeout: Duration) -> Self {
        self.docker_timeout = docker_timeout;
        self
    }

    pub fn cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    pub fn node_info(mut self, provider: Arc<dyn NodeInfoProvider>) -> Self {
        self.node_info = Some(provider);
        self
    }

    pub fn info_hook(mut self, hook: InfoHook) -> Self {
        self.info_hook = Some(hook);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<DockerEndpoint, EndpointError> {
        if self.cluster.is_some() && self.node.is_some() {
            return Err(EndpointError::InvalidArgument(format!(
                "endpoint {} can not be bound to both a cluster and a node",
                self.transport.address()
            )));
        }
        let max_timeout = self.docker_timeout.max(self.fast_timeout * 10);
        Ok(DockerEndpoint {
            id: self.transport.address().to_string(),
            cluster: self.cluster,
            node: self.node,
            transport: self.transport,
            marker: OfflineMarker::new(self.fast_timeout, max_timeout),
            fast_timeout: self.fast_timeout,
            max_timeout,
            info_cache: SingleValueCache::new(self.cache_ttl),
            containers: KeyedCache::new(self.cache_ttl),
            last_info: Mutex::new(None),
            node_info: self.node_info,
            info_hook: self.info_hook,
            events: self.events,
        })
    }
}

pub struct DockerEndpoint {
    id: String,
    cluster: Option<String>,
    node: Option<String>,
    transport: Arc<dyn Transport>,
    marker: OfflineMarker,
    fast_timeout: Duration,
    max_timeout: Duration,
    info_cache: SingleValueCache<Arc<DockerServiceInfo>>,
    containers: KeyedCache<String, ContainerDetails>,
    last_info: Mutex<Option<Arc<DockerServiceInfo>>>,
    node_info: Option<Arc<dyn NodeInfoProvider>>,
    info_hook: Option<InfoHook>,
    events: EventBus,
}

impl DockerEndpoint {
    pub fn builder(transport: Arc<dyn Transport>) -> DockerEndpointBuilder {
        DockerEndpointBuilder {
            transport,
            cluster: None,
            node: None,
            fast_timeout: FAST_TIMEOUT,
            docker_timeout: DEFAULT_DOCKER_TIMEOUT,
            cache_ttl: Duration::from_secs(10),
            node_info: None,
            info_hook: None,
            events: EventBus::default(),
        }
    }

    pub fn marker(&self) -> &OfflineMarker {
        &self.marker
    }

    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    /// Last computed self-info, without touching the backend
    pub fn cached_info(&self) -> Option<Arc<DockerServiceInfo>> {
        self.info_cache.peek()
    }

    fn budget(&self, budget: Budget) -> Duration {
        match budget {
            Budget::Fast => {
                let fast = if self.cluster.is_some() {
                    self.fast_timeout * CLUSTER_READ_FACTOR
                } else {
                    self.fast_timeout
                };
                fast.min(self.max_timeout)
            }
            Budget::Slow => self.max_timeout,
        }
    }

    fn publish(&self, kind: EndpointEventKind) {
        self.events.publish_endpoint(EndpointEvent {
            endpoint: self.id.clone(),
            cluster: self.cluster.clone(),
            node: self.node.clone(),
            kind,
        });
    }

    fn check_online(&self) -> Result<(), EndpointError> {
        let now = Instant::now();
        match self.marker.actual_at(now) {
            Some(cause) => Err(EndpointError::Offline {
                endpoint: self.id.clone(),
                cause: format!("{} (retry in {:?})", cause.cause, cause.remaining_at(now)),
            }),
            None => Ok(()),
        }
    }

    fn online(&self) {
        if self.marker.record_success() {
            info!("Endpoint {} is online", self.id);
            self.publish(EndpointEventKind::Online);
        }
    }

    fn failed(&self, e: &TransportError) {
        if !e.is_network() {
            return;
        }
        let cause = e.to_string();
        if self.marker.record_failure(&cause) {
            warn!("Endpoint {} is offline: {}", self.id, cause);
            self.publish(EndpointEventKind::Offline { cause });
        } else {
            debug!("Endpoint {} still failing: {}", self.id, cause);
        }
    }

    async fn call(&self, budget: Budget, request: Request) -> Result<Response, EndpointError> {
        self.check_online()?;
        let limit = self.budget(budget);
        let label = format!("{} {}", request.method, request.path);
        match timeout(limit, self.transport.execute(request)).await {
            Ok(Ok(response)) => {
                self.online();
                Ok(response)
            }
            Ok(Err(e)) => {
                self.failed(&e);
                Err(e.into())
            }
            Err(_) => {
                let e = TransportError::Timeout(format!("{} after {:?}", label, limit));
                self.failed(&e);
                Err(e.into())
            }
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, request: Request) -> Result<Option<T>, EndpointError> {
        let response = self.call(Budget::Fast, request).await?;
        if response.status == 404 {
            return Ok(None);
        }
        check_status(&response)?;
        response
            .json()
            .map(Some)
            .map_err(|e| EndpointError::Decode(e.to_string()))
    }

    async fn fetch_list<T: DeserializeOwned>(&self, request: Request) -> Result<Vec<T>, EndpointError> {
        let response = self.call(Budget::Fast, request).await?;
        check_status(&response)?;
        response
            .json()
            .map_err(|e| EndpointError::Decode(e.to_string()))
    }

    /// Mutating call; runtime failures become an ERROR result
    async fn action(&self, request: Request) -> CallResult {
        match self.call(Budget::Slow, request).await {
            Ok(response) => result_of(&response),
            Err(e) => CallResult::error(e.to_string()),
        }
    }

    /// Mutating call that creates an object and replies with its id
    async fn create(&self, request: Request, id_field: &str) -> CallResult {
        match self.call(Budget::Slow, request).await {
            Ok(response) => {
                let result = result_of(&response);
                let id = response
                    .json::<serde_json::Value>()
                    .ok()
                    .and_then(|v| v.get(id_field).and_then(|id| id.as_str()).map(String::from));
                match id {
                    Some(id) if result.is_ok() => result.with_id(id),
                    _ => result,
                }
            }
            Err(e) => CallResult::error(e.to_string()),
        }
    }

    async fn container_action(&self, id: &str, request: Request) -> CallResult {
        info!("Trying to '{}' container {} on {}", request.path, id, self.id);
        let result = self.action(request).await;
        self.containers.invalidate(&id.to_string());
        result
    }

    /// Run a streaming request, decoding the body into lines for `convert`
    async fn pump<T, F>(
        &self,
        request: Request,
        sink: mpsc::Sender<T>,
        cancel: CancellationToken,
        mut decoder: StreamDecoder,
        convert: F,
    ) -> CallResult
    where
        T: Send,
        F: Fn(String) -> Option<T> + Send + Sync,
    {
        if let Err(e) = self.check_online() {
            return CallResult::error(e.to_string());
        }
        let label = request.path.clone();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        let stop = cancel.clone();
        let produce = self.transport.stream(request, tx, cancel);
        let consume = async move {
            while let Some(chunk) = rx.recv().await {
                for line in decoder.push(&chunk) {
                    let Some(item) = convert(line) else {
                        continue;
                    };
                    if sink.send(item).await.is_err() {
                        // receiver is gone, stop the backend stream too
                        stop.cancel();
                        return;
                    }
                }
            }
            for line in decoder.finish() {
                if let Some(item) = convert(line) {
                    let _ = sink.send(item).await;
                }
            }
        };
        let (result, ()) = tokio::join!(produce, consume);
        match result {
            Ok(response) => {
                self.online();
                result_of(&response)
            }
            Err(e) => {
                self.failed(&e);
                warn!("Stream {} on {} interrupted: {}", label, self.id, e);
                CallResult::error(format!("Stream interrupted: {}", e))
            }
        }
    }

    async fn load_info(&self) -> Result<Arc<DockerServiceInfo>, EndpointError> {
        let raw: RawInfo = self
            .fetch(Request::get("/info"))
            .await?
            .ok_or_else(|| EndpointError::Api {
                status: 404,
                message: "backend has no info".to_string(),
            })?;
        let mut info = parse_info(&raw);
        if let Some(ref provider) = self.node_info {
            // nodes registered with us carry more facts than the backend reports
            for node in info.nodes.iter_mut() {
                if let Some(known) = provider.node_info(&node.name) {
                    let health = known.health.merge_non_null(&node.health);
                    *node = NodeInfo { health, ..known };
                }
            }
        }
        info.off_node_count = 0;
        if let Some(ref hook) = self.info_hook {
            hook(&mut info);
        }
        let info = Arc::new(info);
        self.publish_if_changed(&info);
        Ok(info)
    }

    fn publish_if_changed(&self, info: &Arc<DockerServiceInfo>) {
        let changed = match self.last_info.lock() {
            Ok(mut last) => {
                let changed = last.as_deref() != Some(info.as_ref());
                if changed {
                    *last = Some(info.clone());
                }
                changed
            }
            Err(_) => true,
        };
        if changed {
            debug!("Info of {} changed", self.id);
            self.publish(EndpointEventKind::InfoUpdated(info.clone()));
        }
    }
}

fn check_status(response: &Response) -> Result<(), EndpointError> {
    match response.status {
        401 | 403 => Err(EndpointError::Unauthorized(response.message())),
        _ if response.is_success() => Ok(()),
        status => Err(EndpointError::Api {
            status,
            message: response.message(),
        }),
    }
}

fn result_of(response: &Response) -> CallResult {
    let code = ResultCode::from_status(response.status);
    let message = (!response.is_success()).then(|| response.message());
    CallResult::new(code, message)
}

fn validate_id(id: &str) -> Result<(), EndpointError> {
    if id.trim().is_empty() || id.contains('/') {
        return Err(EndpointError::InvalidArgument(format!("bad id '{}'", id)));
    }
    Ok(())
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Splits a streamed body into lines. Log streams of non-tty containers are
/// multiplexed as `[stream, 0, 0, 0, len(u32 BE)]` framed payloads.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    detect_frames: bool,
    framed: Option<bool>,
    raw: Vec<u8>,
    text: Vec<u8>,
}

impl StreamDecoder {
    pub fn lines() -> Self {
        Self {
            framed: Some(false),
            ..Default::default()
        }
    }

    pub fn logs() -> Self {
        Self {
            detect_frames: true,
            ..Default::default()
        }
    }

    fn take_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.text.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.text.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1])
                .trim_end_matches('\r')
                .to_string();
            lines.push(line);
        }
        lines
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.raw.extend_from_slice(chunk);
        if self.framed.is_none() {
            if self.raw.len() < 4 {
                return Vec::new();
            }
            let header = self.detect_frames
                && self.raw[0] <= 2
                && self.raw[1..4].iter().all(|b| *b == 0);
            self.framed = Some(header);
        }
        if self.framed == Some(true) {
            while self.raw.len() >= 8 {
                let size = u32::from_be_bytes([self.raw[4], self.raw[5], self.raw[6], self.raw[7]])
                    as usize;
                if self.raw.len() < 8 + size {
                    break;
                }
                let frame: Vec<u8> = self.raw.drain(..8 + size).skip(8).collect();
                self.text.extend_from_slice(&frame);
            }
        } else {
            let raw = std::mem::take(&mut self.raw);
            self.text.extend_from_slice(&raw);
        }
        self.take_lines()
    }

    /// Trailing data without a final newline
    pub fn finish(&mut self) -> Vec<String> {
        if self.framed != Some(true) {
            let raw = std::mem::take(&mut self.raw);
            self.text.extend_from_slice(&raw);
        }
        let mut lines = self.take_lines();
        if !self.text.is_empty() {
            lines.push(String::from_utf8_lossy(&self.text).to_string());
            self.text.clear();
        }
        lines
    }
}

fn decode_json<T: DeserializeOwned>(line: String) -> Option<T> {
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&line) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!("Skipping undecodable stream line: {}", e);
            None
        }
    }
}

fn logs_request(path: String, arg: &GetLogsArg) -> Request {
    let mut request = Request::get(path)
        .query("follow", arg.follow as u8)
        .query("stdout", arg.stdout as u8)
        .query("stderr", arg.stderr as u8);
    if let Some(tail) = arg.tail {
        request = request.query("tail", tail);
    }
    request
}

fn task_filters(filter: &TaskFilter) -> Option<String> {
    let mut filters = serde_json::Map::new();
    if let Some(ref service) = filter.service {
        filters.insert("service".to_string(), serde_json::json!([service]));
    }
    if let Some(ref node) = filter.node {
        filters.insert("node".to_string(), serde_json::json!([node]));
    }
    (!filters.is_empty()).then(|| serde_json::Value::Object(filters).to_string())
}

// ============================================================================
// Operation set
// ============================================================================

#[async_trait]
impl DockerApi for DockerEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    fn is_online(&self) -> bool {
        self.marker.is_online()
    }

    fn is_available(&self) -> bool {
        self.marker.actual_at(Instant::now()).is_none()
    }

    async fn get_info(&self) -> Result<Arc<DockerServiceInfo>, EndpointError> {
        self.info_cache.get_or_load(|| self.load_info()).await
    }

    async fn list_containers(&self, arg: &GetContainersArg) -> Result<Vec<Container>, EndpointError> {
        let mut request = Request::get("/containers/json");
        if arg.all {
            request = request.query("all", 1);
        }
        self.fetch_list(request).await
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerDetails>, EndpointError> {
        validate_id(id)?;
        if let Some(details) = self.containers.get(&id.to_string()) {
            return Ok(Some(details));
        }
        let details: Option<ContainerDetails> =
            self.fetch(Request::get(format!("/containers/{}/json", id))).await?;
        if let Some(ref d) = details {
            self.containers.put(id.to_string(), d.clone());
        }
        Ok(details)
    }

    async fn create_container(&self, cmd: &CreateContainerCmd) -> Result<CallResult, EndpointError> {
        if cmd.image.is_empty() {
            return Err(EndpointError::InvalidArgument("image is required".to_string()));
        }
        let body = serde_json::to_value(cmd).map_err(|e| EndpointError::InvalidArgument(e.to_string()))?;
        let mut request = Request::post("/containers/create").json(body);
        if let Some(ref name) = cmd.name {
            request = request.query("name", name);
        }
        Ok(self.create(request, "Id").await)
    }

    async fn start_container(&self, id: &str) -> Result<CallResult, EndpointError> {
        validate_id(id)?;
        let request = Request::post(format!("/containers/{}/start", id));
        Ok(self.container_action(id, request).await)
    }

    async fn stop_container(&self, arg: &StopContainerArg) -> Result<CallResult, EndpointError> {
        validate_id(&arg.id)?;
        let mut request = Request::post(format!("/containers/{}/stop", arg.id));
        if let Some(t) = arg.timeout {
            request = request.query("t", t);
        }
        Ok(self.container_action(&arg.id, request).await)
    }

    async fn restart_container(&self, arg: &StopContainerArg) -> Result<CallResult, EndpointError> {
        validate_id(&arg.id)?;
        let mut request = Request::post(format!("/containers/{}/restart", arg.id));
        if let Some(t) = arg.timeout {
            request = request.query("t", t);
        }
        Ok(self.container_action(&arg.id, request).await)
    }

    async fn kill_container(&self, id: &str, signal: Option<&str>) -> Result<CallResult, EndpointError> {
        validate_id(id)?;
        let mut request = Request::post(format!("/containers/{}/kill", id));
        if let Some(signal) = signal {
            request = request.query("signal", signal);
        }
        Ok(self.container_action(id, request).await)
    }

    async fn pause_container(&self, id: &str) -> Result<CallResult, EndpointError> {
        validate_id(id)?;
        let request = Request::post(format!("/containers/{}/pause", id));
        Ok(self.container_action(id, request).await)
    }

    async fn unpause_container(&self, id: &str) -> Result<CallResult, EndpointError> {
        validate_id(id)?;
        let request = Request::post(format!("/containers/{}/unpause", id));
        Ok(self.container_action(id, request).await)
    }

    async fn delete_container(&self, arg: &DeleteContainerArg) -> Result<CallResult, EndpointError> {
        validate_id(&arg.id)?;
        let mut request = Request::delete(format!("/containers/{}", arg.id));
        if arg.force {
            request = request.query("force", 1);
        }
        if arg.remove_volumes {
            request = request.query("v", 1);
        }
        Ok(self.container_action(&arg.id, request).await)
    }

    async fn update_container(&self, cmd: &UpdateContainerCmd) -> Result<CallResult, EndpointError> {
        validate_id(&cmd.id)?;
        let body = serde_json::to_value(cmd).map_err(|e| EndpointError::InvalidArgument(e.to_string()))?;
        let request = Request::post(format!("/containers/{}/update", cmd.id)).json(body);
        Ok(self.container_action(&cmd.id, request).await)
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<CallResult, EndpointError> {
        validate_id(id)?;
        if new_name.trim().is_empty() {
            return Err(EndpointError::InvalidArgument("new name is empty".to_string()));
        }
        let request = Request::post(format!("/containers/{}/rename", id)).query("name", new_name);
        Ok(self.container_action(id, request).await)
    }

    async fn container_logs(
        &self,
        arg: &GetLogsArg,
        sink: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<CallResult, EndpointError> {
        validate_id(&arg.id)?;
        let request = logs_request(format!("/containers/{}/logs", arg.id), arg);
        Ok(self.pump(request, sink, cancel, StreamDecoder::logs(), Some).await)
    }

    async fn container_stats(
        &self,
        id: &str,
        sink: mpsc::Sender<serde_json::Value>,
        cancel: CancellationToken,
    ) -> Result<CallResult, EndpointError> {
        validate_id(id)?;
        let request = Request::get(format!("/containers/{}/stats", id)).query("stream", 1);
        Ok(self
            .pump(request, sink, cancel, StreamDecoder::lines(), decode_json)
            .await)
    }

    async fn subscribe_events(
        &self,
        sink: mpsc::Sender<DockerEvent>,
        cancel: CancellationToken,
    ) -> Result<CallResult, EndpointError> {
        Ok(self
            .pump(Request::get("/events"), sink, cancel, StreamDecoder::lines(), decode_json)
            .await)
    }

    async fn list_services(&self) -> Result<Vec<Service>, EndpointError> {
        self.fetch_list(Request::get("/services")).await
    }

    async fn get_service(&self, id: &str) -> Result<Option<Service>, EndpointError> {
        validate_id(id)?;
        self.fetch(Request::get(format!("/services/{}", id))).await
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<CallResult, EndpointError> {
        if spec.name.is_empty() || spec.image.is_empty() {
            return Err(EndpointError::InvalidArgument(
                "service name and image are required".to_string(),
            ));
        }
        let body = serde_json::to_value(spec.to_wire())
            .map_err(|e| EndpointError::InvalidArgument(e.to_string()))?;
        Ok(self.create(Request::post("/services/create").json(body), "ID").await)
    }

    async fn update_service(&self, cmd: &UpdateServiceCmd) -> Result<CallResult, EndpointError> {
        validate_id(&cmd.service_id)?;
        let body = serde_json::to_value(cmd.spec.to_wire())
            .map_err(|e| EndpointError::InvalidArgument(e.to_string()))?;
        let request = Request::post(format!("/services/{}/update", cmd.service_id))
            .query("version", cmd.version)
            .json(body);
        Ok(self.action(request).await)
    }

    async fn delete_service(&self, id: &str) -> Result<CallResult, EndpointError> {
        validate_id(id)?;
        Ok(self.action(Request::delete(format!("/services/{}", id))).await)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, EndpointError> {
        let mut request = Request::get("/tasks");
        if let Some(filters) = task_filters(filter) {
            request = request.query("filters", filters);
        }
        self.fetch_list(request).await
    }

    async fn service_logs(
        &self,
        arg: &GetLogsArg,
        sink: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<CallResult, EndpointError> {
        validate_id(&arg.id)?;
        let request = logs_request(format!("/services/{}/logs", arg.id), arg);
        Ok(self.pump(request, sink, cancel, StreamDecoder::logs(), Some).await)
    }

    async fn pull_image(&self, name: &str) -> Result<CallResult, EndpointError> {
        if name.trim().is_empty() {
            return Err(EndpointError::InvalidArgument("image name is empty".to_string()));
        }
        info!("Pulling image {} on {}", name, self.id);
        Ok(self
            .action(Request::post("/images/create").query("fromImage", name))
            .await)
    }

    async fn list_images(&self, arg: &GetImagesArg) -> Result<Vec<ImageItem>, EndpointError> {
        let mut request = Request::get("/images/json").query("all", arg.all as u8);
        if let Some(ref name) = arg.name {
            request = request.query("filter", name);
        }
        self.fetch_list(request).await
    }

    async fn inspect_image(&self, name: &str) -> Result<Option<ImageDetails>, EndpointError> {
        if name.trim().is_empty() {
            return Err(EndpointError::InvalidArgument("image name is empty".to_string()));
        }
        self.fetch(Request::get(format!("/images/{}/json", name))).await
    }

    async fn remove_image(&self, name: &str, force: bool) -> Result<CallResult, EndpointError> {
        if name.trim().is_empty() {
            return Err(EndpointError::InvalidArgument("image name is empty".to_string()));
        }
        let mut request = Request::delete(format!("/images/{}", name));
        if force {
            request = request.query("force", 1);
        }
        Ok(self.action(request).await)
    }

    async fn create_network(&self, cmd: &CreateNetworkCmd) -> Result<CallResult, EndpointError> {
        if cmd.name.trim().is_empty() {
            return Err(EndpointError::InvalidArgument("network name is empty".to_string()));
        }
        let body = serde_json::to_value(cmd).map_err(|e| EndpointError::InvalidArgument(e.to_string()))?;
        Ok(self.create(Request::post("/networks/create").json(body), "Id").await)
    }

    async fn list_networks(&self) -> Result<Vec<Network>, EndpointError> {
        self.fetch_list(Request::get("/networks")).await
    }

    async fn delete_network(&self, id: &str) -> Result<CallResult, EndpointError> {
        validate_id(id)?;
        Ok(self.action(Request::delete(format!("/networks/{}", id))).await)
    }

    async fn init_swarm(&self, cmd: &SwarmInitCmd) -> Result<CallResult, EndpointError> {
        let body = serde_json::to_value(cmd).map_err(|e| EndpointError::InvalidArgument(e.to_string()))?;
        Ok(self.action(Request::post("/swarm/init").json(body)).await)
    }

    async fn join_swarm(&self, cmd: &SwarmJoinCmd) -> Result<CallResult, EndpointError> {
        if cmd.remote_addrs.is_empty() {
            return Err(EndpointError::InvalidArgument("no remote managers".to_string()));
        }
        let body = serde_json::to_value(cmd).map_err(|e| EndpointError::InvalidArgument(e.to_string()))?;
        Ok(self.action(Request::post("/swarm/join").json(body)).await)
    }

    async fn leave_swarm(&self, force: bool) -> Result<CallResult, EndpointError> {
        Ok(self
            .action(Request::post("/swarm/leave").query("force", force))
            .await)
    }

    async fn inspect_swarm(&self) -> Result<Option<SwarmInspect>, EndpointError> {
        let response = self.call(Budget::Fast, Request::get("/swarm")).await?;
        // a node outside of any swarm answers 503
        if response.status == 404 || response.status == 503 {
            return Ok(None);
        }
        check_status(&response)?;
        response
            .json()
            .map(Some)
            .map_err(|e| EndpointError::Decode(e.to_string()))
    }

    async fn list_nodes(&self) -> Result<Vec<SwarmNode>, EndpointError> {
        self.fetch_list(Request::get("/nodes")).await
    }

    async fn update_node(&self, cmd: &UpdateNodeCmd) -> Result<CallResult, EndpointError> {
        validate_id(&cmd.node_id)?;
        let body = serde_json::to_value(&cmd.spec)
            .map_err(|e| EndpointError::InvalidArgument(e.to_string()))?;
        let request = Request::post(format!("/nodes/{}/update", cmd.node_id))
            .query("version", cmd.version)
            .json(body);
        Ok(self.action(request).await)
    }

    async fn remove_node(&self, id: &str, force: bool) -> Result<CallResult, EndpointError> {
        validate_id(id)?;
        let mut request = Request::delete(format!("/nodes/{}", id));
        if force {
            request = request.query("force", 1);
        }
        Ok(self.action(request).await)
    }
}

// ============================================================================
// Construction from persisted configuration
// ============================================================================

/// Creates transports for backend addresses
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        address: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn create(
        &self,
        address: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(HttpTransport::new(address, credentials.cloned())?))
    }
}

/// Builds endpoints for clusters and nodes with shared wiring
pub struct EndpointFactory {
    transports: Arc<dyn TransportFactory>,
    events: EventBus,
    fast_timeout: Duration,
}

impl EndpointFactory {
    pub fn new(transports: Arc<dyn TransportFactory>, events: EventBus) -> Self {
        Self {
            transports,
            events,
            fast_timeout: FAST_TIMEOUT,
        }
    }

    pub fn with_fast_timeout(mut self, fast_timeout: Duration) -> Self {
        self.fast_timeout = fast_timeout;
        self
    }

    fn builder(&self, address: &str, config: &EndpointConfig) -> Result<DockerEndpointBuilder, EndpointError> {
        let transport = self
            .transports
            .create(address, config.credentials.as_ref())?;
        Ok(DockerEndpoint::builder(transport)
            .fast_timeout(self.fast_timeout)
            .docker_timeout(config.docker_timeout())
            .cache_ttl(config.cache_time_after_write())
            .events(self.events.clone()))
    }

    pub fn for_cluster(
        &self,
        cluster: &str,
        config: &EndpointConfig,
        node_info: Option<Arc<dyn NodeInfoProvider>>,
        hook: Option<InfoHook>,
    ) -> Result<Arc<DockerEndpoint>, EndpointError> {
        let host = config.hosts.first().ok_or_else(|| {
            EndpointError::InvalidArgument(format!("cluster '{}' has no hosts", cluster))
        })?;
        let mut builder = self.builder(host, config)?.cluster(cluster);
        if let Some(provider) = node_info {
            builder = builder.node_info(provider);
        }
        if let Some(hook) = hook {
            builder = builder.info_hook(hook);
        }
        Ok(Arc::new(builder.build()?))
    }

    pub fn for_node(
        &self,
        node: &str,
        address: &str,
        config: &EndpointConfig,
    ) -> Result<Arc<DockerEndpoint>, EndpointError> {
        Ok(Arc::new(self.builder(address, config)?.node(node).build()?))
    }
}

#[cfg(test)]
mod tests {
    use super::super::transport::mock::{MockReply, MockTransport};
    use super::super::transport::Method;
    use super::*;
    use crate::docker::info::{NodeMetrics, NodeState};
    use crate::events::EndpointEventKind;
    use serde_json::json;

    fn endpoint(mock: Arc<MockTransport>) -> (DockerEndpoint, EventBus) {
        let events = EventBus::new(256);
        let endpoint = DockerEndpoint::builder(mock)
            .node("node-1")
            .events(events.clone())
            .build()
            .unwrap();
        (endpoint, events)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<EndpointEvent>) -> (usize, usize, usize) {
        let (mut off, mut on, mut infos) = (0, 0, 0);
        while let Ok(event) = rx.try_recv() {
            match event.kind {
                EndpointEventKind::Offline { .. } => off += 1,
                EndpointEventKind::Online => on += 1,
                EndpointEventKind::InfoUpdated(_) => infos += 1,
            }
        }
        (off, on, infos)
    }

    #[test]
    fn test_cluster_and_node_are_exclusive() {
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375"));
        let result = DockerEndpoint::builder(mock).cluster("c1").node("n1").build();
        assert!(matches!(result, Err(EndpointError::InvalidArgument(_))));
    }

    #[test]
    fn test_budgets() {
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375"));
        let single = DockerEndpoint::builder(mock.clone())
            .docker_timeout(Duration::from_secs(20))
            .build()
            .unwrap();
        // max is never below ten fast budgets
        assert_eq!(single.max_timeout(), Duration::from_secs(100));
        assert_eq!(single.budget(Budget::Fast), Duration::from_secs(10));
        assert_eq!(single.budget(Budget::Slow), Duration::from_secs(100));

        let cluster = DockerEndpoint::builder(mock).cluster("c1").build().unwrap();
        assert_eq!(cluster.budget(Budget::Fast), Duration::from_secs(30));
        assert_eq!(cluster.budget(Budget::Slow), DEFAULT_DOCKER_TIMEOUT);
    }

    #[tokio::test]
    async fn test_get_container_not_found_is_none() {
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375"));
        let (endpoint, _) = endpoint(mock);
        assert!(endpoint.get_container("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_container_is_cached_until_mutation() {
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375").with_json(
            Method::Get,
            "/containers/abc/json",
            200,
            json!({"Id": "abc", "Name": "/web", "State": {"Status": "running", "Running": true}}),
        ));
        mock.set_json(Method::Post, "/containers/abc/stop", 204, json!({}));
        let (endpoint, _) = endpoint(mock.clone());

        let details = endpoint.get_container("abc").await.unwrap().unwrap();
        assert!(details.state.running);
        endpoint.get_container("abc").await.unwrap();
        assert_eq!(mock.call_count(), 1);

        let result = endpoint.stop_container(&StopContainerArg::new("abc")).await.unwrap();
        assert_eq!(result.code, ResultCode::Ok);
        endpoint.get_container("abc").await.unwrap();
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_status_codes_map_to_results() {
        let mock = Arc::new(
            MockTransport::new("10.0.0.1:2375")
                .with_json(Method::Post, "/containers/a/start", 304, json!({}))
                .with_json(Method::Post, "/containers/b/start", 409, json!({"message": "in use"}))
                .with_json(Method::Post, "/containers/c/start", 500, json!({"message": "boom"})),
        );
        let (endpoint, _) = endpoint(mock);
        let a = endpoint.start_container("a").await.unwrap();
        assert_eq!(a.code, ResultCode::NotModified);
        let b = endpoint.start_container("b").await.unwrap();
        assert_eq!(b.code, ResultCode::Conflict);
        assert_eq!(b.message.as_deref(), Some("in use"));
        let c = endpoint.start_container("c").await.unwrap();
        assert_eq!(c.code, ResultCode::Error);
        let d = endpoint.start_container("d").await.unwrap();
        assert_eq!(d.code, ResultCode::NotFound);
        // protocol level errors never mark the endpoint offline
        assert!(endpoint.is_online());
    }

    #[tokio::test]
    async fn test_invalid_id_is_rejected() {
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375"));
        let (endpoint, _) = endpoint(mock.clone());
        let result = endpoint.start_container("").await;
        assert!(matches!(result, Err(EndpointError::InvalidArgument(_))));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_marks_offline_and_fails_fast() {
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375"));
        mock.fail_with(Some(TransportError::Connect("refused".into())));
        let (endpoint, events) = endpoint(mock.clone());
        let mut rx = events.subscribe_endpoints();

        let first = endpoint.list_containers(&GetContainersArg::default()).await;
        assert!(matches!(first, Err(EndpointError::Transport(_))));
        assert!(!endpoint.is_online());

        let second = endpoint.list_containers(&GetContainersArg::default()).await;
        assert!(matches!(second, Err(EndpointError::Offline { .. })));
        assert_eq!(mock.call_count(), 1);

        let result = endpoint.start_container("abc").await.unwrap();
        assert_eq!(result.code, ResultCode::Error);
        assert_eq!(drain(&mut rx), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_non_network_failure_keeps_online() {
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375"));
        mock.fail_with(Some(TransportError::Other("tls handshake".into())));
        let (endpoint, _) = endpoint(mock);
        assert!(endpoint.list_networks().await.is_err());
        assert!(endpoint.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375").with_json(
            Method::Get,
            "/networks",
            200,
            json!([]),
        ));
        mock.set_delay(Some(Duration::from_secs(60)));
        let (endpoint, _) = endpoint(mock);
        let result = endpoint.list_networks().await;
        assert!(matches!(
            result,
            Err(EndpointError::Transport(TransportError::Timeout(_)))
        ));
        assert!(!endpoint.is_online());
    }

    #[tokio::test]
    async fn test_concurrent_failures_then_success_fire_each_edge_once() {
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375").with_json(
            Method::Get,
            "/networks",
            200,
            json!([]),
        ));
        mock.fail_with(Some(TransportError::Connect("refused".into())));
        mock.set_delay(Some(Duration::from_millis(20)));
        let events = EventBus::new(256);
        let endpoint = Arc::new(
            DockerEndpoint::builder(mock.clone())
                .fast_timeout(Duration::from_millis(100))
                .events(events.clone())
                .build()
                .unwrap(),
        );
        let mut rx = events.subscribe_endpoints();

        // all calls pass the marker check before any of them fails
        let calls: Vec<_> = (0..32)
            .map(|_| {
                let endpoint = endpoint.clone();
                tokio::spawn(async move { endpoint.list_networks().await })
            })
            .collect();
        for call in calls {
            assert!(call.await.unwrap().is_err());
        }
        assert_eq!(mock.call_count(), 32);
        assert!(!endpoint.is_online());

        mock.fail_with(None);
        mock.set_delay(None);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(endpoint.list_networks().await.is_ok());
        assert!(endpoint.list_networks().await.is_ok());

        let (off, on, _) = drain(&mut rx);
        assert_eq!(off, 1);
        assert_eq!(on, 1);
        assert!(endpoint.is_online());
    }

    #[tokio::test]
    async fn test_info_is_cached_and_change_events_deduplicated() {
        let info = json!({
            "ID": "x", "Name": "host-1", "Containers": 3, "ContainersRunning": 1,
            "SystemStatus": [["Nodes", "1"], [" node-1", "10.0.0.1:2375"], ["  └ Status", "Healthy"]]
        });
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375").with_json(Method::Get, "/info", 200, info));
        let events = EventBus::new(64);
        let endpoint = DockerEndpoint::builder(mock.clone())
            .cache_ttl(Duration::ZERO)
            .events(events.clone())
            .build()
            .unwrap();
        let mut rx = events.subscribe_endpoints();

        for _ in 0..3 {
            let info = endpoint.get_info().await.unwrap();
            assert_eq!(info.off_containers, 2);
            assert_eq!(info.nodes[0].health.state, Some(NodeState::Healthy));
        }
        assert_eq!(mock.call_count(), 3);
        assert_eq!(drain(&mut rx), (0, 0, 1));

        mock.set_json(Method::Get, "/info", 200, json!({"ID": "x", "Name": "host-1"}));
        endpoint.get_info().await.unwrap();
        assert_eq!(drain(&mut rx), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_info_hook_and_node_merge() {
        struct Known;
        impl NodeInfoProvider for Known {
            fn node_info(&self, name: &str) -> Option<NodeInfo> {
                (name == "node-1").then(|| {
                    NodeInfo::new("node-1", "10.0.0.1:2375")
                        .with_cluster("c1")
                        .with_health(NodeMetrics {
                            sys_mem_total: Some(64),
                            ..Default::default()
                        })
                })
            }
        }
        let info = json!({
            "Name": "manager",
            "SystemStatus": [["Nodes", "1"], [" node-1", "10.0.0.1:2375"], ["  └ Status", "Unhealthy"]]
        });
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375").with_json(Method::Get, "/info", 200, info));
        let hook: InfoHook = Arc::new(|info: &mut DockerServiceInfo| info.name = "c1".to_string());
        let endpoint = DockerEndpoint::builder(mock)
            .cluster("c1")
            .node_info(Arc::new(Known))
            .info_hook(hook)
            .build()
            .unwrap();

        let info = endpoint.get_info().await.unwrap();
        assert_eq!(info.name, "c1");
        let node = &info.nodes[0];
        assert_eq!(node.cluster.as_deref(), Some("c1"));
        assert_eq!(node.health.sys_mem_total, Some(64));
        assert_eq!(node.health.state, Some(NodeState::Unhealthy));
    }

    #[tokio::test]
    async fn test_create_container_returns_id() {
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375").with_json(
            Method::Post,
            "/containers/create",
            201,
            json!({"Id": "new-id", "Warnings": []}),
        ));
        let (endpoint, _) = endpoint(mock.clone());
        let cmd = CreateContainerCmd {
            name: Some("web".to_string()),
            image: "nginx".to_string(),
            ..Default::default()
        };
        let result = endpoint.create_container(&cmd).await.unwrap();
        assert!(result.is_ok());
        assert_eq!(result.id.as_deref(), Some("new-id"));
        let request = &mock.requests()[0];
        assert_eq!(request.query, vec![("name".to_string(), "web".to_string())]);
    }

    #[tokio::test]
    async fn test_update_node_posts_versioned_spec() {
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375").with_json(
            Method::Post,
            "/nodes/n-1/update",
            200,
            json!({}),
        ));
        let (endpoint, _) = endpoint(mock.clone());
        let cmd = UpdateNodeCmd {
            node_id: "n-1".to_string(),
            version: 7,
            spec: SwarmNodeSpec {
                role: "worker".to_string(),
                availability: "drain".to_string(),
                ..Default::default()
            },
        };
        assert!(endpoint.update_node(&cmd).await.unwrap().is_ok());

        let request = &mock.requests()[0];
        assert_eq!(request.query, vec![("version".to_string(), "7".to_string())]);
        let body = request.body.as_ref().unwrap();
        assert_eq!(body["Availability"], "drain");
        assert_eq!(body["Role"], "worker");
    }

    #[tokio::test]
    async fn test_logs_stream_until_cancelled() {
        let mut framed = vec![1u8, 0, 0, 0, 0, 0, 0, 6];
        framed.extend_from_slice(b"hello\n");
        framed.extend_from_slice(&[2u8, 0, 0, 0, 0, 0, 0, 6]);
        framed.extend_from_slice(b"world\n");
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375"));
        mock.set_reply(Method::Get, "/containers/abc/logs", MockReply::Chunks(vec![framed]));
        let (endpoint, _) = endpoint(mock);

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let reader = tokio::spawn(async move {
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                lines.push(line);
                if lines.len() == 2 {
                    stopper.cancel();
                }
            }
            lines
        });
        let mut arg = GetLogsArg::new("abc");
        arg.follow = true;
        let result = endpoint.container_logs(&arg, tx, cancel).await.unwrap();
        assert!(result.is_ok());
        assert_eq!(reader.await.unwrap(), vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn test_stream_on_offline_endpoint_is_error_result() {
        let mock = Arc::new(MockTransport::new("10.0.0.1:2375"));
        let (endpoint, _) = endpoint(mock);
        endpoint.marker().record_failure("refused");
        let (tx, _rx) = mpsc::channel(1);
        let result = endpoint
            .subscribe_events(tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.code, ResultCode::Error);
    }

    #[test]
    fn test_stream_decoder_plain_lines_across_chunks() {
        let mut decoder = StreamDecoder::lines();
        assert!(decoder.push(b"{\"a\":").is_empty());
        assert_eq!(decoder.push(b"1}\n{\"b\""), vec!["{\"a\":1}"]);
        assert_eq!(decoder.push(b":2}\r\n"), vec!["{\"b\":2}"]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_stream_decoder_split_frame() {
        let mut decoder = StreamDecoder::logs();
        let mut frame = vec![1u8, 0, 0, 0, 0, 0, 0, 4];
        frame.extend_from_slice(b"tail");
        assert!(decoder.push(&frame[..6]).is_empty());
        assert!(decoder.push(&frame[6..]).is_empty());
        assert_eq!(decoder.finish(), vec!["tail"]);
    }

    #[test]
    fn test_task_filters() {
        assert_eq!(task_filters(&TaskFilter::default()), None);
        let filter = TaskFilter {
            service: Some("web".to_string()),
            node: None,
        };
        assert_eq!(task_filters(&filter).unwrap(), r#"{"service":["web"]}"#);
    }
}
