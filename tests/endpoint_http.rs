//! Integration tests for the HTTP transport
//!
//! An axum server on localhost plays the container runtime.

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use fleetplane::cluster::EndpointConfig;
use fleetplane::docker::endpoint::HttpTransportFactory;
use fleetplane::docker::model::{GetContainersArg, GetLogsArg};
use fleetplane::docker::{DockerApi, DockerEndpoint, EndpointError, EndpointFactory};
use fleetplane::events::{EndpointEventKind, EventBus};

/// Find an available port for testing
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to address")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

#[derive(Clone)]
struct FakeDaemon {
    port: u16,
    token_requests: Arc<AtomicUsize>,
    list_requests: Arc<AtomicUsize>,
}

async fn token(State(daemon): State<FakeDaemon>) -> Json<serde_json::Value> {
    daemon.token_requests.fetch_add(1, Ordering::SeqCst);
    Json(json!({"token": "tok-1"}))
}

async fn list_containers(State(daemon): State<FakeDaemon>, headers: HeaderMap) -> Response {
    daemon.list_requests.fetch_add(1, Ordering::SeqCst);
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer tok-1");
    if !authorized {
        let challenge = format!(
            r#"Bearer realm="http://127.0.0.1:{}/token",service="fake-runtime""#,
            daemon.port
        );
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, challenge)],
            Json(json!({"message": "token required"})),
        )
            .into_response();
    }
    Json(json!([
        {"Id": "c-1", "Names": ["/web"], "Image": "nginx", "State": "running", "Status": "Up 1 minute"}
    ]))
    .into_response()
}

async fn inspect(Path(id): Path<String>) -> Response {
    if id != "c-1" {
        return (StatusCode::NOT_FOUND, Json(json!({"message": "No such container"}))).into_response();
    }
    Json(json!({"Id": "c-1", "Name": "/web", "Image": "nginx"})).into_response()
}

/// One framed stdout line, then the body never ends
async fn endless_logs(Path(_id): Path<String>) -> Response {
    let mut first = vec![1u8, 0, 0, 0, 0, 0, 0, 6];
    first.extend_from_slice(b"hello\n");
    let body = stream::once(async move { Ok::<_, std::io::Error>(first) }).chain(stream::pending());
    Body::from_stream(body).into_response()
}

async fn start_daemon() -> FakeDaemon {
    let port = find_available_port();
    let daemon = FakeDaemon {
        port,
        token_requests: Arc::new(AtomicUsize::new(0)),
        list_requests: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/token", get(token))
        .route("/containers/json", get(list_containers))
        .route("/containers/{id}/json", get(inspect))
        .route("/containers/{id}/logs", get(endless_logs))
        .with_state(daemon.clone());
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind fake daemon");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    // Give server time to start
    sleep(Duration::from_millis(100)).await;
    daemon
}

fn node_endpoint(address: &str, events: EventBus) -> Arc<DockerEndpoint> {
    EndpointFactory::new(Arc::new(HttpTransportFactory), events)
        .with_fast_timeout(Duration::from_secs(2))
        .for_node("n1", address, &EndpointConfig::default())
        .unwrap()
}

#[tokio::test]
async fn test_bearer_challenge_is_answered_once() {
    let daemon = start_daemon().await;
    let endpoint = node_endpoint(&format!("tcp://127.0.0.1:{}", daemon.port), EventBus::new(16));

    let containers = endpoint.list_containers(&GetContainersArg::default()).await.unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].name(), "web");
    assert_eq!(daemon.token_requests.load(Ordering::SeqCst), 1);
    assert_eq!(daemon.list_requests.load(Ordering::SeqCst), 2);

    // the token is cached: a fresh challenge is answered without the realm
    endpoint.list_containers(&GetContainersArg::default()).await.unwrap();
    assert_eq!(daemon.token_requests.load(Ordering::SeqCst), 1);
    assert!(endpoint.is_online());
}

#[tokio::test]
async fn test_unknown_container_is_none() {
    let daemon = start_daemon().await;
    let endpoint = node_endpoint(&format!("127.0.0.1:{}", daemon.port), EventBus::new(16));

    assert!(endpoint.get_container("missing").await.unwrap().is_none());
    let found = endpoint.get_container("c-1").await.unwrap().unwrap();
    assert_eq!(found.image, "nginx");
    assert!(endpoint.is_online());
}

#[tokio::test]
async fn test_connection_refused_marks_offline() {
    // nothing listens on this port
    let port = find_available_port();
    let events = EventBus::new(16);
    let mut rx = events.subscribe_endpoints();
    let endpoint = node_endpoint(&format!("127.0.0.1:{}", port), events);

    let err = endpoint
        .list_containers(&GetContainersArg::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EndpointError::Transport(_)));
    assert!(!endpoint.is_online());
    assert!(matches!(rx.recv().await.unwrap().kind, EndpointEventKind::Offline { .. }));

    // the marker is still actual: fail fast without another offline event
    let err = endpoint
        .list_containers(&GetContainersArg::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EndpointError::Offline { .. }));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_cancel_unblocks_endless_log_stream() {
    let daemon = start_daemon().await;
    let endpoint = node_endpoint(&format!("127.0.0.1:{}", daemon.port), EventBus::new(16));

    let (tx, mut rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let mut arg = GetLogsArg::new("c-1");
    arg.follow = true;
    let call = {
        let endpoint = endpoint.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { endpoint.container_logs(&arg, tx, cancel).await })
    };

    let first = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("first log line")
        .unwrap();
    assert_eq!(first, "hello");

    cancel.cancel();
    let result = timeout(Duration::from_secs(2), call)
        .await
        .expect("cancelled stream returns promptly")
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(endpoint.is_online());
    // the sink is closed once the call has returned
    assert!(rx.recv().await.is_none());
}
