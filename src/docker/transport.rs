//! Transport to a container runtime backend
//!
//! The backend speaks an HTTP-shaped RPC protocol. Endpoints only see the
//! `Transport` trait; the reqwest implementation handles addressing and the
//! bearer token exchange that some backends require.

use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use regex::Regex;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Connection and timeout errors count against the offline marker
    pub fn is_network(&self) -> bool {
        matches!(self, TransportError::Connect(_) | TransportError::Timeout(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl Response {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Human readable message of an error reply
    pub fn message(&self) -> String {
        match serde_json::from_slice::<ErrorBody>(&self.body) {
            Ok(body) => body.message,
            Err(_) => String::from_utf8_lossy(&self.body).trim().to_string(),
        }
    }
}

/// Basic credentials used for the runtime and token realms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait Transport: Send + Sync {
    /// Address of the backend this transport talks to
    fn address(&self) -> &str;

    async fn execute(&self, request: Request) -> Result<Response, TransportError>;

    /// Deliver body chunks to `sink` until the stream ends, the sink closes or
    /// `cancel` fires. A non-2xx reply is returned with its body, nothing is
    /// streamed.
    async fn stream(
        &self,
        request: Request,
        sink: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Result<Response, TransportError>;
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.realm.as_bytes());
        hasher.update(b"|");
        hasher.update(self.service.as_deref().unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(self.scope.as_deref().unwrap_or_default().as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

static CHALLENGE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("literal challenge pattern"));

pub fn parse_bearer_challenge(value: &str) -> Option<BearerChallenge> {
    let value = value.trim();
    let (scheme, params) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for cap in CHALLENGE_PARAM.captures_iter(params) {
        let val = cap[2].to_string();
        match &cap[1] {
            "realm" => realm = Some(val),
            "service" => service = Some(val),
            "scope" => scope = Some(val),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

/// Turn `tcp://host:port` or bare `host:port` into an http base url
pub fn normalize_address(address: &str) -> Result<String, TransportError> {
    let address = address.trim().trim_end_matches('/');
    if address.is_empty() {
        return Err(TransportError::InvalidAddress("empty address".to_string()));
    }
    if let Some(rest) = address.strip_prefix("tcp://") {
        return Ok(format!("http://{}", rest));
    }
    if address.starts_with("http://") || address.starts_with("https://") {
        return Ok(address.to_string());
    }
    if address.contains("://") {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }
    Ok(format!("http://{}", address))
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

// ============================================================================
// reqwest implementation
// ============================================================================

#[derive(Deserialize)]
struct TokenReply {
    token: Option<String>,
    access_token: Option<String>,
}

pub struct HttpTransport {
    client: Client,
    address: String,
    base_url: String,
    credentials: Option<Credentials>,
    tokens: DashMap<String, String>,
}

impl HttpTransport {
    pub fn new(address: &str, credentials: Option<Credentials>) -> Result<Self, TransportError> {
        let base_url = normalize_address(address)?;
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            address: address.to_string(),
            base_url,
            credentials,
            tokens: DashMap::new(),
        })
    }

    fn build(&self, request: &Request, bearer: Option<&str>) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        } else if let Some(ref creds) = self.credentials {
            builder = builder.basic_auth(&creds.username, Some(&creds.password));
        }
        builder
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String, TransportError> {
        let key = challenge.cache_key();
        if let Some(token) = self.tokens.get(&key) {
            return Ok(token.clone());
        }
        debug!("Fetching bearer token from {}", challenge.realm);
        let mut builder = self.client.get(&challenge.realm);
        if let Some(ref service) = challenge.service {
            builder = builder.query(&[("service", service)]);
        }
        if let Some(ref scope) = challenge.scope {
            builder = builder.query(&[("scope", scope)]);
        }
        if let Some(ref creds) = self.credentials {
            builder = builder.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = builder.send().await.map_err(map_reqwest_error)?;
        if !response.status().is_success() {
            return Err(TransportError::Other(format!(
                "Token realm {} replied {}",
                challenge.realm,
                response.status()
            )));
        }
        let reply: TokenReply = response
            .json()
            .await
            .map_err(|e| TransportError::Other(format!("Bad token reply: {}", e)))?;
        let token = reply
            .token
            .or(reply.access_token)
            .ok_or_else(|| TransportError::Other("Token reply has no token".to_string()))?;
        self.tokens.insert(key, token.clone());
        Ok(token)
    }

    /// Send once, and once more with a bearer token if the backend challenges us
    async fn send(&self, request: &Request) -> Result<reqwest::Response, TransportError> {
        let response = self
            .build(request, None)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge);
        let Some(challenge) = challenge else {
            return Ok(response);
        };
        let token = self.fetch_token(&challenge).await?;
        let retried = self
            .build(request, Some(&token))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            warn!("Bearer token rejected by {}", self.address);
            self.tokens.remove(&challenge.cache_key());
        }
        Ok(retried)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn execute(&self, request: Request) -> Result<Response, TransportError> {
        let response = self.send(&request).await?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        Ok(Response::new(status, body.to_vec()))
    }

    async fn stream(
        &self,
        request: Request,
        sink: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Result<Response, TransportError> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(Response::new(200, Vec::new())),
            r = self.send(&request) => r?,
        };
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.bytes().await.map_err(map_reqwest_error)?;
            return Ok(Response::new(status, body.to_vec()));
        }
        let mut chunks = response.bytes_stream();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Stream {} on {} cancelled", request.path, self.address);
                    break;
                }
                chunk = chunks.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if sink.send(bytes.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => return Err(map_reqwest_error(e)),
                    None => break,
                }
            }
        }
        Ok(Response::new(status, Vec::new()))
    }
}
