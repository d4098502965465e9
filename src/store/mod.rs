//! Key-value store contract and the typed map layered over it
//!
//! The registry persists group configs as JSON documents under one prefix.
//! Writes support a time-to-live and create/update preconditions. Every
//! change is broadcast so other holders of the same store can reconcile.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::events::Action;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precondition {
    #[default]
    None,
    FailIfExists,
    FailIfAbsent,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub ttl: Option<Duration>,
    pub precondition: Precondition,
}

impl WriteOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn fail_if_exists(mut self) -> Self {
        self.precondition = Precondition::FailIfExists;
        self
    }

    pub fn fail_if_absent(mut self) -> Self {
        self.precondition = Precondition::FailIfAbsent;
        self
    }
}

/// Change of one key
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub key: String,
    pub action: Action,
    pub value: Option<String>,
    /// Store-wide modification index
    pub index: u64,
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, options: &WriteOptions) -> Result<(), StoreError>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Live entries whose key starts with `prefix`, ordered by key
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

// ============================================================================
// In-memory engine
// ============================================================================

struct Entry {
    value: String,
    expires: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| now < at)
    }
}

/// Ordered in-memory store. Expired keys are dropped lazily on access.
pub struct InMemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    index: AtomicU64,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            index: AtomicU64::new(0),
            events,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Entry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|e| StoreError::Other(format!("store lock poisoned: {}", e)))
    }

    fn publish(&self, key: &str, action: Action, value: Option<String>) {
        let index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.events.send(StoreEvent {
            key: key.to_string(),
            action,
            value,
            index,
        });
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        let found = entries.get(key).map(|e| (e.is_live(now), e.value.clone()));
        match found {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, options: &WriteOptions) -> Result<(), StoreError> {
        let now = Instant::now();
        let action = {
            let mut entries = self.lock()?;
            let exists = entries.get(key).map_or(false, |e| e.is_live(now));
            match options.precondition {
                Precondition::FailIfExists if exists => {
                    return Err(StoreError::AlreadyExists(key.to_string()))
                }
                Precondition::FailIfAbsent if !exists => {
                    return Err(StoreError::NotFound(key.to_string()))
                }
                _ => {}
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires: options.ttl.map(|ttl| now + ttl),
                },
            );
            if exists {
                Action::Update
            } else {
                Action::Create
            }
        };
        self.publish(key, action, Some(value.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let existed = {
            let mut entries = self.lock()?;
            entries.remove(key).map_or(false, |e| e.is_live(now))
        };
        if existed {
            self.publish(key, Action::Delete, None);
        }
        Ok(existed)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        entries.retain(|_, e| e.is_live(now));
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Typed map
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Change written by another holder of the store
    Storage,
    /// Change made through this map
    Local,
}

#[derive(Debug, Clone)]
pub struct KvMapEvent<T> {
    pub key: String,
    pub action: Action,
    pub origin: Origin,
    /// New value, absent on delete or when it could not be decoded
    pub value: Option<T>,
}

/// Typed view of the direct children of a prefix, stored as JSON
pub struct KvMap<T> {
    store: Arc<dyn KvStore>,
    prefix: String,
    /// Last value written locally per key, used to tell echoes from foreign writes
    written: DashMap<String, Option<String>>,
    events: broadcast::Sender<KvMapEvent<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> KvMap<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn KvStore>, prefix: &str) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            prefix: prefix.trim_end_matches('/').to_string(),
            written: DashMap::new(),
            events,
            _marker: PhantomData,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    fn path(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    /// Map key of a store path, if it is a direct child of the prefix
    pub fn key_of<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        if rest.is_empty() || rest.contains('/') {
            return None;
        }
        Some(rest)
    }

    fn encode(value: &T) -> Result<String, StoreError> {
        serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(raw: &str) -> Result<T, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Loads every child. Undecodable records are logged and skipped.
    pub async fn load_all(&self) -> Result<Vec<(String, T)>, StoreError> {
        let listing = self.store.list(&format!("{}/", self.prefix)).await?;
        let mut loaded = Vec::with_capacity(listing.len());
        for (path, raw) in listing {
            let Some(key) = self.key_of(&path) else {
                continue;
            };
            match Self::decode(&raw) {
                Ok(value) => loaded.push((key.to_string(), value)),
                Err(e) => error!("Skipping unreadable record '{}': {}", path, e),
            }
        }
        Ok(loaded)
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(&self.path(key)).await? {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, value: &T, options: WriteOptions) -> Result<(), StoreError> {
        let raw = Self::encode(value)?;
        let existed = self.store.get(&self.path(key)).await?.is_some();
        self.written.insert(key.to_string(), Some(raw.clone()));
        if let Err(e) = self.store.set(&self.path(key), &raw, &options).await {
            self.written.remove(key);
            return Err(e);
        }
        let action = if existed { Action::Update } else { Action::Create };
        self.publish_local(key, action, Some(value.clone()));
        Ok(())
    }

    /// Creates or replaces the value
    pub async fn put(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.write(key, value, WriteOptions::default()).await
    }

    /// Creates the value, failing if the key is taken
    pub async fn create(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.write(key, value, WriteOptions::default().fail_if_exists())
            .await
    }

    pub async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.written.insert(key.to_string(), None);
        let existed = self.store.delete(&self.path(key)).await?;
        if existed {
            self.publish_local(key, Action::Delete, None);
        } else {
            self.written.remove(key);
        }
        Ok(existed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KvMapEvent<T>> {
        self.events.subscribe()
    }

    fn publish_local(&self, key: &str, action: Action, value: Option<T>) {
        let _ = self.events.send(KvMapEvent {
            key: key.to_string(),
            action,
            origin: Origin::Local,
            value,
        });
    }

    /// Turns a raw store event into a map event. Echoes of local writes
    /// and keys outside the prefix yield nothing.
    pub fn translate(&self, event: &StoreEvent) -> Option<KvMapEvent<T>> {
        let key = self.key_of(&event.key)?;
        let echo = self
            .written
            .remove_if(key, |_, last| *last == event.value)
            .is_some();
        if echo {
            return None;
        }
        let value = match event.value.as_deref() {
            Some(raw) => match Self::decode(raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    error!("Unreadable change of '{}': {}", event.key, e);
                    None
                }
            },
            None => None,
        };
        Some(KvMapEvent {
            key: key.to_string(),
            action: event.action,
            origin: Origin::Storage,
            value,
        })
    }

    async fn run_watch(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<StoreEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                received = changes.recv() => match received {
                    Ok(event) => {
                        if let Some(mapped) = self.translate(&event) {
                            debug!("Storage change {:?} of '{}'", mapped.action, mapped.key);
                            let _ = self.events.send(mapped);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        error!("Store watch of '{}' lagged by {} events", self.prefix, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Store watch of '{}' shutting down", self.prefix);
                        break;
                    }
                }
            }
        }
    }
}

/// Forwards foreign store changes under the map's prefix to its subscribers
pub fn spawn_watch<T>(map: Arc<KvMap<T>>) -> watch::Sender<bool>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let changes = map.store.subscribe();
    tokio::spawn(async move {
        map.run_watch(changes, shutdown_rx).await;
    });
    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        title: String,
    }

    fn doc(title: &str) -> Doc {
        Doc {
            title: title.to_string(),
        }
    }

    #[tokio::test]
    async fn test_preconditions() {
        let store = InMemoryStore::new();
        let create = WriteOptions::default().fail_if_exists();
        store.set("a", "1", &create).await.unwrap();
        assert_eq!(
            store.set("a", "2", &create).await,
            Err(StoreError::AlreadyExists("a".to_string()))
        );
        let update = WriteOptions::default().fail_if_absent();
        assert_eq!(
            store.set("b", "1", &update).await,
            Err(StoreError::NotFound("b".to_string()))
        );
        store.set("a", "3", &update).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store
            .set("k", "v", &WriteOptions::default().with_ttl(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.list("").await.unwrap().is_empty());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = InMemoryStore::new();
        for key in ["clusters/a", "clusters/b", "clustersx", "other/c"] {
            store.set(key, "v", &WriteOptions::default()).await.unwrap();
        }
        let keys: Vec<String> = store
            .list("clusters/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["clusters/a", "clusters/b"]);
    }

    #[tokio::test]
    async fn test_kv_map_load_skips_bad_records() {
        let store = Arc::new(InMemoryStore::new());
        let map: KvMap<Doc> = KvMap::new(store.clone(), "clusters");
        map.put("a", &doc("A")).await.unwrap();
        store
            .set("clusters/broken", "{not json", &WriteOptions::default())
            .await
            .unwrap();
        store
            .set("clusters/a/nested", "{}", &WriteOptions::default())
            .await
            .unwrap();

        let loaded = map.load_all().await.unwrap();
        assert_eq!(loaded, vec![("a".to_string(), doc("A"))]);
        assert!(map.create("a", &doc("again")).await.is_err());
    }

    #[tokio::test]
    async fn test_kv_map_origin_of_events() {
        let store = Arc::new(InMemoryStore::new());
        let map: KvMap<Doc> = KvMap::new(store.clone(), "clusters");
        let mut raw = store.subscribe();
        let mut local = map.subscribe();

        map.put("a", &doc("A")).await.unwrap();
        let event = local.recv().await.unwrap();
        assert_eq!(event.origin, Origin::Local);
        assert_eq!(event.action, Action::Create);
        // the store echo of a local write is not reported again
        let echo = raw.recv().await.unwrap();
        assert!(map.translate(&echo).is_none());

        let other: KvMap<Doc> = KvMap::new(store.clone(), "clusters");
        other.put("b", &doc("B")).await.unwrap();
        let foreign = raw.recv().await.unwrap();
        let mapped = map.translate(&foreign).unwrap();
        assert_eq!(mapped.origin, Origin::Storage);
        assert_eq!(mapped.key, "b");
        assert_eq!(mapped.value, Some(doc("B")));
    }

    #[tokio::test]
    async fn test_spawned_watch_forwards_foreign_deletes() {
        let store = Arc::new(InMemoryStore::new());
        let map = Arc::new(KvMap::<Doc>::new(store.clone(), "clusters"));
        let mut events = map.subscribe();
        let shutdown = spawn_watch(map.clone());

        store
            .set("clusters/x", r#"{"title":"X"}"#, &WriteOptions::default())
            .await
            .unwrap();
        store.delete("clusters/x").await.unwrap();

        let created = events.recv().await.unwrap();
        assert_eq!(created.action, Action::Create);
        assert_eq!(created.value, Some(doc("X")));
        let deleted = events.recv().await.unwrap();
        assert_eq!(deleted.action, Action::Delete);
        assert_eq!(deleted.origin, Origin::Storage);
        let _ = shutdown.send(true);
    }
}
