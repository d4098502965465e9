//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::cluster::registry::{spawn_info_refresher, RegistryOptions};
use crate::cluster::{ClusterRegistry, GroupConfig, GroupKind, NodeStorage, RegistryError};
use crate::config::{default_settings_path, expand_path, load_settings, ConfigError, Settings};
use crate::docker::endpoint::HttpTransportFactory;
use crate::docker::EndpointFactory;
use crate::events::{spawn_event_log, EventBus};
use crate::security::SystemContext;
use crate::store::InMemoryStore;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CommandResult<T> = Result<T, CommandError>;

/// One group seed for display
#[derive(Debug, Clone)]
pub struct GroupRow {
    pub name: String,
    pub kind: GroupKind,
    /// Hosts or node filter
    pub target: String,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub groups: Vec<GroupRow>,
    pub error: Option<String>,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Seed row before any binding happened
pub fn seed_row(config: &GroupConfig) -> GroupRow {
    let target = match config {
        GroupConfig::Virtual(c) => c.node_filter.clone(),
        _ => config
            .endpoint()
            .map(|e| e.hosts.join(","))
            .unwrap_or_default(),
    };
    GroupRow {
        name: config.name().to_string(),
        kind: config.kind(),
        target,
        state: "-".to_string(),
    }
}

pub fn resolve_settings_path(arg: Option<&str>) -> CommandResult<PathBuf> {
    match arg {
        Some(path) => Ok(expand_path(path)?),
        None => Ok(default_settings_path()),
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Loads and validates settings, never failing: problems land in the result
pub fn check(path: &Path) -> ValidationResult {
    match load_settings(path) {
        Ok(settings) => ValidationResult {
            valid: true,
            groups: settings.groups.iter().map(seed_row).collect(),
            error: None,
        },
        Err(e) => ValidationResult {
            valid: false,
            groups: Vec::new(),
            error: Some(e.to_string()),
        },
    }
}

/// Builds a registry over an in-memory store wired to real backends
pub async fn build_registry(settings: &Settings, events: EventBus) -> CommandResult<ClusterRegistry> {
    let endpoints = Arc::new(
        EndpointFactory::new(Arc::new(HttpTransportFactory), events.clone())
            .with_fast_timeout(settings.fast_timeout()),
    );
    let nodes = Arc::new(
        NodeStorage::new(events.clone()).with_endpoint_factory(endpoints.clone(), settings.node_endpoint()),
    );
    let options = RegistryOptions::default()
        .with_dispatch_workers(settings.dispatch_workers)
        .with_discovery_ttl(settings.discovery_ttl());
    let registry = ClusterRegistry::new(Arc::new(InMemoryStore::new()), nodes, endpoints, events, options);
    registry.load().await?;
    for seed in &settings.groups {
        let group = registry.get_or_create_group(&SystemContext, seed.clone()).await?;
        info!("Group '{}' ready, state {:?}", group.name(), group.state().state);
    }
    Ok(registry)
}

pub fn group_rows(registry: &ClusterRegistry) -> Vec<GroupRow> {
    registry
        .get_clusters(&SystemContext)
        .iter()
        .map(|group| {
            let mut row = seed_row(&group.get_config());
            let state = group.state();
            row.state = match state.message {
                Some(message) => format!("{:?}: {}", state.state, message),
                None => format!("{:?}", state.state),
            };
            row
        })
        .collect()
}

/// Runs the registry and its background tasks until Ctrl-C
pub async fn serve(settings: Settings) -> CommandResult<()> {
    let events = EventBus::default();
    let event_log = spawn_event_log(&events);
    let registry = build_registry(&settings, events).await?;

    let dispatch = registry.spawn_node_dispatch();
    let store_watch = registry.spawn_store_watch();
    let refresher = spawn_info_refresher(registry.clone(), settings.info_refresh_interval());

    info!(
        "Serving {} groups, refresh every {}s",
        registry.get_services(&SystemContext).len(),
        settings.info_refresh_interval_secs
    );
    tokio::signal::ctrl_c().await?;
    warn!("Interrupted, shutting down");

    for shutdown in [refresher, store_watch, dispatch, event_log] {
        let _ = shutdown.send(true);
    }
    for group in registry.get_clusters(&SystemContext) {
        group.close();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{EndpointConfig, InitState, GROUP_ALL, GROUP_ORPHANS};
    use std::io::Write;

    #[test]
    fn test_seed_row_targets() {
        let managed = GroupConfig::managed("prod", EndpointConfig::default().with_host("10.0.0.1:2375"));
        assert_eq!(seed_row(&managed).target, "10.0.0.1:2375");
        let virt = GroupConfig::virtual_group("edge", "label:zone=edge");
        let row = seed_row(&virt);
        assert_eq!(row.kind, GroupKind::Virtual);
        assert_eq!(row.target, "label:zone=edge");
    }

    #[test]
    fn test_check_reports_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"groups:\n  - kind: virtual\n    name: edge\n    node_filter: ''\n")
            .unwrap();
        let result = check(file.path());
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("empty node filter"));
    }

    #[tokio::test]
    async fn test_build_registry_applies_seeds() {
        let settings = Settings::default().with_group(GroupConfig::virtual_group("edge", "any:*"));
        let registry = build_registry(&settings, EventBus::new(64)).await.unwrap();
        let rows = group_rows(&registry);
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec![GROUP_ALL, "edge", GROUP_ORPHANS]);
        assert!(rows.iter().all(|r| r.state == format!("{:?}", InitState::Inited)));
    }
}
