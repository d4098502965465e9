//! Process settings
//!
//! Read once at start from a YAML file. Every field has a default so a
//! missing file or an empty one yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{EndpointConfig, GroupConfig, RegistryError};

/// Default settings location: ~/.fleetplane/settings.yaml
pub fn default_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleetplane")
        .join("settings.yaml")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(String),

    #[error("Bad path '{0}': {1}")]
    BadPath(String, String),

    #[error("Invalid group seed: {0}")]
    InvalidGroup(#[from] RegistryError),

    #[error("Invalid setting '{0}': {1}")]
    InvalidValue(&'static str, String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Budget of read-only backend calls
    pub fast_timeout_secs: u64,
    /// Budget of mutating calls on node endpoints
    pub default_docker_timeout_secs: u64,
    pub cache_time_after_write_secs: u64,
    pub dispatch_workers: usize,
    pub info_refresh_interval_secs: u64,
    pub discovery_ttl_secs: u64,
    /// Node addresses reachable without credentials use these
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_credentials: Option<crate::docker::transport::Credentials>,
    /// Groups created at start when absent
    pub groups: Vec<GroupConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fast_timeout_secs: 10,
            default_docker_timeout_secs: 300,
            cache_time_after_write_secs: 10,
            dispatch_workers: 4,
            info_refresh_interval_secs: 30,
            discovery_ttl_secs: 60,
            node_credentials: None,
            groups: Vec::new(),
        }
    }
}

impl Settings {
    pub fn with_fast_timeout(mut self, timeout: Duration) -> Self {
        self.fast_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_dispatch_workers(mut self, workers: usize) -> Self {
        self.dispatch_workers = workers;
        self
    }

    pub fn with_group(mut self, group: GroupConfig) -> Self {
        self.groups.push(group);
        self
    }

    pub fn fast_timeout(&self) -> Duration {
        Duration::from_secs(self.fast_timeout_secs)
    }

    pub fn info_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.info_refresh_interval_secs)
    }

    pub fn discovery_ttl(&self) -> Duration {
        Duration::from_secs(self.discovery_ttl_secs)
    }

    /// Connection settings of endpoints bound to single nodes
    pub fn node_endpoint(&self) -> EndpointConfig {
        EndpointConfig {
            credentials: self.node_credentials.clone(),
            cache_time_after_write_secs: self.cache_time_after_write_secs,
            docker_timeout_secs: self.default_docker_timeout_secs,
            ..EndpointConfig::default()
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Checks values and group seeds, duplicate seed names included
pub fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.fast_timeout_secs == 0 {
        return Err(ConfigError::InvalidValue("fast_timeout_secs", "must be positive".into()));
    }
    if settings.dispatch_workers == 0 {
        return Err(ConfigError::InvalidValue("dispatch_workers", "must be positive".into()));
    }
    if settings.info_refresh_interval_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "info_refresh_interval_secs",
            "must be positive".into(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for group in &settings.groups {
        group.validate()?;
        if !seen.insert(group.name()) {
            return Err(ConfigError::InvalidValue(
                "groups",
                format!("group '{}' is listed twice", group.name()),
            ));
        }
    }
    Ok(())
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Expands `~` and environment variables in a settings path
pub fn expand_path(path: &str) -> Result<PathBuf, ConfigError> {
    shellexpand::full(path)
        .map(|p| PathBuf::from(p.as_ref()))
        .map_err(|e| ConfigError::BadPath(path.to_string(), e.to_string()))
}

/// Loads settings from `path`. A missing file means defaults.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)?;
    let settings = parse_settings(&content)?;
    validate_settings(&settings)?;
    Ok(settings)
}
