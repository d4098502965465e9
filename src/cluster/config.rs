//! Persisted node group configuration
//!
//! A config is decoded once by its `kind` discriminator into one of a closed
//! set of variants. Configs are immutable values: updates clone, mutate the
//! clone and replace the whole record.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::docker::transport::Credentials;
use crate::security::Acl;

use super::RegistryError;

/// Connection descriptor of a cluster backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Backend addresses, the first one is used
    pub hosts: Vec<String>,
    pub credentials: Option<Credentials>,
    pub cache_time_after_write_secs: u64,
    pub docker_timeout_secs: u64,
    /// Image registries available to the cluster
    pub registries: Vec<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            credentials: None,
            cache_time_after_write_secs: 10,
            docker_timeout_secs: 300,
            registries: Vec::new(),
        }
    }
}

impl EndpointConfig {
    pub fn with_host(mut self, host: &str) -> Self {
        self.hosts.push(host.to_string());
        self
    }

    pub fn cache_time_after_write(&self) -> Duration {
        Duration::from_secs(self.cache_time_after_write_secs)
    }

    pub fn docker_timeout(&self) -> Duration {
        Duration::from_secs(self.docker_timeout_secs)
    }
}

/// Fields shared by every kind of group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Filter expression restricting the images usable in the group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_filter: Option<String>,
    #[serde(default)]
    pub acl: Acl,
}

impl CommonConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            title: None,
            description: None,
            image_filter: None,
            acl: Acl::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedClusterConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmModeClusterConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    /// Names of the manager nodes
    #[serde(default)]
    pub managers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualGroupConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    /// Node membership filter expression
    pub node_filter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Managed,
    SwarmMode,
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupConfig {
    Managed(ManagedClusterConfig),
    SwarmMode(SwarmModeClusterConfig),
    Virtual(VirtualGroupConfig),
}

impl GroupConfig {
    pub fn managed(name: &str, endpoint: EndpointConfig) -> Self {
        GroupConfig::Managed(ManagedClusterConfig {
            common: CommonConfig::new(name),
            endpoint,
        })
    }

    pub fn swarm_mode(name: &str, endpoint: EndpointConfig, managers: Vec<String>) -> Self {
        GroupConfig::SwarmMode(SwarmModeClusterConfig {
            common: CommonConfig::new(name),
            endpoint,
            managers,
        })
    }

    pub fn virtual_group(name: &str, node_filter: &str) -> Self {
        GroupConfig::Virtual(VirtualGroupConfig {
            common: CommonConfig::new(name),
            node_filter: node_filter.to_string(),
        })
    }

    pub fn kind(&self) -> GroupKind {
        match self {
            GroupConfig::Managed(_) => GroupKind::Managed,
            GroupConfig::SwarmMode(_) => GroupKind::SwarmMode,
            GroupConfig::Virtual(_) => GroupKind::Virtual,
        }
    }

    pub fn common(&self) -> &CommonConfig {
        match self {
            GroupConfig::Managed(c) => &c.common,
            GroupConfig::SwarmMode(c) => &c.common,
            GroupConfig::Virtual(c) => &c.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut CommonConfig {
        match self {
            GroupConfig::Managed(c) => &mut c.common,
            GroupConfig::SwarmMode(c) => &mut c.common,
            GroupConfig::Virtual(c) => &mut c.common,
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    pub fn endpoint(&self) -> Option<&EndpointConfig> {
        match self {
            GroupConfig::Managed(c) => Some(&c.endpoint),
            GroupConfig::SwarmMode(c) => Some(&c.endpoint),
            GroupConfig::Virtual(_) => None,
        }
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        validate_name(self.name())?;
        if let GroupConfig::Virtual(ref c) = self {
            if c.node_filter.trim().is_empty() {
                return Err(RegistryError::InvalidConfig(format!(
                    "group '{}' has an empty node filter",
                    c.common.name
                )));
            }
        }
        Ok(())
    }

    /// Top level fields that differ between two configs of the same group
    pub fn changed_fields(&self, other: &GroupConfig) -> Vec<String> {
        let (a, b) = (self.common(), other.common());
        let mut changed = Vec::new();
        if a.title != b.title {
            changed.push("title");
        }
        if a.description != b.description {
            changed.push("description");
        }
        if a.image_filter != b.image_filter {
            changed.push("image_filter");
        }
        if a.acl != b.acl {
            changed.push("acl");
        }
        if self.endpoint() != other.endpoint() {
            changed.push("endpoint");
        }
        match (self, other) {
            (GroupConfig::SwarmMode(x), GroupConfig::SwarmMode(y)) if x.managers != y.managers => {
                changed.push("managers")
            }
            (GroupConfig::Virtual(x), GroupConfig::Virtual(y)) if x.node_filter != y.node_filter => {
                changed.push("node_filter")
            }
            _ => {}
        }
        changed.into_iter().map(String::from).collect()
    }
}

/// Group names are restricted to letters, digits and dashes
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    let re = Regex::new(r"^[A-Za-z0-9-]+$")
        .map_err(|e| RegistryError::InvalidName(format!("{}: {}", name, e)))?;
    if !re.is_match(name) {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}
