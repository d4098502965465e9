//! # Node groups
//!
//! A node group is a named set of container hosts with one operation
//! surface. Three kinds exist:
//!
//! - **Managed**: a classic multi-host cluster behind one backend address
//! - **Swarm mode**: a backend that understands services and tasks
//! - **Virtual**: membership computed by a filter over every known node
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ClusterRegistry                       │
//! │  name -> NodeGroup        KvMap<GroupConfig> ("clusters") │
//! └──────────────────────────────────────────────────────────┘
//!          │                     │                    │
//!          ▼                     ▼                    ▼
//!   ┌─────────────┐      ┌─────────────┐      ┌──────────────┐
//!   │  managed    │      │ swarm mode  │      │   virtual    │
//!   │ DockerEndp. │      │ DockerEndp. │      │ Aggregating  │
//!   └─────────────┘      └─────────────┘      └──────────────┘
//!          │                                         │
//!          ▼                                         ▼
//!   discovery records                      per-node endpoints
//! ```

pub mod config;
pub mod containers;
pub mod discovery;
pub mod group;
pub mod nodes;
pub mod registry;

pub use config::{EndpointConfig, GroupConfig, GroupKind};
pub use group::{GroupFeature, InitState, NodeGroup};
pub use nodes::{NodeDirectory, NodeStorage};
pub use registry::{ClusterRegistry, GROUP_ALL, GROUP_ORPHANS};

use thiserror::Error;

use crate::docker::EndpointError;
use crate::filter::FilterError;
use crate::security::AccessError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid group name: '{0}'")]
    InvalidName(String),

    #[error("Invalid group config: {0}")]
    InvalidConfig(String),

    #[error("Group not found: {0}")]
    NotFound(String),

    #[error("Illegal operation: {0}")]
    IllegalOperation(String),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Not supported: {0}")]
    NotSupported(String),
}
