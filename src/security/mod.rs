//! Access control for node groups
//!
//! Evaluation is a contract: callers hand the registry an `AccessContext`
//! and the registry asks it before creating, showing or deleting a group.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role every authenticated user carries
pub const ROLE_USER: &str = "USER";
pub const ROLE_ADMIN: &str = "ADMIN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
}

/// Object an action is applied to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectId {
    /// The class of all groups, used for creation
    ClusterType,
    Cluster(String),
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::ClusterType => f.write_str("cluster"),
            ObjectId::Cluster(name) => write!(f, "cluster:{}", name),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AccessError {
    #[error("Access denied: {principal} may not {action:?} {object}")]
    Denied {
        principal: String,
        object: String,
        action: Action,
    },
}

/// Grant of actions to a security id: `user:<name>` or `role:<role>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub sid: String,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<AclEntry>,
}

impl Acl {
    pub fn owned_by(owner: &str) -> Self {
        Self {
            owner: Some(owner.to_string()),
            entries: Vec::new(),
        }
    }

    pub fn grant(mut self, sid: &str, actions: &[Action]) -> Self {
        self.entries.push(AclEntry {
            sid: sid.to_string(),
            actions: actions.to_vec(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.owner.is_none() && self.entries.is_empty()
    }

    fn allows(&self, sids: &HashSet<String>, action: Action) -> bool {
        self.entries
            .iter()
            .any(|e| sids.contains(&e.sid) && e.actions.contains(&action))
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

pub trait AccessContext: Send + Sync {
    /// Name of the caller, recorded as owner of groups it creates
    fn principal(&self) -> &str;

    fn is_granted(&self, object: &ObjectId, acl: Option<&Acl>, action: Action) -> bool;

    fn assert_granted(
        &self,
        object: &ObjectId,
        acl: Option<&Acl>,
        action: Action,
    ) -> Result<(), AccessError> {
        if self.is_granted(object, acl, action) {
            return Ok(());
        }
        Err(AccessError::Denied {
            principal: self.principal().to_string(),
            object: object.to_string(),
            action,
        })
    }
}

/// Internal callers: bootstrap, event dispatch, background refresh
pub struct SystemContext;

impl AccessContext for SystemContext {
    fn principal(&self) -> &str {
        "system"
    }

    fn is_granted(&self, _object: &ObjectId, _acl: Option<&Acl>, _action: Action) -> bool {
        true
    }
}

/// Authenticated user with roles and class-wide grants
#[derive(Debug, Clone)]
pub struct UserContext {
    name: String,
    roles: HashSet<String>,
    /// Actions granted on every object of a class
    global: Vec<(ObjectId, Action)>,
}

impl UserContext {
    pub fn new(name: &str) -> Self {
        let mut roles = HashSet::new();
        roles.insert(ROLE_USER.to_string());
        Self {
            name: name.to_string(),
            roles,
            global: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.roles.insert(role.to_string());
        self
    }

    pub fn with_grant(mut self, object: ObjectId, action: Action) -> Self {
        self.global.push((object, action));
        self
    }

    fn sids(&self) -> HashSet<String> {
        let mut sids: HashSet<String> = self.roles.iter().map(|r| format!("role:{}", r)).collect();
        sids.insert(format!("user:{}", self.name));
        sids
    }
}

impl AccessContext for UserContext {
    fn principal(&self) -> &str {
        &self.name
    }

    fn is_granted(&self, object: &ObjectId, acl: Option<&Acl>, action: Action) -> bool {
        if self.roles.contains(ROLE_ADMIN) {
            return true;
        }
        let class_wide = self.global.iter().any(|(o, a)| {
            *a == action && (o == object || *o == ObjectId::ClusterType)
        });
        if class_wide {
            return true;
        }
        match acl {
            Some(acl) if acl.owner.as_deref() == Some(self.name.as_str()) => true,
            Some(acl) => acl.allows(&self.sids(), action),
            None => false,
        }
    }
}
