//! Node filter expressions
//!
//! An expression is `<protocol>:<argument>`. Built-in protocols:
//!
//! - `any:*`, `noOne:*`
//! - `list:a,b,c` node names
//! - `regex:<pattern>` whole-name match
//! - `label:k=v,k2=!v2` node labels, `!` negates
//! - `cluster:<name>` cluster claimed by the node
//!
//! Further protocols are registered at runtime, the registry adds `orphans`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use thiserror::Error;

use crate::docker::info::NodeInfo;

pub const ANY: &str = "any:*";
pub const NO_ONE: &str = "noOne:*";

pub type NodePredicate = Arc<dyn Fn(&NodeInfo) -> bool + Send + Sync>;

/// Builds a predicate from the argument part of an expression
pub type FilterConstructor = Arc<dyn Fn(&str) -> Result<NodePredicate, FilterError> + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("Malformed filter expression: '{0}'")]
    Malformed(String),

    #[error("Can not find factory for: '{0}'")]
    UnknownProtocol(String),

    #[error("Invalid regex in '{expr}': {reason}")]
    InvalidRegex { expr: String, reason: String },
}

#[derive(Clone)]
enum Criteria {
    Any,
    NoOne,
    List(HashSet<String>),
    Regex(Regex),
    /// (key, value, required)
    Labels(Vec<(String, String, bool)>),
    Cluster(String),
    Custom(NodePredicate),
}

/// Compiled filter expression
#[derive(Clone)]
pub struct Filter {
    expr: String,
    criteria: Criteria,
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Filter").field(&self.expr).finish()
    }
}

impl Filter {
    pub fn any() -> Self {
        Self {
            expr: ANY.to_string(),
            criteria: Criteria::Any,
        }
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    pub fn matches(&self, node: &NodeInfo) -> bool {
        match &self.criteria {
            Criteria::Any => true,
            Criteria::NoOne => false,
            Criteria::List(names) => names.contains(&node.name),
            Criteria::Regex(re) => re.is_match(&node.name),
            Criteria::Labels(criteria) => criteria.iter().all(|(key, value, required)| {
                let actual = node.labels.get(key);
                (actual == Some(value)) == *required
            }),
            Criteria::Cluster(cluster) => node.cluster.as_deref() == Some(cluster.as_str()),
            Criteria::Custom(predicate) => predicate(node),
        }
    }
}

#[derive(Default)]
pub struct FilterFactory {
    custom: DashMap<String, FilterConstructor>,
}

impl FilterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, protocol: &str, constructor: FilterConstructor) {
        self.custom.insert(protocol.to_string(), constructor);
    }

    pub fn parse(&self, expr: &str) -> Result<Filter, FilterError> {
        let expr = expr.trim();
        let (proto, arg) = expr
            .split_once(':')
            .ok_or_else(|| FilterError::Malformed(expr.to_string()))?;
        let custom = self.custom.get(proto).map(|c| c.value().clone());
        let criteria = match (proto, custom) {
            (_, Some(constructor)) => Criteria::Custom(constructor(arg)?),
            ("any", None) => Criteria::Any,
            ("noOne", None) => Criteria::NoOne,
            ("list", None) => Criteria::List(
                arg.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            ),
            ("regex", None) => {
                let re = Regex::new(&format!("^(?:{})$", arg)).map_err(|e| {
                    FilterError::InvalidRegex {
                        expr: expr.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Criteria::Regex(re)
            }
            ("label" | "labels", None) => Criteria::Labels(parse_labels(expr, arg)?),
            ("cluster", None) => Criteria::Cluster(arg.to_string()),
            _ => return Err(FilterError::UnknownProtocol(expr.to_string())),
        };
        Ok(Filter {
            expr: expr.to_string(),
            criteria,
        })
    }
}

fn parse_labels(expr: &str, arg: &str) -> Result<Vec<(String, String, bool)>, FilterError> {
    arg.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| FilterError::Malformed(expr.to_string()))?;
            let (value, required) = match value.strip_prefix('!') {
                Some(negated) => (negated, false),
                None => (value, true),
            };
            Ok((key.to_string(), value.to_string(), required))
        })
        .collect()
}
