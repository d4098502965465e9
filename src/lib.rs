//! fleetplane - a control plane for container runtime node groups
//!
//! Node groups are named views over container runtime endpoints. A group is
//! either a managed cluster, a swarm-mode cluster, or a virtual group whose
//! membership is computed by a filter over all known nodes. Every group
//! exposes the same operation surface regardless of the topology behind it.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod docker;
pub mod events;
pub mod filter;
pub mod security;
pub mod store;
