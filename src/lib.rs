//! cidr-allocator: a Kubernetes operator that assigns non-overlapping
//! Pod CIDR subnets to Nodes.
//!
//! A `NodeCIDRAllocation` resource declares IPv4 address pools and a
//! node label selector; the controller sizes a subnet for each matched
//! Node from its advertised pod capacity, carves it out of the pools,
//! and records it on `spec.podCIDR` without ever colliding with an
//! existing allocation anywhere in the cluster.

pub mod controller;
pub mod crd;
pub mod error;
pub mod leader;
pub mod net;
pub mod observability;
pub mod telemetry;
pub mod webhook;

pub use crate::error::{Error, Result};
