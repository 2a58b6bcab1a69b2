//! IPv4 network math and allocation tracking.
//!
//! `cidr` holds the pure subnet arithmetic; `allocation` tracks which
//! subnets are already spoken for cluster-wide.

pub mod allocation;
pub mod cidr;

pub use allocation::{AllocationIndex, FreeSubnets};
pub use cidr::{
    hosts_for_mask, networks_overlap, parse_cidr, smallest_mask_for_hosts, subnets_from_pool,
    usable_hosts_for_mask,
};
