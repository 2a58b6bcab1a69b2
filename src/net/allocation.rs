//! Cluster-wide PodCIDR bookkeeping for a single reconcile pass.
//!
//! [`AllocationIndex`] answers "is this subnet already spoken for
//! anywhere in the cluster?" using true CIDR containment. It is rebuilt
//! from the informer's Node snapshot on every reconcile; the underlying
//! list is already cached, and rebuilding keeps the index consistent with
//! whatever snapshot the reconciler is looking at.
//!
//! [`FreeSubnets`] is the per-reconcile, per-mask cache of candidate
//! subnets, consumed head-first as allocations are made.

use std::collections::{HashMap, VecDeque};

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Node;

use super::cidr::{nets_overlap, parse_cidr, subnets_from_pool};
use crate::error::Result;

/// The set of non-empty PodCIDRs currently live in the cluster.
#[derive(Debug, Default)]
pub struct AllocationIndex {
    allocated: Vec<Ipv4Net>,
}

impl AllocationIndex {
    /// Build the index from every Node in the cluster, managed or not.
    ///
    /// Nodes without a PodCIDR are ignored. A Node carrying a malformed
    /// PodCIDR fails the whole build with `InvalidCidr`; allocating around
    /// an unparseable reservation would risk handing out colliding space.
    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Result<Self> {
        let mut allocated = Vec::new();
        for node in nodes {
            let Some(pod_cidr) = node.spec.as_ref().and_then(|s| s.pod_cidr.as_deref()) else {
                continue;
            };
            if pod_cidr.is_empty() {
                continue;
            }
            allocated.push(parse_cidr(pod_cidr)?);
        }

        Ok(Self { allocated })
    }

    /// Whether `candidate` overlaps any tracked PodCIDR.
    ///
    /// This is a containment test, not a string comparison: a live
    /// `10.0.0.0/24` blocks `10.0.0.64/26` and vice versa.
    pub fn is_allocated(&self, candidate: &Ipv4Net) -> bool {
        self.allocated.iter().any(|n| nets_overlap(n, candidate))
    }

    /// Record a subnet handed out during the current reconcile so later
    /// candidates (of any size) are checked against it.
    pub fn insert(&mut self, subnet: Ipv4Net) {
        self.allocated.push(subnet);
    }

    pub fn len(&self) -> usize {
        self.allocated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }
}

/// Candidate subnets per mask size, built lazily from the address pools
/// and drained as Nodes are assigned.
#[derive(Debug, Default)]
pub struct FreeSubnets {
    by_mask: HashMap<u8, VecDeque<Ipv4Net>>,
}

impl FreeSubnets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the first free `/mask` subnet, enumerating the pools in
    /// declaration order on first use for this mask.
    ///
    /// Returns `Ok(None)` once the address space for this size is
    /// exhausted. Entries that became allocated after the list was built
    /// (by a differently-sized assignment earlier in the reconcile) are
    /// skipped.
    pub fn take(
        &mut self,
        mask: u8,
        pools: &[String],
        index: &AllocationIndex,
    ) -> Result<Option<Ipv4Net>> {
        if !self.by_mask.contains_key(&mask) {
            let mut list = VecDeque::new();
            for pool in pools {
                for subnet in subnets_from_pool(pool, mask)? {
                    if !index.is_allocated(&subnet) && !list.contains(&subnet) {
                        list.push_back(subnet);
                    }
                }
            }
            self.by_mask.insert(mask, list);
        }

        let Some(list) = self.by_mask.get_mut(&mask) else {
            return Ok(None);
        };

        while let Some(subnet) = list.pop_front() {
            if !index.is_allocated(&subnet) {
                return Ok(Some(subnet));
            }
        }

        Ok(None)
    }
}
