//! Prometheus metrics for the CIDR allocator
//!
//! # Exported metrics
//! The `/metrics` endpoint exports the following cluster-wide gauges:
//! - `cidr_allocator_expected_allocations`: total number of Nodes in the
//!   cluster (each should eventually hold a PodCIDR).
//! - `cidr_allocator_actual_allocations`: Nodes with a non-empty PodCIDR.
//! - `cidr_allocator_available_hosts`: host addresses still unassigned
//!   across the union of all declared address pools.
//! - `cidr_allocator_available_hosts_percent`: the same, as a percentage
//!   of the total declared address space.
//!
//! The gauges are aggregates over ALL NodeCIDRAllocation resources and
//! ALL Nodes; whichever worker finalizes a reconcile last wins the write.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU64};

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;
use once_cell::sync::Lazy;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::warn;

use crate::crd::NodeCIDRAllocation;
use crate::net::cidr::{hosts_for_mask, parse_cidr};

/// Gauge tracking the number of expected Node PodCIDR allocations
pub static EXPECTED_ALLOCATIONS: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Gauge tracking the number of completed Node PodCIDR allocations
pub static ACTUAL_ALLOCATIONS: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Gauge tracking remaining host addresses across all configured pools
pub static AVAILABLE_HOSTS: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Gauge tracking the remaining host address ratio as a percentage
pub static AVAILABLE_HOSTS_PERCENT: Lazy<Gauge<f64, AtomicU64>> = Lazy::new(Gauge::default);

/// Global metrics registry served on the metrics endpoint
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "cidr_allocator_expected_allocations",
        "Total number of Node PodCIDR allocations expected cluster-wide (the Node count)",
        EXPECTED_ALLOCATIONS.clone(),
    );
    registry.register(
        "cidr_allocator_actual_allocations",
        "Number of Nodes currently holding a non-empty PodCIDR",
        ACTUAL_ALLOCATIONS.clone(),
    );
    registry.register(
        "cidr_allocator_available_hosts",
        "Host addresses remaining across all configured address pools",
        AVAILABLE_HOSTS.clone(),
    );
    registry.register(
        "cidr_allocator_available_hosts_percent",
        "Percentage of configured host address space still available",
        AVAILABLE_HOSTS_PERCENT.clone(),
    );

    registry
});

/// Cluster-wide aggregates backing the gauges
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClusterUsage {
    pub expected: i64,
    pub actual: i64,
    pub available_hosts: i64,
    pub available_percent: f64,
}

/// Compute the aggregates from all allocation resources and all Nodes.
///
/// Pools and assigned PodCIDRs are each deduplicated by exact CIDR
/// string before summing; malformed entries are silently skipped.
pub fn aggregate(allocations: &[NodeCIDRAllocation], nodes: &[Node]) -> ClusterUsage {
    let pools: BTreeSet<&str> = allocations
        .iter()
        .flat_map(|a| a.spec.address_pools.iter())
        .map(String::as_str)
        .collect();
    let total = accumulated_hosts(pools);

    let assigned: BTreeSet<&str> = nodes
        .iter()
        .filter_map(|n| n.spec.as_ref().and_then(|s| s.pod_cidr.as_deref()))
        .filter(|cidr| !cidr.is_empty())
        .collect();
    let allocated = accumulated_hosts(assigned.iter().copied());

    let actual = nodes
        .iter()
        .filter(|n| {
            n.spec
                .as_ref()
                .and_then(|s| s.pod_cidr.as_deref())
                .is_some_and(|cidr| !cidr.is_empty())
        })
        .count() as i64;

    let available_percent = if total > 0 {
        (1.0 - allocated as f64 / total as f64) * 100.0
    } else {
        0.0
    };

    ClusterUsage {
        expected: nodes.len() as i64,
        actual,
        available_hosts: total.saturating_sub(allocated) as i64,
        available_percent,
    }
}

/// Set all gauges from freshly computed aggregates.
pub fn update(allocations: &[NodeCIDRAllocation], nodes: &[Node]) {
    let usage = aggregate(allocations, nodes);

    EXPECTED_ALLOCATIONS.set(usage.expected);
    ACTUAL_ALLOCATIONS.set(usage.actual);
    AVAILABLE_HOSTS.set(usage.available_hosts);
    AVAILABLE_HOSTS_PERCENT.set(usage.available_percent);
}

/// List all allocation resources and Nodes and refresh the gauges.
/// Failures are logged and swallowed; metrics lag one reconcile at worst.
pub async fn refresh(client: &Client) {
    let allocations = match Api::<NodeCIDRAllocation>::all(client.clone())
        .list(&ListParams::default())
        .await
    {
        Ok(list) => list.items,
        Err(e) => {
            warn!(error = %e, "unable to list NodeCIDRAllocations, metrics not updated");
            return;
        }
    };

    let nodes = match Api::<Node>::all(client.clone())
        .list(&ListParams::default())
        .await
    {
        Ok(list) => list.items,
        Err(e) => {
            warn!(error = %e, "unable to list Nodes, metrics not updated");
            return;
        }
    };

    update(&allocations, &nodes);
}

/// Sum `hosts_for_mask` over the given CIDR strings, silently skipping
/// anything that does not parse.
fn accumulated_hosts<'a>(cidrs: impl IntoIterator<Item = &'a str>) -> u64 {
    cidrs
        .into_iter()
        .filter_map(|cidr| parse_cidr(cidr).ok())
        .filter_map(|net| hosts_for_mask(net.prefix_len()).ok())
        .map(u64::from)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NodeCIDRAllocationSpec;
    use k8s_openapi::api::core::v1::NodeSpec;
    use kube::api::ObjectMeta;

    fn allocation(pools: &[&str]) -> NodeCIDRAllocation {
        NodeCIDRAllocation {
            metadata: ObjectMeta {
                name: Some("workers".to_string()),
                ..Default::default()
            },
            spec: NodeCIDRAllocationSpec {
                address_pools: pools.iter().map(|p| p.to_string()).collect(),
                node_selector: Default::default(),
            },
            status: None,
        }
    }

    fn node(pod_cidr: Option<&str>) -> Node {
        Node {
            spec: Some(NodeSpec {
                pod_cidr: pod_cidr.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn fully_allocated_pool_has_nothing_available() {
        let allocations = vec![allocation(&["10.0.0.0/24"])];
        let nodes = vec![
            node(Some("10.0.0.0/26")),
            node(Some("10.0.0.64/26")),
            node(Some("10.0.0.128/26")),
            node(Some("10.0.0.192/26")),
        ];

        let usage = aggregate(&allocations, &nodes);
        assert_eq!(usage.expected, 4);
        assert_eq!(usage.actual, 4);
        assert_eq!(usage.available_hosts, 0);
        assert_eq!(usage.available_percent, 0.0);
    }

    #[test]
    fn unassigning_a_node_frees_its_subnet() {
        let allocations = vec![allocation(&["10.0.0.0/24"])];
        let nodes = vec![
            node(Some("10.0.0.0/26")),
            node(Some("10.0.0.64/26")),
            node(Some("10.0.0.128/26")),
            node(None),
        ];

        let usage = aggregate(&allocations, &nodes);
        assert_eq!(usage.actual, 3);
        assert_eq!(usage.available_hosts, 64);
        assert_eq!(usage.available_percent, 25.0);
    }

    #[test]
    fn duplicate_pools_and_cidrs_count_once() {
        // Two resources declaring the same pool; two nodes somehow
        // sharing a CIDR string.
        let allocations = vec![allocation(&["10.0.0.0/24"]), allocation(&["10.0.0.0/24"])];
        let nodes = vec![node(Some("10.0.0.0/26")), node(Some("10.0.0.0/26"))];

        let usage = aggregate(&allocations, &nodes);
        assert_eq!(usage.expected, 2);
        assert_eq!(usage.actual, 2);
        assert_eq!(usage.available_hosts, 256 - 64);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let allocations = vec![allocation(&["10.0.0.0/24", "not-a-cidr"])];
        let nodes = vec![node(Some("garbage")), node(Some("10.0.0.0/25"))];

        let usage = aggregate(&allocations, &nodes);
        assert_eq!(usage.available_hosts, 128);
        assert_eq!(usage.available_percent, 50.0);
    }

    #[test]
    fn no_pools_means_zero_percent_not_a_division_error() {
        let usage = aggregate(&[], &[node(Some("10.0.0.0/26"))]);
        assert_eq!(usage.available_hosts, 0);
        assert_eq!(usage.available_percent, 0.0);
    }

    #[test]
    fn update_sets_the_gauges() {
        let allocations = vec![allocation(&["10.0.0.0/24"])];
        let nodes = vec![node(Some("10.0.0.0/25")), node(None)];
        update(&allocations, &nodes);

        assert_eq!(EXPECTED_ALLOCATIONS.get(), 2);
        assert_eq!(ACTUAL_ALLOCATIONS.get(), 1);
        assert_eq!(AVAILABLE_HOSTS.get(), 128);
        assert_eq!(AVAILABLE_HOSTS_PERCENT.get(), 50.0);
    }
}
