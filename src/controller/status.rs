//! Status reporting for NodeCIDRAllocation resources
//!
//! Status is advisory: it is recalculated from the matching Nodes after
//! every reconcile and written through the status subresource. A failed
//! status write is logged and swallowed, never requeued.

use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, Patch, PatchParams},
    ResourceExt,
};
use tracing::warn;

use crate::crd::{AllocationHealth, NodeCIDRAllocation, NodeCIDRAllocationStatus};
use crate::error::Error;

use super::metrics;
use super::reconciler::Context;

/// Number of Nodes in `nodes` holding a non-empty PodCIDR
pub fn count_completed(nodes: &[Node]) -> i32 {
    nodes
        .iter()
        .filter(|node| {
            node.spec
                .as_ref()
                .and_then(|s| s.pod_cidr.as_deref())
                .is_some_and(|cidr| !cidr.is_empty())
        })
        .count() as i32
}

/// Derive the status block from the matching Nodes and the reconcile
/// outcome.
pub fn derive_status(nodes: &[Node], errored: bool) -> NodeCIDRAllocationStatus {
    let expected = nodes.len() as i32;
    let completed = count_completed(nodes);

    let health = if errored {
        AllocationHealth::Unhealthy
    } else if completed < expected {
        AllocationHealth::Progressing
    } else {
        AllocationHealth::Healthy
    };

    NodeCIDRAllocationStatus {
        health,
        expected,
        completed,
    }
}

/// Write status and refresh the cluster-wide gauges. Runs at the end of
/// every reconcile that got past the finalizer state machine, whatever
/// the outcome.
pub async fn finalize_reconcile(
    ctx: &Context,
    alloc: &NodeCIDRAllocation,
    matching: &[Node],
    err: Option<&Error>,
) {
    update_status(ctx, alloc, matching, err).await;
    metrics::refresh(&ctx.client).await;
}

async fn update_status(
    ctx: &Context,
    alloc: &NodeCIDRAllocation,
    matching: &[Node],
    err: Option<&Error>,
) {
    let api: Api<NodeCIDRAllocation> = Api::all(ctx.client.clone());
    let status = derive_status(matching, err.is_some());

    let patch = serde_json::json!({ "status": status });
    if let Err(e) = api
        .patch_status(
            &alloc.name_any(),
            &PatchParams::apply(super::reconciler::CONTROLLER_NAME),
            &Patch::Merge(&patch),
        )
        .await
    {
        warn!(
            name = %alloc.name_any(),
            error = %e,
            "unable to update NodeCIDRAllocation status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeSpec;

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
    fn fully_allocated_set_is_healthy() {
        let nodes = vec![node(Some("10.0.0.0/27")), node(Some("10.0.0.32/27"))];
        let status = derive_status(&nodes, false);
        assert_eq!(status.expected, 2);
        assert_eq!(status.completed, 2);
        assert_eq!(status.health, AllocationHealth::Healthy);
    }

    #[test]
    fn partial_allocation_is_progressing() {
        let nodes = vec![node(Some("10.0.0.0/27")), node(None), node(Some(""))];
        let status = derive_status(&nodes, false);
        assert_eq!(status.expected, 3);
        assert_eq!(status.completed, 1);
        assert_eq!(status.health, AllocationHealth::Progressing);
    }

    #[test]
    fn errors_override_health() {
        let nodes = vec![node(Some("10.0.0.0/27"))];
        let status = derive_status(&nodes, true);
        assert_eq!(status.health, AllocationHealth::Unhealthy);
        // counters still reflect the observed state
        assert_eq!(status.completed, 1);
    }

    #[test]
    fn empty_selection_is_healthy_with_zero_counts() {
        let status = derive_status(&[], false);
        assert_eq!(status.expected, 0);
        assert_eq!(status.completed, 0);
        assert_eq!(status.health, AllocationHealth::Healthy);
    }
}
