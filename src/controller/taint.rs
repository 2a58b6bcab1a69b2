//! `network-unavailable` taint handling for managed Nodes
//!
//! A Node whose PodCIDR has not been assigned yet cannot run pods with
//! working networking, so it carries a `NoSchedule` taint until the
//! allocator has done its job. The taint is dropped in the same write
//! that assigns the PodCIDR.

use k8s_openapi::api::core::v1::{Node, Taint};

/// Taint key marking Nodes that are still waiting for a PodCIDR
pub const NETWORK_UNAVAILABLE_TAINT: &str = "node.networking.nodecidr.dev/network-unavailable";

pub fn has_taint(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .is_some_and(|taints| taints.iter().any(|t| t.key == NETWORK_UNAVAILABLE_TAINT))
}

fn add_taint(node: &mut Node) {
    let spec = node.spec.get_or_insert_with(Default::default);
    spec.taints.get_or_insert_with(Vec::new).push(Taint {
        key: NETWORK_UNAVAILABLE_TAINT.to_string(),
        value: Some("true".to_string()),
        effect: "NoSchedule".to_string(),
        time_added: None,
    });
}

fn remove_taint(node: &mut Node) {
    if let Some(taints) = node.spec.as_mut().and_then(|s| s.taints.as_mut()) {
        taints.retain(|t| t.key != NETWORK_UNAVAILABLE_TAINT);
    }
}

/// Enforce the invariant "taint present iff PodCIDR empty" on the Node
/// in place. Returns whether the Node was modified.
pub fn sync(node: &mut Node) -> bool {
    let allocated = node
        .spec
        .as_ref()
        .and_then(|s| s.pod_cidr.as_deref())
        .is_some_and(|cidr| !cidr.is_empty());

    match (allocated, has_taint(node)) {
        (true, true) => {
            remove_taint(node);
            true
        }
        (false, false) => {
            add_taint(node);
            true
        }
        _ => false,
    }
}
