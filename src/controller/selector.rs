//! Node label matching and Node-event-to-resource mapping.
//!
//! The mapper only needs read access to the set of NodeCIDRAllocation
//! resources, so it borrows the controller's reflector [`Store`] rather
//! than holding its own API client.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;

use crate::crd::NodeCIDRAllocation;

/// Whether every key/value pair in `selector` is present with exactly
/// that value in `labels`. An empty selector matches everything.
pub fn labels_match(
    labels: &BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Render a selector map as a Kubernetes label-selector string
/// (`key=value`, comma separated) for list calls.
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Map a changed Node to the set of NodeCIDRAllocation resources whose
/// selector matches it, for requeueing.
///
/// Set semantics: each matching resource is enqueued at most once per
/// Node event.
pub fn allocations_watching_node(
    store: &Store<NodeCIDRAllocation>,
    node: &Node,
) -> Vec<ObjectRef<NodeCIDRAllocation>> {
    let empty = BTreeMap::new();
    let node_labels = node.metadata.labels.as_ref().unwrap_or(&empty);

    let mut seen = BTreeSet::new();
    let mut requests = Vec::new();
    for alloc in store.state() {
        if labels_match(node_labels, &alloc.spec.node_selector) && seen.insert(alloc.name_any()) {
            requests.push(ObjectRef::from_obj(alloc.as_ref()));
        }
    }

    requests
}
