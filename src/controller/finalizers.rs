//! Finalizer lifecycle for NodeCIDRAllocation resources
//!
//! The finalizer blocks deletion of an allocation resource while any
//! matched Node still holds a PodCIDR carved from its pools. Deleting the
//! resource earlier would orphan live allocations: the record of which
//! pools they came from would be gone. The drain gate does not unassign
//! Nodes; it waits for them to be deleted externally.

use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, Patch, PatchParams},
    error::ErrorResponse,
    ResourceExt,
};
use serde_json::json;
use tracing::debug;

use crate::crd::NodeCIDRAllocation;
use crate::error::Result;

/// Finalizer token attached to every reconciled NodeCIDRAllocation
pub const FINALIZER: &str = "nodecidrallocation.networking.nodecidr.dev/finalizer";

/// Lifecycle position derived from `(finalizer present, deletion requested)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizerState {
    /// Never reconciled: no finalizer, no deletion timestamp
    Fresh,
    /// Finalizer attached, resource alive
    Active,
    /// Deletion requested while the finalizer is still attached
    Draining,
    /// Deletion requested and finalizer already gone; the API server
    /// reaps the object
    Gone,
}

pub fn state(alloc: &NodeCIDRAllocation) -> FinalizerState {
    let deleting = alloc.metadata.deletion_timestamp.is_some();
    let has_finalizer = alloc.finalizers().iter().any(|f| f == FINALIZER);

    match (has_finalizer, deleting) {
        (false, false) => FinalizerState::Fresh,
        (true, false) => FinalizerState::Active,
        (true, true) => FinalizerState::Draining,
        (false, true) => FinalizerState::Gone,
    }
}

/// Whether any of the given Nodes holds a non-empty PodCIDR.
///
/// This is the drain gate: the finalizer stays on while it returns true.
pub fn any_pod_cidr_allocated(nodes: &[Node]) -> bool {
    nodes.iter().any(|node| {
        node.spec
            .as_ref()
            .and_then(|s| s.pod_cidr.as_deref())
            .is_some_and(|cidr| !cidr.is_empty())
    })
}

/// Attach the finalizer. Returns `false` when the resource no longer
/// exists, which ends the reconcile cleanly; other write errors bubble up
/// for requeue.
pub async fn attach(api: &Api<NodeCIDRAllocation>, alloc: &NodeCIDRAllocation) -> Result<bool> {
    let mut finalizers: Vec<String> = alloc.finalizers().to_vec();
    if finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(true);
    }
    finalizers.push(FINALIZER.to_string());

    patch_finalizers(api, &alloc.name_any(), finalizers).await
}

/// Detach the finalizer, letting the API server complete the deletion.
/// Returns `false` when the resource is already gone (a previous
/// reconcile likely finished the removal).
pub async fn detach(api: &Api<NodeCIDRAllocation>, alloc: &NodeCIDRAllocation) -> Result<bool> {
    let finalizers: Vec<String> = alloc
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();

    patch_finalizers(api, &alloc.name_any(), finalizers).await
}

async fn patch_finalizers(
    api: &Api<NodeCIDRAllocation>,
    name: &str,
    finalizers: Vec<String>,
) -> Result<bool> {
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
        }
    });

    match api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
            debug!(name, "resource disappeared while updating finalizers");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
