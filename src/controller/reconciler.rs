//! Reconciler for NodeCIDRAllocation resources
//!
//! Implements the controller pattern using kube-rs runtime. A reconcile
//! converges one NodeCIDRAllocation: every Node matched by its selector
//! ends up with a PodCIDR carved from the declared address pools, sized
//! from the Node's advertised pod capacity and overlapping nothing else
//! in the cluster.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, ListParams, PostParams},
    client::Client,
    error::ErrorResponse,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        watcher,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::NodeCIDRAllocation;
use crate::error::{Error, Result};
use crate::net::cidr::smallest_mask_for_hosts;
use crate::net::{AllocationIndex, FreeSubnets};

use super::finalizers::{self, FinalizerState};
use super::selector::{allocations_watching_node, selector_string};
use super::status::finalize_reconcile;
use super::taint;

/// Field manager / event reporter identity for all writes
pub const CONTROLLER_NAME: &str = "cidr-allocator";

// Event reasons surfaced on NodeCIDRAllocation resources
pub const REASON_ALLOCATED: &str = "Allocated";
pub const REASON_NO_ADDRESS_SPACE: &str = "AddressSpaceExhausted";
pub const REASON_ORPHANED_NODES: &str = "OrphanedNodes";
pub const REASON_DELETED: &str = "Deleted";

/// Shared state for the controller
pub struct Context {
    pub client: Client,
    recorder: Recorder,
}

impl Context {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: None,
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, recorder }
    }
}

/// Main entry point: runs the NodeCIDRAllocation controller until
/// shutdown.
///
/// Node changes are mapped back to the allocation resources watching
/// them through the controller's own reflector store, so the mapper
/// needs no API client of its own.
pub async fn run_controller(ctx: Arc<Context>) -> Result<()> {
    let client = ctx.client.clone();
    let allocations: Api<NodeCIDRAllocation> = Api::all(client.clone());

    // Fail fast when the CRD is not installed
    if let Err(e) = allocations.list(&ListParams::default().limit(1)).await {
        error!(error = %e, "NodeCIDRAllocation CRD not available, install the CRD first");
        return Err(Error::config("NodeCIDRAllocation CRD not installed"));
    }

    info!("starting NodeCIDRAllocation controller");

    let controller = Controller::new(allocations, watcher::Config::default());
    let store = controller.store();

    controller
        .watches(
            Api::<Node>::all(client.clone()),
            watcher::Config::default(),
            move |node| allocations_watching_node(&store, &node),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(?obj, "reconciled"),
                Err(e) => error!(error = ?e, "reconcile error"),
            }
        })
        .await;

    info!("NodeCIDRAllocation controller shut down");
    Ok(())
}

/// One convergence step for a single NodeCIDRAllocation.
///
/// Called whenever the resource changes or any Node matched by one of
/// the known selectors changes.
#[instrument(skip(alloc, ctx), fields(name = %alloc.name_any()))]
async fn reconcile(alloc: Arc<NodeCIDRAllocation>, ctx: Arc<Context>) -> Result<Action> {
    let client = ctx.client.clone();
    let allocations: Api<NodeCIDRAllocation> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());

    // Nodes currently matched by this resource's selector
    let selector = selector_string(&alloc.spec.node_selector);
    let matching = nodes
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;

    // The finalizer state machine gates everything else
    match finalizers::state(&alloc) {
        FinalizerState::Fresh => {
            if !finalizers::attach(&allocations, &alloc).await? {
                // Resource disappeared between the watch event and now
                return Ok(Action::await_change());
            }
        }
        FinalizerState::Active => {}
        FinalizerState::Draining => {
            if finalizers::any_pod_cidr_allocated(&matching) {
                info!(
                    selector = %selector,
                    "deletion blocked: matched Nodes still hold PodCIDR allocations"
                );
                publish_event(
                    &ctx,
                    &alloc,
                    EventType::Warning,
                    REASON_ORPHANED_NODES,
                    format!(
                        "Deletion of NodeCIDRAllocation ({}) would leave Nodes orphaned",
                        alloc.name_any()
                    ),
                )
                .await;
                return Ok(Action::await_change());
            }

            if finalizers::detach(&allocations, &alloc).await? {
                info!("NodeCIDRAllocation was removed");
                publish_event(
                    &ctx,
                    &alloc,
                    EventType::Normal,
                    REASON_DELETED,
                    format!("NodeCIDRAllocation resource was deleted: {}", alloc.name_any()),
                )
                .await;
            }
            return Ok(Action::await_change());
        }
        FinalizerState::Gone => return Ok(Action::await_change()),
    }

    if matching.is_empty() {
        debug!("no matching Nodes exist, skipping");
        finalize_reconcile(&ctx, &alloc, &matching, None).await;
        return Ok(Action::await_change());
    }

    // Every Node in the cluster, managed or not: a candidate subnet must
    // not collide with anything, regardless of who assigned it.
    let all_nodes = nodes.list(&ListParams::default()).await?.items;
    let mut index = match AllocationIndex::from_nodes(&all_nodes) {
        Ok(index) => index,
        Err(e) => {
            error!(error = %e, "unable to index existing PodCIDR allocations");
            finalize_reconcile(&ctx, &alloc, &matching, Some(&e)).await;
            return Err(e);
        }
    };

    info!(
        matching = matching.len(),
        allocated = index.len(),
        "reconciling matching Nodes with NodeCIDRAllocation"
    );

    let mut free = FreeSubnets::new();
    let mut assigned: u32 = 0;

    for node in &matching {
        let node_name = node.name_any();

        if has_pod_cidr(node) {
            debug!(node = %node_name, "node already contains a CIDR allocation, skipping");
            // Drop a stale network-unavailable taint if one survived a
            // previous partial write.
            let mut updated = node.clone();
            if taint::sync(&mut updated) {
                if let Err(e) = write_node(&nodes, &node_name, &updated).await {
                    finalize_reconcile(&ctx, &alloc, &matching, Some(&e)).await;
                    return Err(e);
                }
            }
            continue;
        }

        let Some(max_pods) = allocatable_pods(node) else {
            warn!(
                node = %node_name,
                "node does not advertise an allocatable pod count, not allocating"
            );
            // Keep the node unschedulable until it can be sized.
            let mut updated = node.clone();
            if taint::sync(&mut updated) {
                if let Err(e) = write_node(&nodes, &node_name, &updated).await {
                    finalize_reconcile(&ctx, &alloc, &matching, Some(&e)).await;
                    return Err(e);
                }
            }
            continue;
        };

        let mask = smallest_mask_for_hosts(max_pods);
        debug!(
            node = %node_name,
            max_pods,
            required_mask = mask,
            "determined Node PodCIDR requirements"
        );
        // The free list for this mask is consumed before the next Node is
        // considered; two same-sized Nodes can never receive one subnet.

        let subnet = match next_pod_cidr(&mut free, &index, &alloc.spec.address_pools, max_pods) {
            Ok(Some(subnet)) => subnet,
            Ok(None) => {
                // Not transient: requeueing would spin. A Node or pool
                // change will re-trigger this resource.
                info!(
                    node = %node_name,
                    required_mask = mask,
                    "no available address space, you may want to add additional pools"
                );
                publish_event(
                    &ctx,
                    &alloc,
                    EventType::Warning,
                    REASON_NO_ADDRESS_SPACE,
                    format!(
                        "There are no available subnets for the requested size (/{mask}). \
                         Could not assign PodCIDR to Node ({node_name})"
                    ),
                )
                .await;
                finalize_reconcile(&ctx, &alloc, &matching, None).await;
                return Ok(Action::await_change());
            }
            Err(e) => {
                error!(error = %e, "unable to break down address pool into subnets");
                finalize_reconcile(&ctx, &alloc, &matching, Some(&e)).await;
                return Err(e);
            }
        };

        let mut updated = node.clone();
        updated
            .spec
            .get_or_insert_with(Default::default)
            .pod_cidr = Some(subnet.to_string());
        taint::sync(&mut updated);

        match write_node(&nodes, &node_name, &updated).await {
            Ok(NodeWrite::Updated) => {
                index.insert(subnet);
                assigned += 1;
                info!(
                    node = %node_name,
                    pod_cidr = %subnet,
                    "assigned PodCIDR to Node"
                );
            }
            Ok(NodeWrite::Vanished) => {
                // The Node was deleted after the reconcile request; the
                // subnet stays free for the next taker.
                debug!(node = %node_name, "node vanished mid-reconcile, continuing");
            }
            Err(e) => {
                error!(node = %node_name, error = %e, "unable to set PodCIDR on Node");
                finalize_reconcile(&ctx, &alloc, &matching, Some(&e)).await;
                return Err(e);
            }
        }
    }

    publish_event(
        &ctx,
        &alloc,
        EventType::Normal,
        REASON_ALLOCATED,
        format!(
            "PodCIDR allocation applied to matching Nodes (selector: {selector}, \
             matching: {}, newly assigned: {assigned})",
            matching.len()
        ),
    )
    .await;

    finalize_reconcile(&ctx, &alloc, &matching, None).await;
    Ok(Action::await_change())
}

enum NodeWrite {
    Updated,
    Vanished,
}

/// Replace a Node, distinguishing "gone" from real failures. The replace
/// carries the Node's resourceVersion, so a stale view fails with a
/// conflict and requeues.
async fn write_node(api: &Api<Node>, name: &str, node: &Node) -> Result<NodeWrite> {
    match api.replace(name, &PostParams::default(), node).await {
        Ok(_) => Ok(NodeWrite::Updated),
        Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(NodeWrite::Vanished),
        Err(e) => Err(e.into()),
    }
}

/// Pick the next free subnet sized for `max_pods`, consulting pools in
/// declaration order and skipping anything the index says is taken.
pub(super) fn next_pod_cidr(
    free: &mut FreeSubnets,
    index: &AllocationIndex,
    pools: &[String],
    max_pods: u32,
) -> Result<Option<ipnet::Ipv4Net>> {
    free.take(smallest_mask_for_hosts(max_pods), pools, index)
}

pub(super) fn has_pod_cidr(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.pod_cidr.as_deref())
        .is_some_and(|cidr| !cidr.is_empty())
}

/// The maximum pod count the kubelet will admit, from
/// `status.allocatable.pods`. `None` when the Node does not declare one,
/// in which case no subnet is allocated for it.
pub(super) fn allocatable_pods(node: &Node) -> Option<u32> {
    node.status
        .as_ref()?
        .allocatable
        .as_ref()?
        .get("pods")?
        .0
        .parse()
        .ok()
}

/// Emit a Kubernetes Event on the allocation resource. Fire-and-forget:
/// a failed event never breaks reconciliation.
async fn publish_event(
    ctx: &Context,
    alloc: &NodeCIDRAllocation,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note),
        action: "Reconcile".to_string(),
        secondary: None,
    };

    if let Err(e) = ctx.recorder.publish(&event, &alloc.object_ref(&())).await {
        warn!(reason, error = %e, "failed to publish Kubernetes event");
    }
}

/// Error policy determines how reconciliation errors are retried
fn error_policy(alloc: Arc<NodeCIDRAllocation>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        name = %alloc.name_any(),
        kind = error.kind(),
        error = %error,
        "reconciliation error"
    );

    // Shorter retry for errors with a chance of clearing on their own
    let retry = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry)
}
