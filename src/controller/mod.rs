//! Controller module for NodeCIDRAllocation reconciliation
//!
//! Contains the main controller loop, the allocation reconciler, and the
//! finalizer, taint, status and metrics machinery around it.

mod finalizers;
pub mod metrics;
mod reconciler;
mod selector;
mod status;
mod taint;

pub use finalizers::FINALIZER;
pub use reconciler::{run_controller, Context, CONTROLLER_NAME};
pub use selector::{allocations_watching_node, labels_match};
pub use taint::NETWORK_UNAVAILABLE_TAINT;
