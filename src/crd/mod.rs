//! Custom Resource Definitions for the CIDR allocator

mod node_cidr_allocation;

pub use node_cidr_allocation::{
    AllocationHealth, NodeCIDRAllocation, NodeCIDRAllocationSpec, NodeCIDRAllocationStatus,
    SpecValidationError,
};
