//! NodeCIDRAllocation Custom Resource Definition
//!
//! A NodeCIDRAllocation declares a set of IPv4 address pools and a node
//! label selector. The controller carves per-Node PodCIDRs out of the
//! pools, sized from each Node's advertised pod capacity, for every Node
//! the selector matches.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::net::cidr::{networks_overlap, parse_cidr};

/// Structured validation error for `NodeCIDRAllocationSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "networking.nodecidr.dev",
    version = "v1alpha1",
    kind = "NodeCIDRAllocation",
    status = "NodeCIDRAllocationStatus",
    shortname = "nca",
    printcolumn = r#"{"name":"Pools","type":"string","jsonPath":".spec.addressPools"}"#,
    printcolumn = r#"{"name":"Health","type":"string","jsonPath":".status.health"}"#,
    printcolumn = r#"{"name":"Expected","type":"integer","jsonPath":".status.expected"}"#,
    printcolumn = r#"{"name":"Completed","type":"integer","jsonPath":".status.completed"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeCIDRAllocationSpec {
    /// Base IPv4 networks from which per-Node PodCIDRs are carved.
    /// Pools must be pairwise non-overlapping; they are consulted in
    /// declaration order.
    #[serde(default)]
    pub address_pools: Vec<String>,

    /// Label selector picking the Nodes to allocate for. Exactly one
    /// key/value entry; a selected Node must advertise a maximum pod
    /// count or no subnet will be allocated for it.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

/// Observed convergence state, recalculated after every reconcile from
/// the matching Node resources.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeCIDRAllocationStatus {
    #[serde(default)]
    pub health: AllocationHealth,

    /// Number of Nodes currently matched by the selector
    #[serde(default)]
    pub expected: i32,

    /// Matched Nodes that hold a non-empty PodCIDR
    #[serde(default)]
    pub completed: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AllocationHealth {
    Healthy,
    #[default]
    Progressing,
    Unhealthy,
}

impl std::fmt::Display for AllocationHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AllocationHealth::Healthy => "Healthy",
            AllocationHealth::Progressing => "Progressing",
            AllocationHealth::Unhealthy => "Unhealthy",
        };
        f.write_str(s)
    }
}

impl NodeCIDRAllocation {
    /// Validate the object name and spec together, as the admission
    /// webhook sees them.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        let name = self.metadata.name.as_deref().unwrap_or_default();
        if name.is_empty() || name.len() > 63 {
            errors.push(SpecValidationError::new(
                "metadata.name",
                "name must be non-empty and at most 63 characters",
            ));
        }

        if let Err(spec_errors) = self.spec.validate() {
            errors.extend(spec_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl NodeCIDRAllocationSpec {
    /// Validate the spec the way the admission webhook does:
    /// exactly one non-blank selector entry, and a non-empty set of
    /// well-formed, pairwise-disjoint IPv4 pools.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        self.validate_node_selector(&mut errors);
        self.validate_address_pools(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_node_selector(&self, errors: &mut Vec<SpecValidationError>) {
        if self.node_selector.len() != 1 {
            errors.push(SpecValidationError::new(
                "spec.nodeSelector",
                "exactly one nodeSelector entry must be specified",
            ));
            return;
        }

        let Some((key, value)) = self.node_selector.iter().next() else {
            return;
        };
        if key.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.nodeSelector",
                "nodeSelector key must be non-empty",
            ));
        }
        if value.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.nodeSelector",
                "nodeSelector value must be non-empty",
            ));
        }
    }

    fn validate_address_pools(&self, errors: &mut Vec<SpecValidationError>) {
        if self.address_pools.is_empty() {
            errors.push(SpecValidationError::new(
                "spec.addressPools",
                "addressPools must contain at least one entry",
            ));
            return;
        }

        for (i, pool) in self.address_pools.iter().enumerate() {
            if parse_cidr(pool).is_err() {
                errors.push(SpecValidationError::new(
                    format!("spec.addressPools[{i}]"),
                    format!("{pool:?} is not a valid IPv4 CIDR"),
                ));
                continue;
            }

            for other in self.address_pools.iter().skip(i + 1) {
                match networks_overlap(pool, other) {
                    Ok(true) => errors.push(SpecValidationError::new(
                        format!("spec.addressPools[{i}]"),
                        format!("pool {pool} overlaps pool {other}"),
                    )),
                    // The other pool's parse failure gets its own entry.
                    Ok(false) | Err(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn allocation(name: &str, pools: &[&str], selector: &[(&str, &str)]) -> NodeCIDRAllocation {
        NodeCIDRAllocation {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: NodeCIDRAllocationSpec {
                address_pools: pools.iter().map(|p| p.to_string()).collect(),
                node_selector: selector
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            status: None,
        }
    }

    #[test]
    fn valid_spec_passes() {
        let alloc = allocation(
            "workers",
            &["10.0.0.0/16", "10.1.0.0/16"],
            &[("node-role/worker", "true")],
        );
        assert!(alloc.validate().is_ok());
    }

    #[test]
    fn overlapping_pools_are_rejected() {
        let alloc = allocation(
            "workers",
            &["10.0.0.0/24", "10.0.0.128/25"],
            &[("role", "worker")],
        );
        let errors = alloc.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].field.contains("addressPools"));
        assert!(errors[0].message.contains("overlaps"));
    }

    #[test]
    fn malformed_pool_is_rejected() {
        let alloc = allocation("workers", &["10.0.0.0/16", "banana"], &[("role", "worker")]);
        let errors = alloc.validate().unwrap_err();
        assert_eq!(errors[0].field, "spec.addressPools[1]");
    }

    #[test]
    fn empty_pools_are_rejected() {
        let alloc = allocation("workers", &[], &[("role", "worker")]);
        let errors = alloc.validate().unwrap_err();
        assert!(errors[0].message.contains("at least one"));
    }

    #[test]
    fn selector_must_have_exactly_one_entry() {
        let none = allocation("workers", &["10.0.0.0/16"], &[]);
        assert!(none.validate().is_err());

        let two = allocation("workers", &["10.0.0.0/16"], &[("a", "1"), ("b", "2")]);
        let errors = two.validate().unwrap_err();
        assert!(errors[0].message.contains("exactly one"));
    }

    #[test]
    fn blank_selector_key_or_value_is_rejected() {
        let blank_key = allocation("workers", &["10.0.0.0/16"], &[("  ", "x")]);
        assert!(blank_key.validate().is_err());

        let blank_value = allocation("workers", &["10.0.0.0/16"], &[("role", " ")]);
        assert!(blank_value.validate().is_err());
    }

    #[test]
    fn name_is_bounded() {
        let unnamed = allocation("", &["10.0.0.0/16"], &[("role", "worker")]);
        assert!(unnamed.validate().is_err());

        let long = "x".repeat(64);
        let too_long = allocation(&long, &["10.0.0.0/16"], &[("role", "worker")]);
        let errors = too_long.validate().unwrap_err();
        assert_eq!(errors[0].field, "metadata.name");
    }

    #[test]
    fn status_serializes_health_as_pascal_case() {
        let status = NodeCIDRAllocationStatus {
            health: AllocationHealth::Healthy,
            expected: 4,
            completed: 4,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["health"], "Healthy");
        assert_eq!(json["expected"], 4);
    }
}
