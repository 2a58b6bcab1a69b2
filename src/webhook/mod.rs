//! Admission webhook for NodeCIDRAllocation resources
//!
//! A ValidatingAdmissionWebhook that rejects malformed resources before
//! they reach storage: bad names, malformed or overlapping address
//! pools, and selectors that are not exactly one non-blank entry.

mod server;

pub use server::{WebhookServer, WebhookTls};
