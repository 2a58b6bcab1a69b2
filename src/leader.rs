//! Lease-based leader election
//!
//! A thin lock over a `coordination.k8s.io/v1` Lease object. Candidates
//! try to create the Lease, or take it over once the previous holder's
//! renew time has gone stale; the winner renews it in the background for
//! as long as the process runs. Writes go through create/replace so the
//! API server's optimistic concurrency arbitrates races between
//! candidates.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::chrono::{self, Utc};
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams},
    error::ErrorResponse,
    Client,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A named Lease this process competes for.
pub struct LeaseLock {
    api: Api<Lease>,
    name: String,
    identity: String,
    lease_duration_seconds: i32,
}

impl LeaseLock {
    /// Lock on a Lease in the operator's own namespace.
    pub fn new(client: Client, name: &str, identity: &str, lease_duration_seconds: i32) -> Self {
        Self {
            api: Api::default_namespaced(client),
            name: name.to_string(),
            identity: identity.to_string(),
            lease_duration_seconds,
        }
    }

    /// Block until this instance holds the lease.
    pub async fn acquire(&self) -> Result<()> {
        info!(lease = %self.name, identity = %self.identity, "acquiring leader lease");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(lease = %self.name, "leader lease acquired");
                    return Ok(());
                }
                Ok(false) => debug!(lease = %self.name, "lease held elsewhere, waiting"),
                Err(e) => warn!(lease = %self.name, error = %e, "lease acquisition attempt failed"),
            }
            tokio::time::sleep(self.retry_period()).await;
        }
    }

    /// Renew the held lease in the background for the life of the
    /// process. Renewal failures are logged; the next tick retries.
    pub fn spawn_renewal(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.retry_period();
            loop {
                tokio::time::sleep(period).await;
                if let Err(e) = self.renew().await {
                    warn!(lease = %self.name, error = %e, "unable to renew leader lease");
                }
            }
        })
    }

    fn retry_period(&self) -> Duration {
        Duration::from_secs((self.lease_duration_seconds.max(3) / 3) as u64)
    }

    async fn try_acquire(&self) -> Result<bool> {
        match self.api.get_opt(&self.name).await? {
            None => self.create().await,
            Some(lease) if self.held_by(&lease) || is_expired(&lease, self.lease_duration_seconds) => {
                self.take_over(lease).await
            }
            Some(_) => Ok(false),
        }
    }

    fn held_by(&self, lease: &Lease) -> bool {
        lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.identity.as_str())
    }

    async fn create(&self) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            spec: Some(self.desired_spec(0)),
        };

        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            // Another candidate created it first.
            Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn take_over(&self, current: Lease) -> Result<bool> {
        let previous_transitions = current
            .spec
            .as_ref()
            .and_then(|s| s.lease_transitions)
            .unwrap_or(0);
        let transitions = if self.held_by(&current) {
            previous_transitions
        } else {
            previous_transitions + 1
        };

        let lease = Lease {
            // Keeping the resourceVersion makes the replace a
            // compare-and-swap against competing candidates.
            metadata: current.metadata,
            spec: Some(self.desired_spec(transitions)),
        };

        match self
            .api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ErrorResponse { code: 409 | 404, .. })) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn renew(&self) -> Result<()> {
        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": self.identity,
                "renewTime": MicroTime(Utc::now()),
            }
        });
        self.api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::Lease(format!("renew {}: {e}", self.name)))?;
        Ok(())
    }

    fn desired_spec(&self, transitions: i32) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_duration_seconds: Some(self.lease_duration_seconds),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }
}

/// A lease with no holder or a stale renew time is up for grabs.
fn is_expired(lease: &Lease, lease_duration_seconds: i32) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return true;
    };
    if spec.holder_identity.as_deref().unwrap_or_default().is_empty() {
        return true;
    }
    let Some(renew) = spec.renew_time.as_ref() else {
        return true;
    };

    let duration = spec
        .lease_duration_seconds
        .unwrap_or(lease_duration_seconds);
    renew.0 + chrono::Duration::seconds(i64::from(duration)) < Utc::now()
}
