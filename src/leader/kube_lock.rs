//! Lease lock backed by `coordination.k8s.io/v1` Leases
//!
//! # Atomicity
//!
//! Every write carries the resourceVersion read just before it. If the
//! Lease changed in between, the API server answers 409 Conflict and the
//! attempt counts as "not acquired" rather than an error. Two replicas can
//! therefore never both believe they took the same Lease.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use super::lock::{LeaseLock, LeaseObservation};
use crate::{Error, Result};

/// Lease lock stored in a Kubernetes Lease object
pub struct KubeLeaseLock {
    api: Api<Lease>,
    lease_name: String,
    namespace: String,
    identity: String,
}

impl KubeLeaseLock {
    /// Lock the Lease `namespace/lease_name` as `identity`
    pub fn new(client: Client, namespace: &str, lease_name: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    async fn get(&self) -> Result<Option<Lease>> {
        match self.api.get(&self.lease_name).await {
            Ok(lease) => Ok(Some(lease)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the Lease, treating a conflict as losing the race
    async fn replace(&self, lease: &Lease) -> Result<bool> {
        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, lease = %self.describe(), "Lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn spec(&self, now: DateTime<Utc>, lease_duration: Duration, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(duration_secs(lease_duration)),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create(&self, now: DateTime<Utc>, lease_duration: Duration) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.spec(now, lease_duration, 0)),
        };

        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, lease = %self.describe(), "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.lease_name)
    }

    async fn try_acquire(&self, lease_duration: Duration) -> Result<LeaseObservation> {
        let now = Utc::now();

        let Some(existing) = self.get().await? else {
            return Ok(if self.create(now, lease_duration).await? {
                LeaseObservation::acquired(self.identity.clone())
            } else {
                LeaseObservation::held_by(None)
            });
        };

        let spec = existing.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.clone().filter(|h| !h.is_empty());

        if holder.as_deref() == Some(self.identity.as_str()) {
            return Ok(if self.renew(lease_duration).await? {
                LeaseObservation::acquired(self.identity.clone())
            } else {
                LeaseObservation::held_by(holder)
            });
        }

        if holder.is_some() && !is_expired(&spec, now) {
            return Ok(LeaseObservation::held_by(holder));
        }

        let transitions = spec.lease_transitions.unwrap_or(0).saturating_add(1);
        let mut updated = existing;
        updated.spec = Some(self.spec(now, lease_duration, transitions));

        if self.replace(&updated).await? {
            info!(
                identity = %self.identity,
                lease = %self.describe(),
                previous = ?holder,
                transitions,
                "Took over lease"
            );
            Ok(LeaseObservation::acquired(self.identity.clone()))
        } else {
            Ok(LeaseObservation::held_by(holder))
        }
    }

    async fn renew(&self, lease_duration: Duration) -> Result<bool> {
        let Some(existing) = self.get().await? else {
            warn!(identity = %self.identity, lease = %self.describe(), "Lease disappeared");
            return Ok(false);
        };

        let holder = existing.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            warn!(identity = %self.identity, holder = ?holder, "Lease held by another identity");
            return Ok(false);
        }

        let mut updated = existing.clone();
        if let Some(spec) = updated.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
            spec.lease_duration_seconds = Some(duration_secs(lease_duration));
        }

        let renewed = self.replace(&updated).await?;
        if renewed {
            debug!(identity = %self.identity, "Lease renewed");
        }
        Ok(renewed)
    }

    async fn release(&self) -> Result<()> {
        let Some(existing) = self.get().await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let holder = existing.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        // Clear the holder and backdate renewal so a standby can take it at once
        let mut updated = existing.clone();
        if let Some(spec) = updated.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(60)));
        }

        if self.replace(&updated).await? {
            info!(identity = %self.identity, lease = %self.describe(), "Lease released");
            Ok(())
        } else {
            Err(Error::leader_election(format!(
                "lease {} changed while releasing",
                self.describe()
            )))
        }
    }
}

/// True if the holder failed to renew within the lease duration
fn is_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    match (spec.renew_time.as_ref(), spec.lease_duration_seconds) {
        (Some(renewed), Some(secs)) => now > renewed.0 + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    }
}

fn duration_secs(d: Duration) -> i32 {
    i32::try_from(d.as_secs()).unwrap_or(i32::MAX)
}
