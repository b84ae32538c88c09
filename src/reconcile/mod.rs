//! UnitedDeployment reconciliation
//!
//! Converges each UnitedDeployment onto a single Deployment it controls:
//! create it when missing, correct its replica count when it drifts, and
//! mirror the available replica count into the owner's status.
//!
//! All reads come from the informer caches. Writes carry the cached
//! resourceVersion, so acting on a stale cache fails with a conflict and the
//! key is retried with backoff instead of clobbering a newer object.

mod client;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

pub use client::{KubeResourceStore, ResourceStore, FIELD_MANAGER};

use crate::controller::Reconciler;
use crate::crd::UnitedDeployment;
use crate::events::{actions, reasons, EventPublisher};
use crate::informer::Store;
use crate::{Error, ReconcileKey, Result};

/// Image run by generated Deployments
pub const DEFAULT_IMAGE: &str = "nginx:latest";

/// Label carrying the owning UnitedDeployment's name
pub const CONTROLLER_LABEL: &str = "controller";

/// Reconciler for UnitedDeployment owners
pub struct UnitedDeploymentReconciler {
    owners: Store<UnitedDeployment>,
    deployments: Store<Deployment>,
    client: Arc<dyn ResourceStore>,
    events: Arc<dyn EventPublisher>,
}

impl UnitedDeploymentReconciler {
    /// Create a reconciler reading from the given caches
    pub fn new(
        owners: Store<UnitedDeployment>,
        deployments: Store<Deployment>,
        client: Arc<dyn ResourceStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            owners,
            deployments,
            client,
            events,
        }
    }

    async fn publish(
        &self,
        owner: &UnitedDeployment,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        self.events
            .publish(&owner.object_ref(&()), type_, reason, actions::RECONCILE, Some(note))
            .await;
    }

    /// Write `available` into the owner's status
    ///
    /// A conflict means the cached owner is stale; re-read it once from the
    /// API server and retry. A second conflict goes back to the queue.
    async fn update_status(
        &self,
        owner: &UnitedDeployment,
        available: Option<i32>,
    ) -> Result<()> {
        if owner.status.as_ref().and_then(|s| s.available_replicas) == available {
            debug!(owner = %owner.name_any(), "Status already up to date");
            return Ok(());
        }

        let mut updated = owner.clone();
        updated.status.get_or_insert_with(Default::default).available_replicas = available;

        match self.client.update_owner_status(&updated).await {
            Err(e) if e.is_conflict() => {
                let namespace = owner.namespace().unwrap_or_default();
                let name = owner.name_any();
                debug!(owner = %name, "Status update conflicted, retrying against fresh read");
                let Some(mut fresh) = self.client.get_owner(&namespace, &name).await? else {
                    return Ok(());
                };
                fresh.status.get_or_insert_with(Default::default).available_replicas = available;
                self.client.update_owner_status(&fresh).await?;
                Ok(())
            }
            result => result.map(|_| ()),
        }
    }
}

#[async_trait]
impl Reconciler for UnitedDeploymentReconciler {
    #[instrument(skip_all, fields(key = %key))]
    async fn reconcile(&self, key: &ReconcileKey) -> Result<()> {
        let Some(owner) = self.owners.get(key) else {
            debug!("UnitedDeployment no longer exists, nothing to do");
            return Ok(());
        };
        let namespace = key.namespace().unwrap_or_default();

        if let Err(e) = owner.spec.validate() {
            // retrying cannot fix a bad spec; the next edit re-enqueues it
            error!(error = %e, "Invalid UnitedDeployment spec, skipping");
            return Ok(());
        }
        let deployment_name = owner.spec.deployment_name.as_str();

        let deployment = match self.deployments.get_namespaced(namespace, deployment_name) {
            Some(existing) => existing,
            None => {
                info!(deployment = deployment_name, "Creating Deployment");
                let desired = new_deployment(&owner)?;
                Arc::new(self.client.create_deployment(namespace, &desired).await?)
            }
        };

        if !is_controlled_by(&deployment, &owner) {
            let note = format!(
                "Resource {deployment_name:?} already exists and is not managed by UnitedDeployment"
            );
            warn!(deployment = deployment_name, "Deployment not controlled by this owner");
            self.publish(&owner, EventType::Warning, reasons::ERR_RESOURCE_EXISTS, note)
                .await;
            return Err(Error::resource_exists(
                "Deployment",
                format!("{namespace}/{deployment_name}"),
            ));
        }

        let current = deployment.spec.as_ref().and_then(|s| s.replicas);
        let deployment = match owner.spec.replicas {
            Some(desired) if current != Some(desired) => {
                info!(
                    deployment = deployment_name,
                    desired,
                    current = ?current,
                    "Updating Deployment replicas"
                );
                let mut replacement = new_deployment(&owner)?;
                replacement.metadata.resource_version = deployment.resource_version();
                Arc::new(self.client.replace_deployment(namespace, &replacement).await?)
            }
            _ => deployment,
        };

        let available = deployment.status.as_ref().and_then(|s| s.available_replicas);
        self.update_status(&owner, available).await?;

        self.publish(
            &owner,
            EventType::Normal,
            reasons::SYNCED,
            "UnitedDeployment synced successfully".to_string(),
        )
        .await;
        Ok(())
    }
}

/// True if `deployment`'s controller reference is `owner`
pub fn is_controlled_by(deployment: &Deployment, owner: &UnitedDeployment) -> bool {
    let Some(uid) = owner.uid() else {
        return false;
    };
    deployment
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

/// Deployment realising `owner`'s spec, controlled by `owner`
pub fn new_deployment(owner: &UnitedDeployment) -> Result<Deployment> {
    let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::reconcile(owner.name_any(), "UnitedDeployment has no uid to own a Deployment")
    })?;

    let labels = BTreeMap::from([
        ("app".to_string(), "nginx".to_string()),
        (CONTROLLER_LABEL.to_string(), owner.name_any()),
    ]);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(owner.spec.deployment_name.clone()),
            namespace: owner.namespace(),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: owner.spec.replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "nginx".to_string(),
                        image: Some(DEFAULT_IMAGE.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
