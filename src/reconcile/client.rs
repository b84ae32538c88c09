//! Writes against the API server used by the reconciler
//!
//! Reads come from the informer caches; this trait covers the calls that
//! must reach the API server: fresh reads before a retry and all writes.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::crd::UnitedDeployment;
use crate::Error;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "crd-controller";

/// API server operations needed to converge a UnitedDeployment
///
/// Writes carry the resourceVersion of the object passed in. A stale
/// version surfaces as [`Error::Conflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Read a UnitedDeployment straight from the API server
    async fn get_owner(&self, namespace: &str, name: &str)
        -> Result<Option<UnitedDeployment>, Error>;

    /// Create a Deployment
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error>;

    /// Replace a Deployment
    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error>;

    /// Replace the status subresource of a UnitedDeployment
    async fn update_owner_status(
        &self,
        owner: &UnitedDeployment,
    ) -> Result<UnitedDeployment, Error>;
}

/// [`ResourceStore`] backed by a kube client
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Map a 409 on a versioned write to [`Error::Conflict`]
fn on_conflict<T>(result: Result<T, kube::Error>, kind: &str, name: String) -> Result<T, Error> {
    match result {
        Ok(value) => Ok(value),
        Err(kube::Error::Api(e)) if e.code == 409 => Err(Error::conflict(kind, name)),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_owner(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<UnitedDeployment>, Error> {
        let api: Api<UnitedDeployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&post_params(), deployment).await?)
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = deployment.name_any();
        on_conflict(
            api.replace(&name, &post_params(), deployment).await,
            "Deployment",
            format!("{namespace}/{name}"),
        )
    }

    async fn update_owner_status(
        &self,
        owner: &UnitedDeployment,
    ) -> Result<UnitedDeployment, Error> {
        let namespace = owner.namespace().unwrap_or_default();
        let name = owner.name_any();
        let api: Api<UnitedDeployment> = Api::namespaced(self.client.clone(), &namespace);
        let body = serde_json::to_vec(owner)
            .map_err(|e| Error::internal_with_context(e.to_string(), "update_owner_status"))?;
        on_conflict(
            api.replace_status(&name, &post_params(), body).await,
            "UnitedDeployment",
            format!("{namespace}/{name}"),
        )
    }
}
