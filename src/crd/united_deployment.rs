//! UnitedDeployment Custom Resource Definition
//!
//! A UnitedDeployment asks for a Deployment with a given name and replica
//! count. The controller owns that Deployment and reports how many of its
//! replicas are available.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Specification for a UnitedDeployment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.crd-controller.io",
    version = "v1",
    kind = "UnitedDeployment",
    plural = "uniteddeployments",
    shortname = "ud",
    status = "UnitedDeploymentStatus",
    namespaced,
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.deploymentName"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UnitedDeploymentSpec {
    /// Name of the Deployment the controller creates and owns
    pub deployment_name: String,

    /// Desired replica count; the Deployment default (1) applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl UnitedDeploymentSpec {
    /// Validate the specification
    pub fn validate(&self) -> Result<()> {
        if self.deployment_name.trim().is_empty() {
            return Err(Error::config("spec.deploymentName must be specified"));
        }
        if let Some(replicas) = self.replicas {
            if replicas < 0 {
                return Err(Error::config(format!(
                    "spec.replicas must not be negative, got {replicas}"
                )));
            }
        }
        Ok(())
    }
}

/// Observed state written by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitedDeploymentStatus {
    /// Available replicas of the owned Deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,
}
