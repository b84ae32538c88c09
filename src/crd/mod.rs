//! Custom Resource Definitions and kind registration
//!
//! There is no process-wide type registry. [`ControllerKinds::register`] is
//! called once at startup, before any controller is built, and the result is
//! handed to everything that needs to recognise the watched kinds.

mod united_deployment;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

pub use united_deployment::{UnitedDeployment, UnitedDeploymentSpec, UnitedDeploymentStatus};

/// Group, version and kind of a watched resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KindInfo {
    /// API group, empty for the core group
    pub group: String,
    /// API version within the group
    pub version: String,
    /// Kind name
    pub kind: String,
}

impl KindInfo {
    /// Describe a statically typed resource
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
        }
    }

    /// `group/version`, or just `version` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// True if `owner_ref` points at an object of this kind
    ///
    /// Only the group is compared from the apiVersion so an owner written
    /// under another served version still matches.
    pub fn matches(&self, owner_ref: &OwnerReference) -> bool {
        if owner_ref.kind != self.kind {
            return false;
        }
        let group = owner_ref
            .api_version
            .rsplit_once('/')
            .map(|(group, _)| group)
            .unwrap_or("");
        group == self.group
    }
}

/// The owner and derived kinds this controller works with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerKinds {
    /// User-facing resource driving reconciliation
    pub owner: KindInfo,
    /// Resource created to realise the owner's spec
    pub derived: KindInfo,
}

impl ControllerKinds {
    /// Register the UnitedDeployment → Deployment pair
    pub fn register() -> Self {
        let kinds = Self {
            owner: KindInfo::of::<UnitedDeployment>(),
            derived: KindInfo::of::<Deployment>(),
        };
        tracing::debug!(
            owner = %kinds.owner.api_version(),
            owner_kind = %kinds.owner.kind,
            derived = %kinds.derived.api_version(),
            derived_kind = %kinds.derived.kind,
            "Registered controller kinds"
        );
        kinds
    }
}
