//! Reconciliation keys
//!
//! A `ReconcileKey` names one owner object. It is the unit of deduplication
//! in the work queue, so two keys compare equal exactly when they refer to
//! the same `(namespace, name)` pair.

use std::fmt;

use kube::Resource;

use crate::{Error, Result};

/// Stable identifier for one unit of reconciliation
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileKey {
    namespace: Option<String>,
    name: String,
}

impl ReconcileKey {
    /// Key for a namespaced object
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Build the key from an object's metadata
    ///
    /// Fails with a decode error when the object has no name, which only
    /// happens for payloads that never came from the API server.
    pub fn from_resource<K: Resource>(obj: &K) -> Result<Self> {
        let meta = obj.meta();
        let name = meta
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::decode("object has no metadata.name"))?;
        Ok(Self {
            namespace: meta.namespace.clone().filter(|ns| !ns.is_empty()),
            name,
        })
    }

    /// Parse `namespace/name` or `name`
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(Self::cluster_scoped(name)),
            (Some(ns), Some(name), None) if !name.is_empty() => {
                if ns.is_empty() {
                    Ok(Self::cluster_scoped(name))
                } else {
                    Ok(Self::new(ns, name))
                }
            }
            _ => Err(Error::decode(format!("unexpected key format: {s:?}"))),
        }
    }

    /// Namespace of the object, `None` when cluster-scoped
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Name of the object
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}
