//! Error types for the controller
//!
//! Errors carry enough context (resource kind, name, queue key) to be useful
//! in logs. Per-item failures never leave the work queue retry loop; only
//! startup failures (cache sync, configuration) propagate out of `run`.

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Write rejected because the resourceVersion we sent is stale
    #[error("conflict updating {kind} {name}: object has been modified")]
    Conflict {
        /// Resource kind being written
        kind: String,
        /// `namespace/name` of the object
        name: String,
    },

    /// A notification payload could not be turned into an object
    #[error("decode error: {message}")]
    Decode {
        /// Description of what could not be decoded
        message: String,
    },

    /// Informer caches did not report synced in time
    #[error("failed to wait for caches to sync: {message}")]
    CacheSync {
        /// Why the wait ended
        message: String,
    },

    /// Lease acquisition, renewal or release failure
    #[error("leader election error: {message}")]
    LeaderElection {
        /// Description of what failed
        message: String,
    },

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Reconciliation of a single key failed
    #[error("reconcile error for {key}: {message}")]
    Reconcile {
        /// Queue key being reconciled
        key: String,
        /// Description of what failed
        message: String,
    },

    /// A derived object exists but is not controlled by the owner
    #[error("{kind} {name} already exists and is not managed by this controller")]
    ResourceExists {
        /// Resource kind of the conflicting object
        kind: String,
        /// `namespace/name` of the conflicting object
        name: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "worker", "elector")
        context: String,
    },
}

impl Error {
    /// Create a conflict error for the given kind and object
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    /// Create a cache sync error
    pub fn cache_sync(msg: impl Into<String>) -> Self {
        Self::CacheSync {
            message: msg.into(),
        }
    }

    /// Create a leader election error
    pub fn leader_election(msg: impl Into<String>) -> Self {
        Self::LeaderElection {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a reconcile error for a queue key
    pub fn reconcile(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Reconcile {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a resource-exists error
    pub fn resource_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ResourceExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(msg: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Returns true if the error is a stale-resourceVersion rejection
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 409,
            _ => false,
        }
    }
}
