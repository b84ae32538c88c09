//! crd-controller - leader-elected reconciliation engine for UnitedDeployments
//!
//! The controller watches `UnitedDeployment` resources and the Deployments
//! they own, and drives each Deployment toward its owner's spec. Only the
//! replica holding the lease reconciles.
//!
//! # Architecture
//!
//! ```text
//! watch streams ─▶ SharedInformer ─▶ EventRouter ─▶ WorkQueue ─▶ Controller ─▶ Reconciler
//!                        │                                                      │
//!                        └──────────────── Store (read-only cache) ◀────────────┘
//! ```
//!
//! The whole pipeline runs inside [`leader::LeaderElector`]; losing the lease
//! stops the workers before the lease is given back.
//!
//! # Modules
//!
//! - [`queue`] - Deduplicating rate-limited work queue
//! - [`informer`] - Watch-driven caches and change notifications
//! - [`router`] - Owner/derived notifications to owner keys
//! - [`controller`] - Worker pool and the [`controller::Reconciler`] seam
//! - [`leader`] - Lease-based leader election
//! - [`reconcile`] - UnitedDeployment business logic
//! - [`crd`] - Custom Resource Definitions and kind registration
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod informer;
pub mod key;
pub mod leader;
pub mod queue;
pub mod reconcile;
pub mod router;
pub mod signals;
pub mod telemetry;

pub use error::Error;
pub use key::ReconcileKey;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name reported on Events and used as the queue name
pub const CONTROLLER_NAME: &str = "united-deployment-controller";
