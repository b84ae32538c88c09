//! Distributed lock primitive consumed by the elector

use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Result of an acquisition attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseObservation {
    /// True if this process now holds the lease
    pub acquired: bool,
    /// Identity of the current holder, if the lease is held
    pub holder: Option<String>,
}

impl LeaseObservation {
    /// We hold the lease
    pub fn acquired(identity: impl Into<String>) -> Self {
        Self {
            acquired: true,
            holder: Some(identity.into()),
        }
    }

    /// Someone else (or nobody) holds the lease
    pub fn held_by(holder: Option<String>) -> Self {
        Self {
            acquired: false,
            holder,
        }
    }
}

/// A lease that at most one identity can hold at a time
///
/// Implementations must make acquisition atomic (compare-and-swap on a
/// version token) so two contenders can never both succeed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Identity this lock acquires under
    fn identity(&self) -> String;

    /// Human-readable lock location, e.g. `namespace/name`
    fn describe(&self) -> String;

    /// Take the lease if it is free, expired, or already ours
    async fn try_acquire(&self, lease_duration: Duration) -> Result<LeaseObservation>;

    /// Extend a lease we hold; `Ok(false)` means another holder has it
    async fn renew(&self, lease_duration: Duration) -> Result<bool>;

    /// Give the lease up so a standby can take it without waiting for
    /// expiry. No-op if we do not hold it.
    async fn release(&self) -> Result<()>;
}
