//! In-process lease for single-node runs and tests
//!
//! Several [`MemoryLock`]s sharing one [`MemoryLeaseBackend`] contend for
//! the same lease exactly like replicas contending for a Kubernetes Lease.
//! Expiry uses the tokio clock, so paused-time tests control it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::lock::{LeaseLock, LeaseObservation};
use crate::Result;

#[derive(Clone, Debug)]
struct Record {
    holder: Option<String>,
    renewed_at: Instant,
    lease_duration: Duration,
    transitions: u32,
}

impl Record {
    fn expired(&self, now: Instant) -> bool {
        now >= self.renewed_at + self.lease_duration
    }
}

/// Shared storage for one lease
#[derive(Clone, Default)]
pub struct MemoryLeaseBackend {
    record: Arc<Mutex<Option<Record>>>,
}

impl MemoryLeaseBackend {
    /// Create an empty backend; the first contender to try wins
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder, ignoring expiry
    pub fn holder(&self) -> Option<String> {
        self.record.lock().as_ref().and_then(|r| r.holder.clone())
    }

    /// Number of times the lease changed hands
    pub fn transitions(&self) -> u32 {
        self.record.lock().as_ref().map_or(0, |r| r.transitions)
    }
}

/// One contender's handle on a [`MemoryLeaseBackend`]
pub struct MemoryLock {
    backend: MemoryLeaseBackend,
    identity: String,
}

impl MemoryLock {
    /// Contend for `backend` as `identity`
    pub fn new(backend: MemoryLeaseBackend, identity: impl Into<String>) -> Self {
        Self {
            backend,
            identity: identity.into(),
        }
    }
}

#[async_trait]
impl LeaseLock for MemoryLock {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn try_acquire(&self, lease_duration: Duration) -> Result<LeaseObservation> {
        let now = Instant::now();
        let mut record = self.backend.record.lock();

        let transitions = match record.as_ref() {
            None => 0,
            Some(r) if r.holder.as_deref() == Some(self.identity.as_str()) => r.transitions,
            Some(r) if r.holder.is_none() || r.expired(now) => r.transitions.saturating_add(1),
            Some(r) => return Ok(LeaseObservation::held_by(r.holder.clone())),
        };

        *record = Some(Record {
            holder: Some(self.identity.clone()),
            renewed_at: now,
            lease_duration,
            transitions,
        });
        Ok(LeaseObservation::acquired(self.identity.clone()))
    }

    async fn renew(&self, lease_duration: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut record = self.backend.record.lock();
        match record.as_mut() {
            Some(r) if r.holder.as_deref() == Some(self.identity.as_str()) && !r.expired(now) => {
                r.renewed_at = now;
                r.lease_duration = lease_duration;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self) -> Result<()> {
        let mut record = self.backend.record.lock();
        if let Some(r) = record.as_mut() {
            if r.holder.as_deref() == Some(self.identity.as_str()) {
                r.holder = None;
            }
        }
        Ok(())
    }
}
