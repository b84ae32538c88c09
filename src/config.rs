//! Controller timing and concurrency settings

use std::time::Duration;

use crate::{Error, Result};

/// Default number of concurrent workers
pub const DEFAULT_WORKERS: usize = 2;

/// Default time allowed for informer caches to sync before start fails
pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Default interval between cache sync polls
pub const DEFAULT_CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Worker pool settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile loops
    pub workers: usize,
    /// How long to wait for caches to sync before failing start
    pub cache_sync_timeout: Duration,
    /// How often to check cache sync state
    pub cache_sync_poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
            cache_sync_poll_interval: DEFAULT_CACHE_SYNC_POLL_INTERVAL,
        }
    }
}

impl ControllerConfig {
    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.cache_sync_poll_interval.is_zero() {
            return Err(Error::config("cache sync poll interval must be positive"));
        }
        if self.cache_sync_timeout < self.cache_sync_poll_interval {
            return Err(Error::config(format!(
                "cache sync timeout ({:?}) must be at least the poll interval ({:?})",
                self.cache_sync_timeout, self.cache_sync_poll_interval
            )));
        }
        Ok(())
    }
}
