//! Worker pool draining the work queue into the reconciler
//!
//! `Controller::run` waits for every informer cache to sync, starts a fixed
//! number of workers and keeps them running until cancelled. Each worker
//! takes one key at a time, so a key is never reconciled by two workers at
//! once while different keys proceed in parallel.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::ControllerConfig;
use crate::informer::CacheSynced;
use crate::queue::WorkQueue;
use crate::{Error, ReconcileKey, Result};

/// Business logic invoked for each key
///
/// Must be idempotent: the same key can be reconciled any number of times,
/// and a reconcile always reads the latest cached state rather than the
/// notification that triggered it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Drive the object named by `key` toward its desired state
    async fn reconcile(&self, key: &ReconcileKey) -> Result<()>;
}

/// Worker pool bound to one queue and one reconciler
pub struct Controller<R> {
    name: String,
    queue: WorkQueue<ReconcileKey>,
    reconciler: Arc<R>,
    caches: Vec<Arc<dyn CacheSynced>>,
    config: ControllerConfig,
}

impl<R> Controller<R>
where
    R: Reconciler + 'static,
{
    /// Create a controller; `caches` must all sync before workers start
    pub fn new(
        name: impl Into<String>,
        queue: WorkQueue<ReconcileKey>,
        reconciler: Arc<R>,
        caches: Vec<Arc<dyn CacheSynced>>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            reconciler,
            caches,
            config,
        }
    }

    /// The queue workers drain
    pub fn queue(&self) -> &WorkQueue<ReconcileKey> {
        &self.queue
    }

    /// Run until `cancel` fires
    ///
    /// Returns an error only if the caches never sync. On return the queue
    /// is shut down and every worker has exited, so no reconcile is running.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(controller = %self.name, "Starting controller");
        let result = self.run_workers(cancel).await;
        self.queue.shut_down();
        result
    }

    async fn run_workers(&self, cancel: CancellationToken) -> Result<()> {
        info!(controller = %self.name, "Waiting for informer caches to sync");
        self.wait_for_cache_sync(&cancel).await?;

        info!(controller = %self.name, count = self.config.workers, "Starting workers");
        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            let worker = Worker {
                id,
                queue: self.queue.clone(),
                reconciler: Arc::clone(&self.reconciler),
            };
            workers.spawn(worker.run());
        }
        info!(controller = %self.name, "Started workers");

        cancel.cancelled().await;
        info!(controller = %self.name, "Shutting down workers");
        self.queue.shut_down();

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(controller = %self.name, error = %e, "Worker task failed");
            }
        }
        info!(controller = %self.name, "Workers stopped");
        Ok(())
    }

    /// Poll the caches until all report synced, the timeout passes or we
    /// are cancelled
    async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + self.config.cache_sync_timeout;
        loop {
            let pending: Vec<&str> = self
                .caches
                .iter()
                .filter(|c| !c.has_synced())
                .map(|c| c.kind())
                .collect();
            if pending.is_empty() {
                info!(controller = %self.name, "Caches synced");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::cache_sync(format!(
                    "timed out after {:?} waiting for {}",
                    self.config.cache_sync_timeout,
                    pending.join(", ")
                )));
            }
            debug!(controller = %self.name, pending = ?pending, "Caches not yet synced");

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::cache_sync("cancelled before caches synced"));
                }
                _ = tokio::time::sleep(self.config.cache_sync_poll_interval) => {}
            }
        }
    }
}

struct Worker<R> {
    id: usize,
    queue: WorkQueue<ReconcileKey>,
    reconciler: Arc<R>,
}

impl<R: Reconciler + 'static> Worker<R> {
    async fn run(self) {
        debug!(worker = self.id, "Worker started");
        while self.process_next_work_item().await {}
        debug!(worker = self.id, "Worker exiting");
    }

    /// Handle one key; false once the queue has shut down
    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let started = Instant::now();
        // The call itself happens inside the guarded future so a panic
        // before the first await is caught too.
        let outcome = AssertUnwindSafe(async { self.reconciler.reconcile(&key).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                self.queue.forget(&key);
                info!(
                    worker = self.id,
                    key = %key,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Successfully synced"
                );
            }
            Ok(Err(e)) => {
                warn!(
                    worker = self.id,
                    key = %key,
                    error = %e,
                    retries = self.queue.num_requeues(&key),
                    "Reconcile failed, requeueing"
                );
                self.queue.add_rate_limited(key.clone());
            }
            Err(panic) => {
                error!(
                    worker = self.id,
                    key = %key,
                    panic = %panic_message(panic.as_ref()),
                    "Reconcile panicked, requeueing"
                );
                self.queue.add_rate_limited(key.clone());
            }
        }

        self.queue.done(&key);
        true
    }
}

/// Best-effort text of a panic payload
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
