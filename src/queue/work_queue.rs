//! Deduplicating, rate-limited work queue.
//!
//! Items move through three sets:
//!
//! - `dirty`: needs processing (queued, or re-added while in flight)
//! - `queue`: FIFO of dirty items that are not in flight
//! - `processing`: handed to a worker by `get`, not yet `done`
//!
//! An item is never in `queue` while it is in `processing`. Adding an item
//! that is in flight only marks it dirty; `done` moves it back into the
//! queue. This gives every key at most one worker at a time and collapses
//! any number of adds during processing into a single follow-up pass.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::rate_limiter::{default_controller_rate_limiter, RateLimiter};

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    /// Items scheduled by `add_after`, keyed to their ready time
    waiting: HashMap<T, Instant>,
    shutting_down: bool,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    /// Wakes workers blocked in `get`
    item_ready: Notify,
    /// Wakes `shut_down_with_drain` when processing empties
    drained: Notify,
    limiter: Box<dyn RateLimiter<T>>,
    /// Cancels pending `add_after` timers on shutdown
    timers: CancellationToken,
}

/// Work queue shared between event handlers and workers
///
/// Cloning is cheap; all clones operate on the same queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + std::fmt::Display + 'static,
{
    /// Create a queue using the default controller rate limiter
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, default_controller_rate_limiter())
    }

    /// Create a queue with a custom rate limiter
    pub fn with_rate_limiter(
        name: impl Into<String>,
        limiter: impl RateLimiter<T> + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                item_ready: Notify::new(),
                drained: Notify::new(),
                limiter: Box::new(limiter),
                timers: CancellationToken::new(),
            }),
        }
    }

    /// Queue name, used in logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `item` as needing processing
    ///
    /// No-op if the item is already queued. If it is in flight it is queued
    /// again when the current worker calls `done`. Ignored after shutdown.
    pub fn add(&self, item: T) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.item_ready.notify_one();
    }

    /// Add `item` once `delay` has elapsed
    ///
    /// If the item is already waiting, the earlier ready time wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(&item) {
                Some(existing) if *existing <= ready_at => return,
                _ => {
                    state.waiting.insert(item.clone(), ready_at);
                }
            }
        }

        let queue = self.clone();
        let cancelled = self.inner.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep_until(ready_at) => {
                    let due = {
                        let mut state = queue.inner.state.lock();
                        if state.waiting.get(&item) == Some(&ready_at) {
                            state.waiting.remove(&item);
                            true
                        } else {
                            false
                        }
                    };
                    if due {
                        queue.add(item);
                    }
                }
            }
        });
    }

    /// Add `item` after the delay the rate limiter decides
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.limiter.when(&item);
        debug!(
            queue = %self.inner.name,
            item = %item,
            delay_ms = delay.as_millis(),
            "Requeueing with backoff"
        );
        self.add_after(item, delay);
    }

    /// Reset the failure history of `item`
    pub fn forget(&self, item: &T) {
        self.inner.limiter.forget(item);
    }

    /// Failures recorded for `item` since the last `forget`
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.limiter.num_requeues(item)
    }

    /// Wait for the next item
    ///
    /// Returns `None` once the queue is shutting down; the caller should
    /// stop its loop. Every `Some(item)` must be followed by `done(&item)`.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.item_ready.notified();
            tokio::pin!(notified);
            // Register before checking state so a concurrent add or
            // shutdown cannot slip between the check and the wait.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Finish processing `item`
    ///
    /// If the item was added again while in flight, it is queued now.
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.item_ready.notify_one();
        } else if state.processing.is_empty() {
            drop(state);
            self.inner.drained.notify_waiters();
        }
    }

    /// Number of items waiting to be handed to a worker
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// True when nothing is waiting to be handed to a worker
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items currently held by workers
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().processing.len()
    }

    /// True once `shut_down` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Stop the queue
    ///
    /// Every blocked and future `get` returns `None`, pending delayed adds
    /// are dropped and further adds are ignored.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.inner.timers.cancel();
        self.inner.item_ready.notify_waiters();
        debug!(queue = %self.inner.name, "Work queue shut down");
    }

    /// Stop the queue and wait until every in-flight item is `done`
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.inner.state.lock().processing.is_empty() {
                return;
            }
            drained.await;
        }
    }
}
