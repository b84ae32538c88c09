//! Leader election gate
//!
//! Wraps the controller lifecycle so only one replica reconciles at a time.
//!
//! ```text
//!            acquire ok               renew lost / cancel / work exit
//!  Standby ──────────────▶ Leading ──────────────────────────────▶ Released
//!     ▲                                                               │
//!     └────────────── resume_after_loss (leadership lost only) ───────┘
//! ```
//!
//! The lease is only given back after the work started by
//! [`LeaderCallbacks::on_started_leading`] has returned, so a standby can
//! never take over while this replica is still writing.

pub mod kube_lock;
pub mod lock;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use kube_lock::KubeLeaseLock;
pub use lock::{LeaseLock, LeaseObservation};
pub use memory::{MemoryLeaseBackend, MemoryLock};

use crate::{Error, Result};

/// Default time a lease stays valid without renewal
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Default time the leader keeps retrying a failing renewal
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(15);

/// Default interval between acquisition and renewal attempts
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(5);

/// Upper bound of the random extra wait added to standby retries
const JITTER_FACTOR: f64 = 0.2;

/// Position in the election state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// Not holding the lease, polling for it
    Standby,
    /// Holding the lease and running work
    Leading,
    /// Lease given up or lost, tearing down
    Released,
}

/// How a single election round ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// The shutdown token fired
    Cancelled,
    /// The leader work returned on its own
    WorkFinished,
    /// Renewal failed or another identity took the lease
    LeadershipLost,
}

/// Lease timing and teardown behaviour
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How long the leader keeps retrying renewal before giving up
    pub renew_deadline: Duration,
    /// Polling interval for acquisition and renewal
    pub retry_period: Duration,
    /// Release the lease on cancellation instead of letting it expire
    pub release_on_cancel: bool,
    /// Go back to standby after losing leadership instead of returning
    pub resume_after_loss: bool,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            release_on_cancel: true,
            resume_after_loss: false,
        }
    }
}

impl LeaderElectionConfig {
    /// Check the timing relationships that keep leadership from flapping
    pub fn validate(&self) -> Result<()> {
        if self.retry_period.is_zero() {
            return Err(Error::config("retry period must be positive"));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(Error::config(format!(
                "renew deadline ({:?}) must be shorter than lease duration ({:?})",
                self.renew_deadline, self.lease_duration
            )));
        }
        if self.retry_period >= self.renew_deadline {
            return Err(Error::config(format!(
                "retry period ({:?}) must be shorter than renew deadline ({:?})",
                self.retry_period, self.renew_deadline
            )));
        }
        Ok(())
    }
}

/// Hooks invoked on state transitions
#[async_trait]
pub trait LeaderCallbacks: Send + Sync + 'static {
    /// Run leader-only work until `cancel` fires
    ///
    /// Returning ends leadership. An error is reported by the elector after
    /// the lease has been released.
    async fn on_started_leading(&self, cancel: CancellationToken) -> Result<()>;

    /// Called once the leader work has exited, before the lease is released
    async fn on_stopped_leading(&self) {}

    /// Called whenever the observed lease holder changes
    fn on_new_leader(&self, _identity: &str) {}
}

enum Exit {
    Cancelled,
    WorkFinished,
    Lost,
}

/// Leader election state machine over a [`LeaseLock`]
pub struct LeaderElector<L> {
    lock: Arc<L>,
    config: LeaderElectionConfig,
    state: watch::Sender<LeaderState>,
}

impl<L: LeaseLock + 'static> LeaderElector<L> {
    /// Create an elector; fails if the timing is inconsistent
    pub fn new(lock: Arc<L>, config: LeaderElectionConfig) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(LeaderState::Standby);
        Ok(Self {
            lock,
            config,
            state,
        })
    }

    /// Current state
    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    /// Stream of state transitions
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LeaderState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(identity = %self.lock.identity(), ?previous, ?state, "Leader state changed");
        }
    }

    /// Run election rounds until cancelled or leadership is lost for good
    ///
    /// With `resume_after_loss` unset, losing leadership ends the run with
    /// [`ElectionOutcome::LeadershipLost`] and the caller is expected to exit.
    pub async fn run<C: LeaderCallbacks>(
        &self,
        callbacks: Arc<C>,
        cancel: CancellationToken,
    ) -> Result<ElectionOutcome> {
        loop {
            let outcome = self.run_once(Arc::clone(&callbacks), cancel.clone()).await?;
            if outcome == ElectionOutcome::LeadershipLost
                && self.config.resume_after_loss
                && !cancel.is_cancelled()
            {
                info!(
                    identity = %self.lock.identity(),
                    "Returning to standby after losing leadership"
                );
                continue;
            }
            return Ok(outcome);
        }
    }

    /// Run one Standby → Leading → Released round
    pub async fn run_once<C: LeaderCallbacks>(
        &self,
        callbacks: Arc<C>,
        cancel: CancellationToken,
    ) -> Result<ElectionOutcome> {
        self.set_state(LeaderState::Standby);
        if !self.acquire(callbacks.as_ref(), &cancel).await {
            return Ok(ElectionOutcome::Cancelled);
        }

        self.set_state(LeaderState::Leading);
        info!(
            identity = %self.lock.identity(),
            lease = %self.lock.describe(),
            "Leadership acquired"
        );

        let work_token = cancel.child_token();
        let mut work: JoinHandle<Result<()>> = tokio::spawn({
            let callbacks = Arc::clone(&callbacks);
            let token = work_token.clone();
            async move { callbacks.on_started_leading(token).await }
        });

        let (exit, finished) = self.hold(&mut work, &cancel).await;

        self.set_state(LeaderState::Released);
        work_token.cancel();
        let result = match finished {
            Some(result) => result,
            None => work.await,
        };
        callbacks.on_stopped_leading().await;
        info!(identity = %self.lock.identity(), "Leader work stopped");

        let release = match exit {
            Exit::Cancelled => self.config.release_on_cancel,
            Exit::WorkFinished => true,
            Exit::Lost => false,
        };
        if release {
            if let Err(e) = self.lock.release().await {
                warn!(identity = %self.lock.identity(), error = %e, "Failed to release lease");
            }
        }

        let work_result = result.unwrap_or_else(|e| {
            Err(Error::internal_with_context(
                format!("leader work panicked: {e}"),
                "elector",
            ))
        });

        match exit {
            Exit::WorkFinished => {
                work_result?;
                Ok(ElectionOutcome::WorkFinished)
            }
            Exit::Cancelled => {
                log_stopped_work(&work_result);
                Ok(ElectionOutcome::Cancelled)
            }
            Exit::Lost => {
                log_stopped_work(&work_result);
                Ok(ElectionOutcome::LeadershipLost)
            }
        }
    }

    /// Poll for the lease; false if cancelled first
    async fn acquire<C: LeaderCallbacks>(&self, callbacks: &C, cancel: &CancellationToken) -> bool {
        let identity = self.lock.identity();
        info!(identity = %identity, lease = %self.lock.describe(), "Waiting for leadership...");

        let mut observed: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                return false;
            }

            match self.lock.try_acquire(self.config.lease_duration).await {
                Ok(observation) => {
                    if observation.holder != observed {
                        if let Some(holder) = &observation.holder {
                            info!(identity = %identity, leader = %holder, "New leader observed");
                            callbacks.on_new_leader(holder);
                        }
                        observed = observation.holder.clone();
                    }
                    if observation.acquired {
                        return true;
                    }
                    debug!(
                        identity = %identity,
                        retry_secs = self.config.retry_period.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %identity,
                        error = %e,
                        retry_secs = self.config.retry_period.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(jittered(self.config.retry_period)) => {}
            }
        }
    }

    /// Renew until something ends leadership
    async fn hold(
        &self,
        work: &mut JoinHandle<Result<()>>,
        cancel: &CancellationToken,
    ) -> (Exit, Option<std::result::Result<Result<()>, tokio::task::JoinError>>) {
        let identity = self.lock.identity();
        let deadline = self.config.renew_deadline;
        let mut last_renew = Instant::now();

        loop {
            let wait = self.config.retry_period.min(remaining(deadline, last_renew));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(identity = %identity, "Shutdown requested, stepping down");
                    return (Exit::Cancelled, None);
                }
                result = &mut *work => {
                    info!(identity = %identity, "Leader work returned");
                    return (Exit::WorkFinished, Some(result));
                }
                _ = tokio::time::sleep(wait) => {}
            }

            // The whole renew round, retries included, must fit in the deadline
            let budget = remaining(deadline, last_renew);
            if budget.is_zero() {
                warn!(identity = %identity, "Leadership lost: renew deadline exceeded");
                return (Exit::Lost, None);
            }

            let attempt = Instant::now();
            match tokio::time::timeout(budget, self.lock.renew(self.config.lease_duration)).await {
                Ok(Ok(true)) => last_renew = attempt,
                Ok(Ok(false)) => {
                    warn!(identity = %identity, "Leadership lost: lease held by another identity");
                    return (Exit::Lost, None);
                }
                Ok(Err(e)) => {
                    warn!(identity = %identity, error = %e, "Lease renewal failed, retrying");
                }
                Err(_) => {
                    warn!(identity = %identity, "Leadership lost: renewal timed out");
                    return (Exit::Lost, None);
                }
            }
        }
    }
}

/// Time left before `deadline` runs out, counted from the last good renewal
fn remaining(deadline: Duration, last_renew: Instant) -> Duration {
    deadline.saturating_sub(last_renew.elapsed())
}

fn log_stopped_work(result: &Result<()>) {
    if let Err(e) = result {
        error!(error = %e, "Leader work failed while stepping down");
    }
}

fn jittered(period: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.0..=JITTER_FACTOR);
    period.mul_f64(1.0 + factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use lock::MockLeaseLock;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    type Work =
        Box<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

    struct Recorder {
        work: Work,
        started: AtomicUsize,
        stopped: AtomicUsize,
        leaders: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new(work: Work) -> Arc<Self> {
            Arc::new(Self {
                work,
                started: AtomicUsize::new(0),
                stopped: AtomicUsize::new(0),
                leaders: Mutex::new(Vec::new()),
            })
        }

        /// Work that runs until told to stop
        fn until_cancelled() -> Arc<Self> {
            Self::new(Box::new(|token: CancellationToken| {
                async move {
                    token.cancelled().await;
                    Ok(())
                }
                .boxed()
            }))
        }
    }

    #[async_trait]
    impl LeaderCallbacks for Recorder {
        async fn on_started_leading(&self, cancel: CancellationToken) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            (self.work)(cancel).await
        }

        async fn on_stopped_leading(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        fn on_new_leader(&self, identity: &str) {
            self.leaders.lock().push(identity.to_string());
        }
    }

    fn fast_config() -> LeaderElectionConfig {
        LeaderElectionConfig {
            lease_duration: Duration::from_secs(10),
            renew_deadline: Duration::from_secs(6),
            retry_period: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn mock_lock() -> MockLeaseLock {
        let mut lock = MockLeaseLock::new();
        lock.expect_identity().return_const("me".to_string());
        lock.expect_describe().return_const("test/lease".to_string());
        lock
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    #[test]
    fn default_timing_is_valid() {
        let config = LeaderElectionConfig::default();
        assert_eq!(config.lease_duration, Duration::from_secs(60));
        assert_eq!(config.renew_deadline, Duration::from_secs(15));
        assert_eq!(config.retry_period, Duration::from_secs(5));
        assert!(config.release_on_cancel);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn renew_deadline_must_be_shorter_than_lease() {
        let config = LeaderElectionConfig {
            renew_deadline: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn retry_period_must_be_shorter_than_renew_deadline() {
        let config = LeaderElectionConfig {
            retry_period: Duration::from_secs(20),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let period = Duration::from_secs(5);
        for _ in 0..100 {
            let d = jittered(period);
            assert!(d >= period && d <= period.mul_f64(1.0 + JITTER_FACTOR));
        }
    }

    // =========================================================================
    // Lifecycle Stories
    // =========================================================================

    /// Story: a lone replica takes the lease, runs until shutdown, then
    /// hands the lease back so a successor does not wait for expiry.
    #[tokio::test(start_paused = true)]
    async fn story_single_replica_leads_until_shutdown_then_releases() {
        let backend = MemoryLeaseBackend::new();
        let elector = LeaderElector::new(
            Arc::new(MemoryLock::new(backend.clone(), "a")),
            fast_config(),
        )
        .unwrap();
        let mut states = elector.subscribe();
        let callbacks = Recorder::until_cancelled();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            canceller.cancel();
        });

        let outcome = elector.run(callbacks.clone(), cancel).await.unwrap();

        assert_eq!(outcome, ElectionOutcome::Cancelled);
        assert_eq!(elector.state(), LeaderState::Released);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), LeaderState::Released);
        assert_eq!(callbacks.started.load(Ordering::SeqCst), 1);
        assert_eq!(callbacks.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(*callbacks.leaders.lock(), vec!["a".to_string()]);
        assert!(backend.holder().is_none(), "lease released on cancel");
    }

    /// Story: with release_on_cancel off the lease is left to expire.
    #[tokio::test(start_paused = true)]
    async fn cancel_without_release_keeps_lease_until_expiry() {
        let mut lock = mock_lock();
        lock.expect_try_acquire()
            .returning(|_| Ok(LeaseObservation::acquired("me")));
        lock.expect_renew().returning(|_| Ok(true));
        lock.expect_release().never();

        let config = LeaderElectionConfig {
            release_on_cancel: false,
            ..fast_config()
        };
        let elector = LeaderElector::new(Arc::new(lock), config).unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let outcome = elector
            .run(Recorder::until_cancelled(), cancel)
            .await
            .unwrap();
        assert_eq!(outcome, ElectionOutcome::Cancelled);
    }

    /// Story: another identity grabs the lease. Work is stopped and the
    /// elector reports the loss without touching the lease.
    #[tokio::test(start_paused = true)]
    async fn story_renewal_rejected_ends_leadership() {
        let mut lock = mock_lock();
        lock.expect_try_acquire()
            .times(1)
            .returning(|_| Ok(LeaseObservation::acquired("me")));
        lock.expect_renew().times(1).returning(|_| Ok(false));
        lock.expect_release().never();

        let elector = LeaderElector::new(Arc::new(lock), fast_config()).unwrap();
        let callbacks = Recorder::until_cancelled();

        let outcome = elector
            .run(callbacks.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ElectionOutcome::LeadershipLost);
        assert_eq!(callbacks.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(elector.state(), LeaderState::Released);
    }

    /// Story: the API server blips. Renewal errors inside the renew deadline
    /// are tolerated; leadership continues once renewal succeeds again.
    #[tokio::test(start_paused = true)]
    async fn renewal_errors_within_deadline_are_tolerated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut lock = mock_lock();
        lock.expect_try_acquire()
            .returning(|_| Ok(LeaseObservation::acquired("me")));
        let counter = calls.clone();
        lock.expect_renew().returning(move |_| {
            // retry period 2s, deadline 6s: fail at 2s, recover at 4s
            if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                Err(Error::leader_election("apiserver unavailable"))
            } else {
                Ok(true)
            }
        });
        lock.expect_release().times(1).returning(|| Ok(()));

        let elector = LeaderElector::new(Arc::new(lock), fast_config()).unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(13)).await;
            canceller.cancel();
        });

        let outcome = elector
            .run(Recorder::until_cancelled(), cancel)
            .await
            .unwrap();
        assert_eq!(outcome, ElectionOutcome::Cancelled);
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_renewal_errors_lose_leadership_after_deadline() {
        let mut lock = mock_lock();
        lock.expect_try_acquire()
            .returning(|_| Ok(LeaseObservation::acquired("me")));
        lock.expect_renew()
            .returning(|_| Err(Error::leader_election("apiserver unavailable")));
        lock.expect_release().never();

        let elector = LeaderElector::new(Arc::new(lock), fast_config()).unwrap();
        let start = Instant::now();
        let outcome = elector
            .run(Recorder::until_cancelled(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ElectionOutcome::LeadershipLost);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    /// Renews through a [`MemoryLock`] but stalls: the first renewal fails
    /// after 12s, every later one never answers.
    struct StallingLock {
        inner: MemoryLock,
        renewals: AtomicUsize,
    }

    #[async_trait]
    impl LeaseLock for StallingLock {
        fn identity(&self) -> String {
            self.inner.identity()
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }

        async fn try_acquire(&self, lease_duration: Duration) -> Result<LeaseObservation> {
            self.inner.try_acquire(lease_duration).await
        }

        async fn renew(&self, _lease_duration: Duration) -> Result<bool> {
            if self.renewals.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(12)).await;
                return Err(Error::leader_election("apiserver unavailable"));
            }
            futures::future::pending().await
        }

        async fn release(&self) -> Result<()> {
            self.inner.release().await
        }
    }

    /// Story: renewals stall against a slow API server. The leader must
    /// step down within the renew deadline, well before its lease expires,
    /// so the standby that takes over never works alongside it.
    #[tokio::test(start_paused = true)]
    async fn story_stalled_renewals_step_down_before_lease_expires() {
        let config = LeaderElectionConfig {
            lease_duration: Duration::from_secs(30),
            renew_deadline: Duration::from_secs(15),
            retry_period: Duration::from_secs(2),
            ..Default::default()
        };
        let backend = MemoryLeaseBackend::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tracked = |active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>| {
            Recorder::new(Box::new(move |token: CancellationToken| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    token.cancelled().await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }))
        };

        let a = LeaderElector::new(
            Arc::new(StallingLock {
                inner: MemoryLock::new(backend.clone(), "a"),
                renewals: AtomicUsize::new(0),
            }),
            config.clone(),
        )
        .unwrap();
        let b = LeaderElector::new(Arc::new(MemoryLock::new(backend.clone(), "b")), config.clone())
            .unwrap();

        let start = Instant::now();
        let a_callbacks = tracked(active.clone(), peak.clone());
        let a_task = tokio::spawn(async move {
            let outcome = a.run(a_callbacks, CancellationToken::new()).await;
            (outcome, start.elapsed())
        });
        while backend.holder().as_deref() != Some("a") {
            tokio::task::yield_now().await;
        }

        // b contends from the start but cannot win before a's lease expires
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(40)).await;
            canceller.cancel();
        });
        let b_outcome = b
            .run(tracked(active.clone(), peak.clone()), cancel)
            .await
            .unwrap();

        let (a_outcome, a_stopped_at) = a_task.await.unwrap();
        assert_eq!(a_outcome.unwrap(), ElectionOutcome::LeadershipLost);
        assert!(a_stopped_at <= config.renew_deadline);
        assert_eq!(b_outcome, ElectionOutcome::Cancelled);
        assert_eq!(peak.load(Ordering::SeqCst), 1, "never two leaders at work");
        assert_eq!(backend.transitions(), 1, "b took over the expired lease");
    }

    /// Story: shutdown must not hand the lease to a standby while the
    /// leader's workers are still draining.
    #[tokio::test(start_paused = true)]
    async fn story_lease_released_only_after_work_exits() {
        let backend = MemoryLeaseBackend::new();
        let held_at_exit = Arc::new(AtomicBool::new(false));

        let observer = backend.clone();
        let flag = held_at_exit.clone();
        let callbacks = Recorder::new(Box::new(move |token: CancellationToken| {
            let observer = observer.clone();
            let flag = flag.clone();
            async move {
                token.cancelled().await;
                // slow drain
                tokio::time::sleep(Duration::from_secs(3)).await;
                flag.store(observer.holder().as_deref() == Some("a"), Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }));

        let elector =
            LeaderElector::new(Arc::new(MemoryLock::new(backend.clone(), "a")), fast_config())
                .unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        elector.run(callbacks, cancel).await.unwrap();

        assert!(held_at_exit.load(Ordering::SeqCst), "lease still held while draining");
        assert!(backend.holder().is_none(), "lease released after drain");
    }

    /// Story: the controller fails to start (cache never syncs). Leadership
    /// ends, the lease is returned, and the failure reaches the caller.
    #[tokio::test(start_paused = true)]
    async fn work_failure_releases_lease_and_returns_error() {
        let backend = MemoryLeaseBackend::new();
        let callbacks = Recorder::new(Box::new(|_token: CancellationToken| {
            async { Err(Error::cache_sync("timed out")) }.boxed()
        }));

        let elector =
            LeaderElector::new(Arc::new(MemoryLock::new(backend.clone(), "a")), fast_config())
                .unwrap();
        let err = elector
            .run(callbacks, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CacheSync { .. }));
        assert!(backend.holder().is_none());
    }

    /// Story: a standby watches the current leader, then takes over once
    /// the leader steps down.
    #[tokio::test(start_paused = true)]
    async fn story_standby_takes_over_after_leader_releases() {
        let backend = MemoryLeaseBackend::new();
        let leader = MemoryLock::new(backend.clone(), "a");
        leader.try_acquire(Duration::from_secs(10)).await.unwrap();

        let elector =
            LeaderElector::new(Arc::new(MemoryLock::new(backend.clone(), "b")), fast_config())
                .unwrap();
        let callbacks = Recorder::until_cancelled();
        let cancel = CancellationToken::new();

        let task = {
            let callbacks = callbacks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { elector.run(callbacks, cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(callbacks.started.load(Ordering::SeqCst), 0, "standby while a holds");

        leader.release().await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(callbacks.started.load(Ordering::SeqCst), 1);
        assert_eq!(backend.holder().as_deref(), Some("b"));

        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap(), ElectionOutcome::Cancelled);
        assert_eq!(
            *callbacks.leaders.lock(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resume_after_loss_returns_to_standby() {
        let acquisitions = Arc::new(AtomicUsize::new(0));
        let mut lock = mock_lock();
        let counter = acquisitions.clone();
        lock.expect_try_acquire().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(LeaseObservation::acquired("me"))
        });
        lock.expect_renew().returning(|_| Ok(false));
        lock.expect_release().returning(|| Ok(()));

        let config = LeaderElectionConfig {
            resume_after_loss: true,
            ..fast_config()
        };
        let elector = LeaderElector::new(Arc::new(lock), config).unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let outcome = elector
            .run(Recorder::until_cancelled(), cancel)
            .await
            .unwrap();
        assert_eq!(outcome, ElectionOutcome::Cancelled);
        assert!(acquisitions.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn cancelled_before_acquire_never_leads() {
        let mut lock = mock_lock();
        lock.expect_try_acquire().never();
        let elector = LeaderElector::new(Arc::new(lock), fast_config()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let callbacks = Recorder::until_cancelled();
        let outcome = elector.run(callbacks.clone(), cancel).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::Cancelled);
        assert_eq!(callbacks.started.load(Ordering::SeqCst), 0);
        assert_eq!(elector.state(), LeaderState::Standby);
    }
}
