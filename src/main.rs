//! crd-controller - reconciles UnitedDeployments into Deployments

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::watcher;
use kube::{Api, Client, CustomResourceExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crd_controller::config::{ControllerConfig, DEFAULT_CACHE_SYNC_POLL_INTERVAL, DEFAULT_WORKERS};
use crd_controller::controller::Controller;
use crd_controller::crd::{ControllerKinds, UnitedDeployment};
use crd_controller::events::KubeEventPublisher;
use crd_controller::informer::{
    watch_stream, CacheSynced, SharedInformer, DEFAULT_RESYNC_PERIOD,
};
use crd_controller::leader::{
    ElectionOutcome, KubeLeaseLock, LeaderCallbacks, LeaderElectionConfig, LeaderElector,
    DEFAULT_LEASE_DURATION, DEFAULT_RENEW_DEADLINE, DEFAULT_RETRY_PERIOD,
};
use crd_controller::queue::WorkQueue;
use crd_controller::reconcile::{KubeResourceStore, UnitedDeploymentReconciler};
use crd_controller::router::EventRouter;
use crd_controller::signals::setup_signal_handler;
use crd_controller::telemetry::{init_tracing, TelemetryConfig};
use crd_controller::{Error, CONTROLLER_NAME};

/// crd-controller - leader-elected UnitedDeployment controller
#[derive(Parser, Debug)]
#[command(name = "crd-controller", version, about, long_about = None)]
struct Cli {
    /// Print the UnitedDeployment CRD as YAML and exit
    #[arg(long)]
    crd: bool,

    /// Name of the Lease used for leader election
    #[arg(long, env = "LEASE_LOCK_NAME", default_value = "crd-controller")]
    lease_lock_name: String,

    /// Namespace of the Lease used for leader election
    #[arg(long, env = "LEASE_LOCK_NAMESPACE", default_value = "default")]
    lease_lock_namespace: String,

    /// Identity of this replica; defaults to `crd-controller-<uuid>`
    #[arg(long, env = "LEASE_LOCK_ID")]
    lease_lock_id: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Seconds a lease stays valid without renewal
    #[arg(long, default_value_t = DEFAULT_LEASE_DURATION.as_secs())]
    lease_duration_secs: u64,

    /// Seconds the leader keeps retrying a failing renewal
    #[arg(long, default_value_t = DEFAULT_RENEW_DEADLINE.as_secs())]
    renew_deadline_secs: u64,

    /// Seconds between acquisition and renewal attempts
    #[arg(long, default_value_t = DEFAULT_RETRY_PERIOD.as_secs())]
    retry_period_secs: u64,

    /// Seconds between informer resyncs; 0 disables resync
    #[arg(long, default_value_t = DEFAULT_RESYNC_PERIOD.as_secs())]
    resync_period_secs: u64,

    /// Seconds to wait for caches to sync before giving up
    #[arg(long, default_value_t = 120)]
    cache_sync_timeout_secs: u64,

    /// Run without leader election (single replica only)
    #[arg(long)]
    no_leader_elect: bool,

    /// Emit JSON log lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn identity(&self) -> String {
        self.lease_lock_id
            .clone()
            .unwrap_or_else(|| format!("crd-controller-{}", uuid::Uuid::new_v4()))
    }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            cache_sync_poll_interval: DEFAULT_CACHE_SYNC_POLL_INTERVAL,
        }
    }

    fn election_config(&self) -> LeaderElectionConfig {
        LeaderElectionConfig {
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_deadline: Duration::from_secs(self.renew_deadline_secs),
            retry_period: Duration::from_secs(self.retry_period_secs),
            ..Default::default()
        }
    }

    fn resync_period(&self) -> Option<Duration> {
        (self.resync_period_secs > 0).then(|| Duration::from_secs(self.resync_period_secs))
    }
}

/// Everything the leader runs: informers, router and worker pool
struct Engine {
    client: Client,
    kinds: ControllerKinds,
    identity: String,
    config: ControllerConfig,
    resync_period: Option<Duration>,
}

impl Engine {
    async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let queue = WorkQueue::new(CONTROLLER_NAME);
        let owners = Arc::new(SharedInformer::<UnitedDeployment>::new(
            self.kinds.owner.kind.clone(),
            self.resync_period,
        ));
        let deployments = Arc::new(SharedInformer::<Deployment>::new(
            self.kinds.derived.kind.clone(),
            self.resync_period,
        ));

        let router = Arc::new(EventRouter::new(
            queue.clone(),
            owners.store(),
            self.kinds.owner.clone(),
        ));
        owners.add_event_handler(router.owner_handler());
        deployments.add_event_handler(router.derived_handler::<Deployment>());

        let reconciler = Arc::new(UnitedDeploymentReconciler::new(
            owners.store(),
            deployments.store(),
            Arc::new(KubeResourceStore::new(self.client.clone())),
            Arc::new(KubeEventPublisher::new(
                self.client.clone(),
                CONTROLLER_NAME,
                Some(self.identity.clone()),
            )),
        ));

        let caches = vec![
            owners.clone() as Arc<dyn CacheSynced>,
            deployments.clone() as Arc<dyn CacheSynced>,
        ];
        let controller = Controller::new(
            CONTROLLER_NAME,
            queue,
            reconciler,
            caches,
            self.config.clone(),
        );

        let informer_token = cancel.child_token();
        let mut informers = JoinSet::new();
        {
            let token = informer_token.clone();
            let api: Api<UnitedDeployment> = Api::all(self.client.clone());
            let informer = Arc::clone(&owners);
            informers.spawn(async move {
                informer
                    .run(watch_stream(api, watcher::Config::default()), token)
                    .await
            });
        }
        {
            let token = informer_token.clone();
            let api: Api<Deployment> = Api::all(self.client.clone());
            let informer = Arc::clone(&deployments);
            informers.spawn(async move {
                informer
                    .run(watch_stream(api, watcher::Config::default()), token)
                    .await
            });
        }

        let result = controller.run(cancel.clone()).await;

        informer_token.cancel();
        while let Some(joined) = informers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Informer task failed");
            }
        }

        match result {
            Err(e) if cancel.is_cancelled() => {
                warn!(error = %e, "Controller stopped before it finished starting");
                Ok(())
            }
            other => other,
        }
    }
}

#[async_trait]
impl LeaderCallbacks for Engine {
    async fn on_started_leading(&self, cancel: CancellationToken) -> Result<(), Error> {
        self.run(cancel).await
    }

    async fn on_stopped_leading(&self) {
        info!(identity = %self.identity, "Stopped leading");
    }

    fn on_new_leader(&self, identity: &str) {
        if identity != self.identity {
            info!(leader = %identity, "New leader elected");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&UnitedDeployment::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_tracing(TelemetryConfig { json: cli.log_json })?;

    let config = cli.controller_config();
    config.validate()?;
    let election = cli.election_config();
    election.validate()?;

    let kinds = ControllerKinds::register();
    let cancel = setup_signal_handler()?;
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let identity = cli.identity();
    let engine = Arc::new(Engine {
        client: client.clone(),
        kinds,
        identity: identity.clone(),
        config,
        resync_period: cli.resync_period(),
    });

    if cli.no_leader_elect {
        info!("Leader election disabled, starting controller");
        engine.run(cancel).await?;
        info!("Controller stopped");
        return Ok(());
    }

    let lock = Arc::new(KubeLeaseLock::new(
        client,
        &cli.lease_lock_namespace,
        &cli.lease_lock_name,
        &identity,
    ));
    let elector = LeaderElector::new(lock, election)?;

    match elector.run(engine, cancel).await? {
        ElectionOutcome::LeadershipLost => {
            // a demoted replica must not keep serving; restart from scratch
            info!(identity = %identity, "Leader lost, exiting");
            std::process::exit(0);
        }
        ElectionOutcome::Cancelled | ElectionOutcome::WorkFinished => {
            info!(identity = %identity, "Controller stopped");
            Ok(())
        }
    }
}
