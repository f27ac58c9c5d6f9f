//! Top-level host: wires the components together and runs the lifecycle.
//!
//! A host bootstraps the lease collection, then balances leases on a periodic
//! tick, supervising one renewer/processor pair per acquired partition.
//! Construction takes an explicit, pre-validated configuration record; there
//! is no builder and no post-hoc validation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::balancer::{BalancingStrategy, EqualPartitionsStrategy, LoadBalancer};
use crate::bootstrap::Bootstrapper;
use crate::clients::{ChangeFeedClient, LeaseStoreClient};
use crate::config::ProcessorConfig;
use crate::error::{FeedError, FeedResult};
use crate::health::{HealthMonitor, LoggingHealthMonitor};
use crate::lease::{LeaseManager, LeaseStore};
use crate::observer::ObserverFactory;
use crate::partition::{
    HealthMonitoredController, PartitionController, PartitionLifecycle, PartitionSynchronizer,
    ProcessorSettings,
};
use crate::retry::with_jitter;

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// A change-feed processor host.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use changeling::{ChangeFeedHost, ProcessorConfig};
/// # async fn example(
/// #     feed: Arc<dyn changeling::ChangeFeedClient>,
/// #     store: Arc<dyn changeling::LeaseStoreClient>,
/// #     factory: Arc<dyn changeling::ObserverFactory>,
/// # ) -> changeling::FeedResult<()> {
/// let config = ProcessorConfig::with_prefix("orders-feed");
/// let host = ChangeFeedHost::new(config, feed, store, factory)?;
/// host.start().await?;
/// // ... run until shutdown ...
/// host.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct ChangeFeedHost {
    host_name: String,
    manager: Arc<LeaseManager>,
    controller: Arc<dyn PartitionLifecycle>,
    balancer: Arc<LoadBalancer>,
    bootstrapper: Bootstrapper,
    health: Arc<dyn HealthMonitor>,
    prune_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    cancel: CancellationToken,
    /// Latest unrecoverable failure recorded by a partition supervisor.
    fatal_rx: watch::Receiver<Option<String>>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    state: AtomicU8,
}

impl ChangeFeedHost {
    /// Create a host with the default health monitor and balancing strategy.
    ///
    /// Fails with `InvalidConfiguration` listing every violation in `config`.
    pub fn new(
        config: ProcessorConfig,
        feed: Arc<dyn ChangeFeedClient>,
        lease_client: Arc<dyn LeaseStoreClient>,
        factory: Arc<dyn ObserverFactory>,
    ) -> FeedResult<Self> {
        config.validate()?;
        let health = Arc::new(LoggingHealthMonitor::new(config.unhealthiness_duration));
        let strategy = Arc::new(EqualPartitionsStrategy::new(
            config.lease_expiration_interval,
            config.min_partition_count,
            config.max_partition_count,
        ));
        Self::with_components(config, feed, lease_client, factory, health, strategy)
    }

    /// Create a host with a custom health monitor and balancing strategy.
    pub fn with_components(
        config: ProcessorConfig,
        feed: Arc<dyn ChangeFeedClient>,
        lease_client: Arc<dyn LeaseStoreClient>,
        factory: Arc<dyn ObserverFactory>,
        health: Arc<dyn HealthMonitor>,
        strategy: Arc<dyn BalancingStrategy>,
    ) -> FeedResult<Self> {
        config.validate()?;
        let host_name = config.resolve_host_name();

        let manager = Arc::new(LeaseManager::new(
            lease_client.clone(),
            config.lease_prefix.clone(),
            host_name.clone(),
            config.lease_expiration_interval,
        ));
        let synchronizer = Arc::new(PartitionSynchronizer::new(
            feed.clone(),
            manager.clone(),
            config.start_position.clone(),
            config.degree_of_parallelism,
            config.query_partitions_max_batch_size,
        ));
        let settings = ProcessorSettings {
            max_item_count: config.max_item_count,
            feed_poll_delay: config.feed_poll_delay,
            checkpoint_frequency: config.checkpoint_frequency.clone(),
            start_position: config.start_position.clone(),
        };
        let (fatal_tx, fatal_rx) = watch::channel(None);
        let controller: Arc<dyn PartitionLifecycle> = Arc::new(HealthMonitoredController::new(
            PartitionController::new(
                manager.clone(),
                synchronizer.clone(),
                feed.clone(),
                factory,
                health.clone(),
                settings,
                config.lease_renew_interval,
                config.unhealthiness_duration,
                fatal_tx,
            ),
            health.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new(
            manager.clone(),
            controller.clone(),
            strategy,
            config.lease_acquire_interval,
        ));
        let prune_interval = config.unhealthiness_duration;
        let bootstrapper = Bootstrapper::new(
            LeaseStore::new(lease_client, config.lease_prefix.clone()),
            synchronizer,
            config,
        );

        let (shutdown_tx, _) = broadcast::channel(4);
        Ok(Self {
            host_name,
            manager,
            controller,
            balancer,
            bootstrapper,
            health,
            prune_interval,
            shutdown_tx,
            cancel: CancellationToken::new(),
            fatal_rx,
            task_handles: Mutex::new(Vec::new()),
            state: AtomicU8::new(STATE_CREATED),
        })
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Partitions this host is currently supervising.
    pub fn owned_partitions(&self) -> Vec<String> {
        self.controller.owned_partitions()
    }

    /// Handle to the lease manager, for inspection and tooling.
    pub fn lease_manager(&self) -> &Arc<LeaseManager> {
        &self.manager
    }

    /// The unrecoverable failure recorded by a partition supervisor, if any.
    ///
    /// Once set it never clears; [`shutdown`](Self::shutdown) returns the
    /// same condition as its error.
    pub fn fatal_error(&self) -> Option<FeedError> {
        self.fatal_rx.borrow().clone().map(FeedError::Fatal)
    }

    /// Wait until a partition supervisor records an unrecoverable failure.
    ///
    /// Transient store and feed problems are retried internally and observer
    /// errors are contained per partition; this resolves only for conditions
    /// the host cannot recover from. Callers typically race this against
    /// their own shutdown signal and stop the host when it fires.
    pub async fn wait_for_fatal(&self) -> FeedError {
        let mut rx = self.fatal_rx.clone();
        match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => FeedError::Fatal(slot.clone().unwrap_or_default()),
            Err(_) => FeedError::Shutdown,
        }
    }

    /// Bootstrap the lease collection (once per fleet), then start balancing.
    pub async fn start(&self) -> FeedResult<()> {
        match self.state.compare_exchange(
            STATE_CREATED,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_RUNNING) => {
                return Err(FeedError::Fatal("host already started".to_string()));
            }
            Err(_) => {
                return Err(FeedError::Fatal(
                    "host cannot be restarted after shutdown".to_string(),
                ));
            }
        }

        info!(host_name = %self.host_name, "Starting change-feed host");
        self.bootstrapper.run(&self.cancel).await?;

        // First pass immediately so a fresh host picks up work without
        // waiting a full acquire interval.
        if let Err(e) = self.balancer.tick().await {
            warn!(error = %e, "Initial balancing tick failed");
        }

        let balancer_handle = self.balancer.clone().start(self.shutdown_tx.subscribe());
        let prune_handle = self.start_prune_loop();

        let mut handles = self.task_handles.lock().await;
        handles.push(balancer_handle);
        handles.push(prune_handle);
        info!(host_name = %self.host_name, "Change-feed host started");
        Ok(())
    }

    /// Periodically age out the health monitor's suppression state.
    fn start_prune_loop(&self) -> JoinHandle<()> {
        let health = self.health.clone();
        let interval = self.prune_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(with_jitter(interval)) => health.prune(),
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Stop balancing, cancel every supervisor, and release owned leases.
    ///
    /// Returns the recorded fatal condition, if a partition supervisor hit
    /// one while the host was running; cleanup still runs to completion.
    pub async fn shutdown(&self) -> FeedResult<()> {
        match self.state.compare_exchange(
            STATE_RUNNING,
            STATE_STOPPED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(_) => {
                return Err(FeedError::Fatal("host is not running".to_string()));
            }
        }

        info!(host_name = %self.host_name, "Shutting down change-feed host");
        self.cancel.cancel();
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.task_handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.controller.shutdown().await?;
        info!(host_name = %self.host_name, "Change-feed host stopped");

        // A recorded supervisor fatal is the one condition the host owes its
        // caller; everything milder was retried or contained internally.
        match self.fatal_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ChangeFeedHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedHost")
            .field("host_name", &self.host_name)
            .finish_non_exhaustive()
    }
}
