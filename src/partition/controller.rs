//! Adds and removes owned partitions, one supervisor per lease.
//!
//! The supervisor map is only mutated by `add`/`remove`/`shutdown` and by the
//! self-removal hook that runs when a supervisor finishes on its own (lease
//! lost, split, observer failure). Supervisors receive non-owning handles to
//! the lease manager and synchronizer; the controller owns the map.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::ChangeFeedClient;
use crate::error::FeedResult;
use crate::health::{HealthEvent, HealthEventKind, HealthMonitor, HealthSeverity};
use crate::lease::{Lease, LeaseManager};
use crate::metrics;
use crate::observer::{ObserverContext, ObserverFactory};
use crate::partition::synchronizer::PartitionSynchronizer;
use crate::partition::{PartitionProcessor, PartitionSupervisor, ProcessorSettings};
use crate::types::CloseReason;

/// Lifecycle operations the balancer drives.
#[async_trait]
pub trait PartitionLifecycle: Send + Sync {
    /// Acquire the lease and start supervising the partition. Acquisition
    /// races (`LeaseLost`, `NotFound`) are dropped silently.
    async fn add(&self, lease: Lease) -> FeedResult<()>;

    /// Stop supervising the partition and release its lease.
    async fn remove(&self, partition_id: &str) -> FeedResult<()>;

    /// Stop supervising everything.
    async fn shutdown(&self) -> FeedResult<()>;

    /// Partitions currently supervised by this host.
    fn owned_partitions(&self) -> Vec<String>;
}

struct SupervisorEntry {
    cancel: CancellationToken,
    join: JoinHandle<CloseReason>,
    generation: u64,
}

/// Maps `partition_id -> supervisor` and owns every component handle the
/// supervisors borrow.
pub struct PartitionController {
    manager: Arc<LeaseManager>,
    synchronizer: Arc<PartitionSynchronizer>,
    feed: Arc<dyn ChangeFeedClient>,
    factory: Arc<dyn ObserverFactory>,
    health: Arc<dyn HealthMonitor>,
    settings: ProcessorSettings,
    renew_interval: Duration,
    unhealthiness_duration: Duration,
    fatal_tx: watch::Sender<Option<String>>,
    supervisors: Arc<DashMap<String, SupervisorEntry>>,
    generations: AtomicU64,
}

impl PartitionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Arc<LeaseManager>,
        synchronizer: Arc<PartitionSynchronizer>,
        feed: Arc<dyn ChangeFeedClient>,
        factory: Arc<dyn ObserverFactory>,
        health: Arc<dyn HealthMonitor>,
        settings: ProcessorSettings,
        renew_interval: Duration,
        unhealthiness_duration: Duration,
        fatal_tx: watch::Sender<Option<String>>,
    ) -> Self {
        Self {
            manager,
            synchronizer,
            feed,
            factory,
            health,
            settings,
            renew_interval,
            unhealthiness_duration,
            fatal_tx,
            supervisors: Arc::new(DashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    fn spawn_supervisor(&self, lease: Lease) {
        let partition_id = lease.partition_id.clone();
        let shared = Arc::new(tokio::sync::Mutex::new(lease));
        let observer = self.factory.create(&partition_id);
        let context = Arc::new(ObserverContext::new(
            self.manager.host_name().to_string(),
            partition_id.clone(),
            shared.clone(),
            self.manager.clone(),
        ));
        let processor = Arc::new(PartitionProcessor::new(
            self.feed.clone(),
            observer.clone(),
            context.clone(),
            shared.clone(),
            partition_id.clone(),
            self.settings.clone(),
        ));
        let supervisor = PartitionSupervisor::new(
            self.manager.clone(),
            self.synchronizer.clone(),
            observer,
            context,
            processor,
            shared,
            partition_id.clone(),
            self.renew_interval,
            self.unhealthiness_duration,
            self.health.clone(),
            self.fatal_tx.clone(),
        );

        let cancel = CancellationToken::new();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let supervisors = self.supervisors.clone();
        let map_key = partition_id.clone();
        let run_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            let reason = supervisor.run(run_cancel).await;
            // Self-removal: only evict our own generation so a restarted
            // supervisor under the same key is left alone.
            supervisors.remove_if(&map_key, |_, entry| entry.generation == generation);
            metrics::OWNED_PARTITIONS.set(supervisors.len() as i64);
            reason
        });

        self.supervisors.insert(
            partition_id.clone(),
            SupervisorEntry {
                cancel,
                join,
                generation,
            },
        );
        metrics::OWNED_PARTITIONS.set(self.supervisors.len() as i64);
        info!(partition_id = %partition_id, "Supervisor started");
    }

    async fn stop_entry(&self, partition_id: &str, entry: SupervisorEntry) {
        entry.cancel.cancel();
        // A supervisor must fully exit within two renew intervals of
        // cancellation.
        let deadline = self.renew_interval * 2;
        match timeout(deadline, entry.join).await {
            Ok(Ok(reason)) => {
                debug!(partition_id, reason = %reason, "Supervisor stopped")
            }
            Ok(Err(e)) => warn!(partition_id, error = %e, "Supervisor task failed"),
            Err(_) => warn!(
                partition_id,
                deadline_secs = deadline.as_secs(),
                "Supervisor did not stop within deadline"
            ),
        }
        metrics::OWNED_PARTITIONS.set(self.supervisors.len() as i64);
    }
}

#[async_trait]
impl PartitionLifecycle for PartitionController {
    async fn add(&self, lease: Lease) -> FeedResult<()> {
        if self.supervisors.contains_key(&lease.partition_id) {
            return Ok(());
        }

        let acquired = match self.manager.acquire(&lease).await {
            Ok(acquired) => acquired,
            Err(e) if e.is_lease_lost() || e.is_not_found() => {
                debug!(
                    partition_id = %lease.partition_id,
                    error = %e,
                    "Acquisition lost the race, skipping"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.spawn_supervisor(acquired);
        Ok(())
    }

    async fn remove(&self, partition_id: &str) -> FeedResult<()> {
        let Some((_, entry)) = self.supervisors.remove(partition_id) else {
            return Ok(());
        };
        self.stop_entry(partition_id, entry).await;
        Ok(())
    }

    async fn shutdown(&self) -> FeedResult<()> {
        let keys: Vec<String> = self
            .supervisors
            .iter()
            .map(|e| e.key().clone())
            .collect();
        info!(partition_count = keys.len(), "Controller shutting down");

        let stops = keys.iter().filter_map(|key| {
            self.supervisors
                .remove(key)
                .map(|(_, entry)| self.stop_entry(key, entry))
        });
        join_all(stops).await;
        Ok(())
    }

    fn owned_partitions(&self) -> Vec<String> {
        self.supervisors.iter().map(|e| e.key().clone()).collect()
    }
}

/// Decorates a controller with typed health events around add/remove.
pub struct HealthMonitoredController<C: PartitionLifecycle> {
    inner: C,
    health: Arc<dyn HealthMonitor>,
}

impl<C: PartitionLifecycle> HealthMonitoredController<C> {
    pub fn new(inner: C, health: Arc<dyn HealthMonitor>) -> Self {
        Self { inner, health }
    }
}

#[async_trait]
impl<C: PartitionLifecycle> PartitionLifecycle for HealthMonitoredController<C> {
    async fn add(&self, lease: Lease) -> FeedResult<()> {
        let partition_id = lease.partition_id.clone();
        match self.inner.add(lease).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.health
                    .report(HealthEvent::new(
                        HealthSeverity::Warning,
                        HealthEventKind::AcquireLeaseFailure,
                        Some(partition_id),
                        format!("failed to add partition: {e}"),
                    ))
                    .await;
                Err(e)
            }
        }
    }

    async fn remove(&self, partition_id: &str) -> FeedResult<()> {
        match self.inner.remove(partition_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.health
                    .report(HealthEvent::new(
                        HealthSeverity::Warning,
                        HealthEventKind::ReleaseLeaseFailure,
                        Some(partition_id.to_string()),
                        format!("failed to remove partition: {e}"),
                    ))
                    .await;
                Err(e)
            }
        }
    }

    async fn shutdown(&self) -> FeedResult<()> {
        match self.inner.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.health
                    .report(HealthEvent::new(
                        HealthSeverity::Critical,
                        HealthEventKind::General,
                        None,
                        format!("controller shutdown failed: {e}"),
                    ))
                    .await;
                Err(e)
            }
        }
    }

    fn owned_partitions(&self) -> Vec<String> {
        self.inner.owned_partitions()
    }
}
