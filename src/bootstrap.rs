//! One-time lease-set bootstrap, guarded by an advisory lock.
//!
//! Exactly one host creates the initial leases per lease collection. The
//! protocol gates on the store-marker, so it is safe under init-lock TTL
//! expiry races: lease creation is conditional and marking is idempotent.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProcessorConfig;
use crate::error::{FeedError, FeedResult};
use crate::lease::LeaseStore;
use crate::partition::PartitionSynchronizer;
use crate::retry::with_jitter;

/// Ensures the initial set of leases exists exactly once across the fleet.
pub struct Bootstrapper {
    store: LeaseStore,
    synchronizer: Arc<PartitionSynchronizer>,
    config: ProcessorConfig,
}

impl Bootstrapper {
    pub fn new(
        store: LeaseStore,
        synchronizer: Arc<PartitionSynchronizer>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            synchronizer,
            config,
        }
    }

    /// Run until the lease collection is initialized (by us or another host).
    pub async fn run(&self, cancel: &CancellationToken) -> FeedResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(FeedError::Shutdown);
            }
            if self.store.is_initialized().await? {
                debug!("Lease collection already initialized");
                return Ok(());
            }

            if self
                .store
                .acquire_init_lock(self.config.bootstrap_lock_ttl)
                .await?
            {
                info!("Acquired init lock, bootstrapping lease collection");
                let result = self.bootstrap_once().await;
                if let Err(e) = self.store.release_init_lock().await {
                    warn!(error = %e, "Failed to release init lock");
                }
                return result;
            }

            // Another host is bootstrapping; wait and re-check the marker.
            debug!(
                retry_delay_secs = self.config.bootstrap_retry_delay.as_secs(),
                "Init lock held elsewhere, waiting"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(FeedError::Shutdown),
                _ = tokio::time::sleep(with_jitter(self.config.bootstrap_retry_delay)) => {}
            }
        }
    }

    async fn bootstrap_once(&self) -> FeedResult<()> {
        let created = self.synchronizer.create_missing_leases().await?;
        self.store.mark_initialized().await?;
        info!(created, "Lease collection bootstrapped");
        Ok(())
    }
}
