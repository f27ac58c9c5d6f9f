//! The user-facing observer interface.
//!
//! For each partition a host owns, the processor invokes exactly one
//! observer: `open` once, `process_changes` serially per batch, `close` once
//! with the reason. Observers never see concurrent calls for the same
//! partition; calls for different partitions run concurrently, so shared
//! observer state must be thread-safe.
//!
//! Delivery is at-least-once: a batch whose processing fails (or whose
//! checkpoint never lands before a failover) is redelivered, possibly on
//! another host.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::FeedResult;
use crate::lease::{LeaseManager, SharedLease};
use crate::types::{ChangeBatch, CloseReason, ContinuationToken};

/// Per-partition context handed to every observer callback.
pub struct ObserverContext {
    host_name: String,
    partition_id: String,
    lease: SharedLease,
    manager: Arc<LeaseManager>,
}

impl ObserverContext {
    pub(crate) fn new(
        host_name: String,
        partition_id: String,
        lease: SharedLease,
        manager: Arc<LeaseManager>,
    ) -> Self {
        Self {
            host_name,
            partition_id,
            lease,
            manager,
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// The last durably checkpointed continuation token, if any.
    pub async fn continuation_token(&self) -> Option<ContinuationToken> {
        self.lease.lock().await.continuation_token.clone()
    }

    /// The opaque key/value bag attached to the partition's lease.
    pub async fn properties(&self) -> HashMap<String, String> {
        self.lease.lock().await.properties.clone()
    }

    /// Durably advance the partition's checkpoint to `token`.
    ///
    /// This is how observers checkpoint under
    /// [`CheckpointFrequency::Manual`](crate::types::CheckpointFrequency::Manual);
    /// it is also allowed under automatic cadences for early checkpoints.
    /// Fails with `LeaseLost` when another host owns the partition.
    pub async fn checkpoint(&self, token: &ContinuationToken) -> FeedResult<()> {
        let mut lease = self.lease.lock().await;
        let updated = self.manager.checkpoint(&lease, token).await?;
        *lease = updated;
        Ok(())
    }

    /// Replace the lease's property bag.
    pub async fn update_properties(&self, properties: HashMap<String, String>) -> FeedResult<()> {
        let mut lease = self.lease.lock().await;
        let updated = self.manager.update_properties(&lease, properties).await?;
        *lease = updated;
        Ok(())
    }
}

impl std::fmt::Debug for ObserverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverContext")
            .field("host_name", &self.host_name)
            .field("partition_id", &self.partition_id)
            .finish_non_exhaustive()
    }
}

/// User-supplied consumer of change batches for one partition.
#[async_trait]
pub trait ChangeObserver: Send + Sync {
    /// Called once when the host takes over the partition, before any batch.
    async fn open(&self, context: &ObserverContext) -> FeedResult<()>;

    /// Called serially for each batch of changes.
    ///
    /// Returning an error stops the partition's processor with
    /// `ObserverFailed`; the lease is released so the batch is redelivered,
    /// possibly on another host. `cancel` fires when the host is shutting
    /// down or losing the partition; long-running observers should abandon
    /// work promptly when it does.
    async fn process_changes(
        &self,
        context: &ObserverContext,
        batch: ChangeBatch,
        cancel: &CancellationToken,
    ) -> FeedResult<()>;

    /// Called exactly once after the final batch, with the reason.
    async fn close(&self, context: &ObserverContext, reason: CloseReason) -> FeedResult<()>;
}

/// Creates one observer per owned partition.
pub trait ObserverFactory: Send + Sync {
    fn create(&self, partition_id: &str) -> Arc<dyn ChangeObserver>;
}

/// Blanket factory for closures: `Arc::new(|partition: &str| ...)`.
impl<F> ObserverFactory for F
where
    F: Fn(&str) -> Arc<dyn ChangeObserver> + Send + Sync,
{
    fn create(&self, partition_id: &str) -> Arc<dyn ChangeObserver> {
        self(partition_id)
    }
}
