//! The per-partition read loop.
//!
//! ```text
//!  Reading ──(batch)──► Dispatching ──(ack)──► Checkpointing ──► Reading
//!     │                     │                      │
//!     │                     │                      └─(etag fail)─► LeaseLost
//!     │                     └─(observer error)─► ObserverFailed
//!     ├─(partition gone)─► Split
//!     └─(cancel)─► Cancelled
//! ```
//!
//! Progress within the loop is the last served continuation token; durable
//! progress is only what was checkpointed. After a failover the new owner
//! resumes from the checkpoint, which is what makes delivery at-least-once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clients::ChangeFeedClient;
use crate::constants::{PROCESSOR_BACKOFF_BASE_MS, PROCESSOR_BACKOFF_MAX_SECS};
use crate::error::{FeedError, FeedResult};
use crate::lease::SharedLease;
use crate::metrics;
use crate::observer::{ChangeObserver, ObserverContext};
use crate::retry::with_jitter;
use crate::types::{
    ChangeBatch, CheckpointFrequency, ContinuationToken, FeedCursor, FeedResponse, StartPosition,
};

/// Why a processor's `run` returned.
#[derive(Debug)]
pub enum ProcessorOutcome {
    /// The partition split; the supervisor fans out to children and retires
    /// the parent.
    Split,
    /// Another host owns the lease; stop without releasing.
    LeaseLost,
    /// The observer failed; stop and release so the batch is retried
    /// elsewhere.
    ObserverFailed,
    /// Cancellation was requested (shutdown or rebalance away).
    Cancelled,
    /// Unrecoverable feed error.
    Fatal(FeedError),
}

/// Read-loop knobs derived from the host configuration.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub max_item_count: usize,
    pub feed_poll_delay: Duration,
    pub checkpoint_frequency: CheckpointFrequency,
    pub start_position: StartPosition,
}

/// Streams one partition's change feed to an observer.
pub struct PartitionProcessor {
    feed: Arc<dyn ChangeFeedClient>,
    observer: Arc<dyn ChangeObserver>,
    context: Arc<ObserverContext>,
    lease: SharedLease,
    partition_id: String,
    settings: ProcessorSettings,
}

impl PartitionProcessor {
    pub fn new(
        feed: Arc<dyn ChangeFeedClient>,
        observer: Arc<dyn ChangeObserver>,
        context: Arc<ObserverContext>,
        lease: SharedLease,
        partition_id: String,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            feed,
            observer,
            context,
            lease,
            partition_id,
            settings,
        }
    }

    /// Run the read loop until a terminal outcome.
    pub async fn run(&self, cancel: CancellationToken) -> ProcessorOutcome {
        let mut cursor = self.initial_cursor().await;
        let mut backoff = Duration::from_millis(PROCESSOR_BACKOFF_BASE_MS);
        let backoff_cap = Duration::from_secs(PROCESSOR_BACKOFF_MAX_SECS);
        let mut batches_since_checkpoint = 0u32;
        let mut last_checkpoint_at = Instant::now();
        // Token of the most recently acknowledged batch that is not yet
        // durable. Never advanced before the observer acks.
        let mut pending: Option<ContinuationToken> = None;

        loop {
            if cancel.is_cancelled() {
                self.final_checkpoint(pending.take()).await;
                return ProcessorOutcome::Cancelled;
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    self.final_checkpoint(pending.take()).await;
                    return ProcessorOutcome::Cancelled;
                }
                r = self.feed.read_changes(&self.partition_id, &cursor, self.settings.max_item_count) => r,
            };

            let response = match response {
                Ok(response) => response,
                Err(e) if e.is_transient() => {
                    let delay = match &e {
                        FeedError::Throttled { retry_after } => *retry_after,
                        _ => with_jitter(backoff),
                    };
                    debug!(
                        partition_id = %self.partition_id,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient read failure, backing off"
                    );
                    backoff = (backoff * 2).min(backoff_cap);
                    if self.sleep_or_cancel(delay, &cancel).await {
                        self.final_checkpoint(pending.take()).await;
                        return ProcessorOutcome::Cancelled;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(partition_id = %self.partition_id, error = %e, "Fatal feed error");
                    return ProcessorOutcome::Fatal(e);
                }
            };
            backoff = Duration::from_millis(PROCESSOR_BACKOFF_BASE_MS);

            match response {
                FeedResponse::PartitionGone => {
                    // Checkpoint acknowledged work first so the child leases
                    // are seeded from the freshest parent token.
                    self.final_checkpoint(pending.take()).await;
                    return ProcessorOutcome::Split;
                }
                FeedResponse::Throttled { retry_after } => {
                    if self.sleep_or_cancel(retry_after, &cancel).await {
                        self.final_checkpoint(pending.take()).await;
                        return ProcessorOutcome::Cancelled;
                    }
                }
                FeedResponse::NotModified { continuation } => {
                    cursor = FeedCursor::Continuation(continuation);
                    if let Some(outcome) = self
                        .maybe_interval_checkpoint(&mut pending, &mut last_checkpoint_at)
                        .await
                    {
                        return outcome;
                    }
                    if self
                        .sleep_or_cancel(self.settings.feed_poll_delay, &cancel)
                        .await
                    {
                        self.final_checkpoint(pending.take()).await;
                        return ProcessorOutcome::Cancelled;
                    }
                }
                FeedResponse::Batch {
                    records,
                    continuation,
                } => {
                    if records.is_empty() {
                        cursor = FeedCursor::Continuation(continuation);
                        if self
                            .sleep_or_cancel(self.settings.feed_poll_delay, &cancel)
                            .await
                        {
                            self.final_checkpoint(pending.take()).await;
                            return ProcessorOutcome::Cancelled;
                        }
                        continue;
                    }

                    let record_count = records.len();
                    let batch = ChangeBatch {
                        partition_id: self.partition_id.clone(),
                        records,
                        continuation: continuation.clone(),
                    };

                    if let Err(e) = self
                        .observer
                        .process_changes(&self.context, batch, &cancel)
                        .await
                    {
                        warn!(
                            partition_id = %self.partition_id,
                            error = %e,
                            "Observer failed processing batch"
                        );
                        return ProcessorOutcome::ObserverFailed;
                    }
                    metrics::record_dispatch(&self.partition_id, record_count);

                    pending = Some(continuation.clone());
                    cursor = FeedCursor::Continuation(continuation);
                    batches_since_checkpoint += 1;

                    if self.checkpoint_due(batches_since_checkpoint, last_checkpoint_at) {
                        match self.checkpoint(&mut pending).await {
                            Ok(()) => {
                                batches_since_checkpoint = 0;
                                last_checkpoint_at = Instant::now();
                            }
                            Err(e) if e.is_lease_lost() => {
                                return ProcessorOutcome::LeaseLost;
                            }
                            Err(e) => {
                                // Keep the token pending and retry the
                                // checkpoint after the next batch.
                                warn!(
                                    partition_id = %self.partition_id,
                                    error = %e,
                                    "Checkpoint failed, will retry"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    async fn initial_cursor(&self) -> FeedCursor {
        match &self.lease.lock().await.continuation_token {
            Some(token) => FeedCursor::Continuation(token.clone()),
            None => self.settings.start_position.initial_cursor(),
        }
    }

    fn checkpoint_due(&self, batches_since: u32, last_at: Instant) -> bool {
        cadence_due(&self.settings.checkpoint_frequency, batches_since, last_at)
    }

    /// Interval-cadence checkpoints also fire while the feed is idle.
    async fn maybe_interval_checkpoint(
        &self,
        pending: &mut Option<ContinuationToken>,
        last_checkpoint_at: &mut Instant,
    ) -> Option<ProcessorOutcome> {
        if pending.is_none() {
            return None;
        }
        if let CheckpointFrequency::EveryInterval(interval) = &self.settings.checkpoint_frequency {
            if last_checkpoint_at.elapsed() >= *interval {
                match self.checkpoint(pending).await {
                    Ok(()) => *last_checkpoint_at = Instant::now(),
                    Err(e) if e.is_lease_lost() => return Some(ProcessorOutcome::LeaseLost),
                    Err(e) => {
                        warn!(
                            partition_id = %self.partition_id,
                            error = %e,
                            "Idle checkpoint failed, will retry"
                        );
                    }
                }
            }
        }
        None
    }

    async fn checkpoint(&self, pending: &mut Option<ContinuationToken>) -> FeedResult<()> {
        let Some(token) = pending.clone() else {
            return Ok(());
        };
        self.context.checkpoint(&token).await?;
        debug!(
            partition_id = %self.partition_id,
            continuation = %token,
            "Checkpointed"
        );
        *pending = None;
        Ok(())
    }

    /// Best-effort checkpoint of acknowledged work on the way out. Skipped
    /// under manual cadence, where the observer owns checkpoint timing.
    async fn final_checkpoint(&self, pending: Option<ContinuationToken>) {
        if self.settings.checkpoint_frequency == CheckpointFrequency::Manual {
            return;
        }
        let mut pending = pending;
        if pending.is_some() {
            if let Err(e) = self.checkpoint(&mut pending).await {
                debug!(
                    partition_id = %self.partition_id,
                    error = %e,
                    "Final checkpoint did not land"
                );
            }
        }
    }

    /// Sleep unless cancelled first; returns true when cancelled.
    async fn sleep_or_cancel(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

/// Whether an automatic checkpoint is due under the given cadence.
fn cadence_due(frequency: &CheckpointFrequency, batches_since: u32, last_at: Instant) -> bool {
    match frequency {
        CheckpointFrequency::EveryBatch => true,
        CheckpointFrequency::EveryBatches(n) => batches_since >= *n,
        CheckpointFrequency::EveryInterval(interval) => last_at.elapsed() >= *interval,
        CheckpointFrequency::Manual => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_batch_is_always_due() {
        assert!(cadence_due(&CheckpointFrequency::EveryBatch, 1, Instant::now()));
        assert!(cadence_due(&CheckpointFrequency::EveryBatch, 0, Instant::now()));
    }

    #[test]
    fn every_n_batches_counts() {
        let freq = CheckpointFrequency::EveryBatches(3);
        assert!(!cadence_due(&freq, 1, Instant::now()));
        assert!(!cadence_due(&freq, 2, Instant::now()));
        assert!(cadence_due(&freq, 3, Instant::now()));
        assert!(cadence_due(&freq, 4, Instant::now()));
    }

    #[test]
    fn every_interval_watches_the_clock() {
        let freq = CheckpointFrequency::EveryInterval(Duration::from_millis(50));
        assert!(!cadence_due(&freq, 100, Instant::now()));
        let past = Instant::now() - Duration::from_millis(100);
        assert!(cadence_due(&freq, 0, past));
    }

    #[test]
    fn manual_is_never_due() {
        assert!(!cadence_due(&CheckpointFrequency::Manual, 1000, Instant::now()));
    }
}
