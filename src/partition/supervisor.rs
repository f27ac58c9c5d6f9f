//! Couples a lease renewer with a partition processor for one owned lease.
//!
//! The first terminal outcome wins; the losing task is cancelled and joined.
//! The supervisor then translates the outcome into an observer close reason
//! and a lease disposition: `Split` retires the parent after fanning out to
//! children, `LeaseLost` leaves the lease alone (it belongs to someone else),
//! everything else releases it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::{HealthEvent, HealthEventKind, HealthMonitor, HealthSeverity};
use crate::lease::{LeaseManager, SharedLease};
use crate::observer::{ChangeObserver, ObserverContext};
use crate::partition::synchronizer::PartitionSynchronizer;
use crate::partition::{PartitionProcessor, ProcessorOutcome};
use crate::retry::with_jitter;
use crate::types::CloseReason;

/// Why the renewer task stopped.
#[derive(Debug)]
enum RenewerExit {
    Cancelled,
    LeaseLost,
}

/// Supervises one owned partition: renewer + processor.
pub struct PartitionSupervisor {
    manager: Arc<LeaseManager>,
    synchronizer: Arc<PartitionSynchronizer>,
    observer: Arc<dyn ChangeObserver>,
    context: Arc<ObserverContext>,
    processor: Arc<PartitionProcessor>,
    lease: SharedLease,
    partition_id: String,
    renew_interval: Duration,
    unhealthiness_duration: Duration,
    health: Arc<dyn HealthMonitor>,
    /// Escalation channel for unrecoverable failures; the host surfaces the
    /// first recorded value to its caller.
    fatal: watch::Sender<Option<String>>,
}

impl PartitionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Arc<LeaseManager>,
        synchronizer: Arc<PartitionSynchronizer>,
        observer: Arc<dyn ChangeObserver>,
        context: Arc<ObserverContext>,
        processor: Arc<PartitionProcessor>,
        lease: SharedLease,
        partition_id: String,
        renew_interval: Duration,
        unhealthiness_duration: Duration,
        health: Arc<dyn HealthMonitor>,
        fatal: watch::Sender<Option<String>>,
    ) -> Self {
        Self {
            manager,
            synchronizer,
            observer,
            context,
            processor,
            lease,
            partition_id,
            renew_interval,
            unhealthiness_duration,
            health,
            fatal,
        }
    }

    /// Run until a terminal outcome; returns the close reason delivered to
    /// the observer.
    pub async fn run(self, cancel: CancellationToken) -> CloseReason {
        if let Err(e) = self.observer.open(&self.context).await {
            warn!(partition_id = %self.partition_id, error = %e, "Observer open failed");
            self.report_observer_failure(format!("open failed: {e}")).await;
            let reason = CloseReason::ObserverFailed;
            self.release_lease().await;
            self.close_observer(reason).await;
            return reason;
        }
        debug!(partition_id = %self.partition_id, "Observer opened");

        let renewer_cancel = cancel.child_token();
        let processor_cancel = cancel.child_token();

        let mut renewer_handle = tokio::spawn(Self::renewer_loop(
            self.manager.clone(),
            self.lease.clone(),
            self.partition_id.clone(),
            self.renew_interval,
            self.unhealthiness_duration,
            self.health.clone(),
            renewer_cancel.clone(),
        ));

        let processor = self.processor.clone();
        let proc_cancel = processor_cancel.clone();
        let mut processor_handle =
            tokio::spawn(async move { processor.run(proc_cancel).await });

        let outcome = tokio::select! {
            renewed = &mut renewer_handle => {
                // Renewer finished first: lease lost or cancellation.
                processor_cancel.cancel();
                let processor_outcome = match processor_handle.await {
                    Ok(outcome) => outcome,
                    Err(join_err) => {
                        warn!(partition_id = %self.partition_id, error = %join_err, "Processor task aborted");
                        ProcessorOutcome::ObserverFailed
                    }
                };
                match renewed {
                    Ok(RenewerExit::LeaseLost) => ProcessorOutcome::LeaseLost,
                    Ok(RenewerExit::Cancelled) => processor_outcome,
                    Err(join_err) => {
                        warn!(partition_id = %self.partition_id, error = %join_err, "Renewer task aborted");
                        processor_outcome
                    }
                }
            }
            processed = &mut processor_handle => {
                renewer_cancel.cancel();
                let _ = renewer_handle.await;
                match processed {
                    Ok(outcome) => outcome,
                    Err(join_err) => {
                        // An observer panic surfaces here.
                        warn!(partition_id = %self.partition_id, error = %join_err, "Processor task panicked");
                        self.report_observer_failure(format!("processor panicked: {join_err}"))
                            .await;
                        ProcessorOutcome::ObserverFailed
                    }
                }
            }
        };

        let reason = self.settle(outcome).await;
        self.close_observer(reason).await;
        info!(partition_id = %self.partition_id, reason = %reason, "Partition closed");
        reason
    }

    /// Translate the processor outcome into a close reason and dispose of the
    /// lease accordingly.
    async fn settle(&self, outcome: ProcessorOutcome) -> CloseReason {
        match outcome {
            ProcessorOutcome::Split => {
                let lease = self.lease.lock().await.clone();
                match self.synchronizer.split_parent(&lease).await {
                    Ok(children) => {
                        match self.manager.delete(&lease).await {
                            Ok(()) => info!(
                                partition_id = %self.partition_id,
                                child_count = children.len(),
                                "Parent lease retired after split"
                            ),
                            Err(e) => warn!(
                                partition_id = %self.partition_id,
                                error = %e,
                                "Failed to retire parent lease after split"
                            ),
                        }
                        CloseReason::Split
                    }
                    Err(e) => {
                        // Children could not be materialized; release the
                        // parent so another host retries the split.
                        warn!(partition_id = %self.partition_id, error = %e, "Split handling failed");
                        self.health
                            .report(HealthEvent::new(
                                HealthSeverity::Critical,
                                HealthEventKind::General,
                                Some(self.partition_id.clone()),
                                format!("split handling failed: {e}"),
                            ))
                            .await;
                        self.release_lease().await;
                        CloseReason::Split
                    }
                }
            }
            ProcessorOutcome::LeaseLost => {
                // The lease belongs to someone else now; do not touch it.
                CloseReason::LeaseLost
            }
            ProcessorOutcome::ObserverFailed => {
                self.report_observer_failure("observer failed processing changes".to_string())
                    .await;
                self.release_lease().await;
                CloseReason::ObserverFailed
            }
            ProcessorOutcome::Cancelled => {
                self.release_lease().await;
                CloseReason::Shutdown
            }
            ProcessorOutcome::Fatal(e) => {
                let message = if e.is_fatal() {
                    format!("unrecoverable feed error on partition {}: {e}", self.partition_id)
                } else {
                    format!(
                        "feed error on partition {} escalated to fatal: {e}",
                        self.partition_id
                    )
                };
                self.health
                    .report(HealthEvent::new(
                        HealthSeverity::Critical,
                        HealthEventKind::General,
                        Some(self.partition_id.clone()),
                        message.clone(),
                    ))
                    .await;
                // First fatal wins; the host hands it to its caller.
                self.fatal.send_if_modified(|slot| {
                    if slot.is_none() {
                        *slot = Some(message);
                        true
                    } else {
                        false
                    }
                });
                self.release_lease().await;
                CloseReason::Shutdown
            }
        }
    }

    async fn release_lease(&self) {
        let lease = self.lease.lock().await.clone();
        if let Err(e) = self.manager.release(&lease).await {
            warn!(partition_id = %self.partition_id, error = %e, "Failed to release lease");
        }
    }

    async fn close_observer(&self, reason: CloseReason) {
        if let Err(e) = self.observer.close(&self.context, reason).await {
            warn!(partition_id = %self.partition_id, error = %e, "Observer close failed");
        }
    }

    async fn report_observer_failure(&self, message: String) {
        self.health
            .report(HealthEvent::new(
                HealthSeverity::Warning,
                HealthEventKind::Observer,
                Some(self.partition_id.clone()),
                message,
            ))
            .await;
    }

    /// Renew the lease every `renew_interval` (jittered) until cancellation
    /// or loss. Transient failures retry on the next tick; sustained failure
    /// beyond the unhealthiness window escalates to lease loss.
    async fn renewer_loop(
        manager: Arc<LeaseManager>,
        lease: SharedLease,
        partition_id: String,
        renew_interval: Duration,
        unhealthiness_duration: Duration,
        health: Arc<dyn HealthMonitor>,
        cancel: CancellationToken,
    ) -> RenewerExit {
        let mut failing_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return RenewerExit::Cancelled,
                _ = tokio::time::sleep(with_jitter(renew_interval)) => {}
            }

            // Hold the lease lock across the call so a concurrent checkpoint
            // cannot be clobbered by the renewed record.
            let mut current = lease.lock().await;
            match manager.renew(&current).await {
                Ok(updated) => {
                    *current = updated;
                    failing_since = None;
                    debug!(partition_id = %partition_id, "Renewed lease");
                }
                Err(e) if e.is_lease_lost() => {
                    warn!(partition_id = %partition_id, "Lease lost during renewal");
                    return RenewerExit::LeaseLost;
                }
                Err(e) => {
                    let since = *failing_since.get_or_insert_with(Instant::now);
                    warn!(
                        partition_id = %partition_id,
                        error = %e,
                        failing_for_secs = since.elapsed().as_secs(),
                        "Lease renewal failed, will retry"
                    );
                    if since.elapsed() >= unhealthiness_duration {
                        health
                            .report(HealthEvent::new(
                                HealthSeverity::Critical,
                                HealthEventKind::General,
                                Some(partition_id.clone()),
                                format!(
                                    "lease renewal failing for {}s, treating as lost",
                                    since.elapsed().as_secs()
                                ),
                            ))
                            .await;
                        return RenewerExit::LeaseLost;
                    }
                }
            }
        }
    }
}
