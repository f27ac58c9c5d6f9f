//! Periodic lease balancing across the host fleet.
//!
//! Every tick the balancer reads the global lease set, asks the strategy
//! which leases this host should hold, and drives the controller to match:
//! acquire the new ones, drop the ones no longer targeted. Two balancers
//! making different but locally-fair choices converge within a few ticks;
//! determinism is not required.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FeedError, FeedResult};
use crate::lease::{Lease, LeaseManager};
use crate::partition::PartitionLifecycle;
use crate::retry::{with_jitter, with_store_policy};

/// Picks the leases one host should hold out of the global set.
pub trait BalancingStrategy: Send + Sync {
    fn select_leases_to_take(
        &self,
        host_name: &str,
        all_leases: &[Lease],
        now: DateTime<Utc>,
    ) -> Vec<Lease>;
}

/// Default strategy: converge every host toward `ceil(total / active_hosts)`
/// partitions, bounded by the configured min/max.
///
/// Preference order when taking leases beyond the ones already owned:
/// expired leases first (largest-share owner first, oldest timestamp within
/// an owner), then steal from overloaded hosts, again preferring the largest
/// owner's oldest lease — but never below the victim's own fair share.
pub struct EqualPartitionsStrategy {
    expiration_interval: Duration,
    min_partition_count: usize,
    max_partition_count: usize,
}

impl EqualPartitionsStrategy {
    pub fn new(
        expiration_interval: Duration,
        min_partition_count: usize,
        max_partition_count: usize,
    ) -> Self {
        Self {
            expiration_interval,
            min_partition_count,
            max_partition_count,
        }
    }

    fn upper_bound(&self) -> usize {
        if self.max_partition_count == 0 {
            usize::MAX
        } else {
            self.max_partition_count
        }
    }
}

impl BalancingStrategy for EqualPartitionsStrategy {
    fn select_leases_to_take(
        &self,
        host_name: &str,
        all_leases: &[Lease],
        now: DateTime<Utc>,
    ) -> Vec<Lease> {
        if all_leases.is_empty() {
            return Vec::new();
        }

        let mut mine: Vec<Lease> = Vec::new();
        let mut expired: Vec<Lease> = Vec::new();
        let mut owner_counts: HashMap<String, usize> = HashMap::new();

        for lease in all_leases {
            if lease.is_owned_by(host_name) && !lease.is_expired(self.expiration_interval, now) {
                mine.push(lease.clone());
            } else if lease.is_expired(self.expiration_interval, now) {
                expired.push(lease.clone());
            }
            if !lease.is_expired(self.expiration_interval, now) {
                if let Some(owner) = &lease.owner {
                    *owner_counts.entry(owner.clone()).or_default() += 1;
                }
            }
        }

        let mut hosts: HashSet<&str> = owner_counts.keys().map(String::as_str).collect();
        hosts.insert(host_name);
        let host_count = hosts.len().max(1);
        let target = all_leases.len().div_ceil(host_count);
        let target = target
            .max(self.min_partition_count)
            .min(self.upper_bound());

        debug!(
            host_name,
            total = all_leases.len(),
            hosts = host_count,
            target,
            owned = mine.len(),
            expired = expired.len(),
            "Balancing tick"
        );

        // Keep what we own, up to the target; anything beyond gets dropped by
        // the controller diff.
        mine.truncate(target);
        if mine.len() >= target {
            return mine;
        }
        let mut need = target - mine.len();

        let share_of = |lease: &Lease| {
            lease
                .owner
                .as_ref()
                .and_then(|o| owner_counts.get(o))
                .copied()
                .unwrap_or(0)
        };

        // Expired leases are free to take: prefer the owner hoarding the
        // most, then the stalest lease.
        expired.sort_by(|a, b| {
            share_of(b)
                .cmp(&share_of(a))
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });
        for lease in expired {
            if need == 0 {
                break;
            }
            mine.push(lease);
            need -= 1;
        }
        if need == 0 {
            return mine;
        }

        // Still short: steal from overloaded hosts, never dragging a victim
        // below its own fair share.
        let mut stealable: Vec<Lease> = all_leases
            .iter()
            .filter(|l| {
                !l.is_expired(self.expiration_interval, now)
                    && !l.is_owned_by(host_name)
                    && l.owner
                        .as_ref()
                        .and_then(|o| owner_counts.get(o))
                        .is_some_and(|count| *count > target)
            })
            .cloned()
            .collect();
        stealable.sort_by(|a, b| {
            share_of(b)
                .cmp(&share_of(a))
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });

        let mut taken_from: HashMap<String, usize> = HashMap::new();
        for lease in stealable {
            if need == 0 {
                break;
            }
            let Some(owner) = lease.owner.clone() else {
                continue;
            };
            let owner_count = owner_counts.get(&owner).copied().unwrap_or(0);
            let already_taken = taken_from.get(&owner).copied().unwrap_or(0);
            if owner_count - already_taken <= target {
                continue;
            }
            *taken_from.entry(owner).or_default() += 1;
            mine.push(lease);
            need -= 1;
        }

        mine
    }
}

/// Drives the controller toward the strategy's target on a periodic tick.
pub struct LoadBalancer {
    manager: Arc<LeaseManager>,
    controller: Arc<dyn PartitionLifecycle>,
    strategy: Arc<dyn BalancingStrategy>,
    acquire_interval: Duration,
}

impl LoadBalancer {
    pub fn new(
        manager: Arc<LeaseManager>,
        controller: Arc<dyn PartitionLifecycle>,
        strategy: Arc<dyn BalancingStrategy>,
        acquire_interval: Duration,
    ) -> Self {
        Self {
            manager,
            controller,
            strategy,
            acquire_interval,
        }
    }

    /// One balancing pass: list, select, diff, apply.
    pub async fn tick(&self) -> FeedResult<()> {
        let manager = &self.manager;
        let leases = with_store_policy(
            || async move { manager.list_all().await },
            FeedError::is_transient,
        )
        .await?;

        let target =
            self.strategy
                .select_leases_to_take(self.manager.host_name(), &leases, Utc::now());
        let target_ids: HashSet<&str> = target.iter().map(|l| l.partition_id.as_str()).collect();
        let running = self.controller.owned_partitions();
        let running_ids: HashSet<&str> = running.iter().map(String::as_str).collect();

        for partition_id in &running {
            if !target_ids.contains(partition_id.as_str()) {
                info!(partition_id = %partition_id, "Rebalancing partition away");
                if let Err(e) = self.controller.remove(partition_id).await {
                    warn!(partition_id = %partition_id, error = %e, "Failed to remove partition");
                }
            }
        }

        for lease in target {
            if running_ids.contains(lease.partition_id.as_str()) {
                continue;
            }
            if let Err(e) = self.controller.add(lease).await {
                warn!(error = %e, "Failed to add partition");
            }
        }

        Ok(())
    }

    /// Spawn the tick loop; it stops when the shutdown channel fires.
    pub fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(with_jitter(self.acquire_interval)) => {}
                    _ = shutdown_rx.recv() => {
                        info!("Balancer loop received shutdown signal");
                        break;
                    }
                }
                if let Err(e) = self.tick().await {
                    warn!(error = %e, "Balancing tick failed");
                }
            }
        })
    }
}
