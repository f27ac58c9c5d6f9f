//! Keeps the lease set in sync with the monitored store's partitions.
//!
//! Creation is always conditional and deletion is explicit, so every
//! operation here tolerates concurrent runners on other hosts.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::clients::ChangeFeedClient;
use crate::error::{FeedError, FeedResult};
use crate::lease::{CreateOutcome, Lease, LeaseManager};
use crate::retry::with_feed_policy;
use crate::types::{PartitionRange, StartPosition};

/// Enumerates partitions, materializes missing leases, and fans a split
/// parent out into child leases.
pub struct PartitionSynchronizer {
    feed: Arc<dyn ChangeFeedClient>,
    leases: Arc<LeaseManager>,
    start_position: StartPosition,
    degree_of_parallelism: usize,
    query_partitions_max_batch_size: usize,
}

impl PartitionSynchronizer {
    pub fn new(
        feed: Arc<dyn ChangeFeedClient>,
        leases: Arc<LeaseManager>,
        start_position: StartPosition,
        degree_of_parallelism: usize,
        query_partitions_max_batch_size: usize,
    ) -> Self {
        Self {
            feed,
            leases,
            start_position,
            degree_of_parallelism: degree_of_parallelism.max(1),
            query_partitions_max_batch_size,
        }
    }

    /// Current partitions of the monitored store.
    pub async fn list_partitions(&self) -> FeedResult<Vec<PartitionRange>> {
        let feed = &self.feed;
        let page_size = self.query_partitions_max_batch_size;
        with_feed_policy(
            || async move { feed.list_partitions(page_size).await },
            FeedError::is_transient,
        )
        .await
    }

    /// Create a lease for every current partition that does not have one.
    ///
    /// Creation is `create_if_absent`, so concurrent runners cannot produce
    /// duplicates. Returns the number of leases this runner created.
    pub async fn create_missing_leases(&self) -> FeedResult<usize> {
        let partitions = self.list_partitions().await?;
        let existing: HashSet<String> = self
            .leases
            .list_all()
            .await?
            .into_iter()
            .map(|l| l.partition_id)
            .collect();

        let missing: Vec<&PartitionRange> = partitions
            .iter()
            .filter(|range| !existing.contains(&range.id))
            .collect();

        if missing.is_empty() {
            debug!(
                partition_count = partitions.len(),
                "All partitions already have leases"
            );
            return Ok(0);
        }

        let seed = self.start_position.seed_token();
        let mut created = 0usize;
        for chunk in missing.chunks(self.degree_of_parallelism) {
            let creations = chunk
                .iter()
                .map(|range| self.leases.create_if_absent(&range.id, seed));
            for outcome in join_all(creations).await {
                match outcome? {
                    CreateOutcome::Created(lease) => {
                        debug!(partition_id = %lease.partition_id, "Materialized lease");
                        created += 1;
                    }
                    CreateOutcome::AlreadyExists => {}
                }
            }
        }

        info!(
            created,
            partition_count = partitions.len(),
            "Created missing leases"
        );
        Ok(created)
    }

    /// Materialize child leases for a split parent, each seeded with the
    /// parent's continuation token.
    ///
    /// Returns the child leases this runner created; children that already
    /// exist (a concurrent supervisor won the race) are skipped. Deleting the
    /// parent lease is the caller's responsibility once the children exist.
    pub async fn split_parent(&self, parent: &Lease) -> FeedResult<Vec<Lease>> {
        let feed = &self.feed;
        let parent_id = parent.partition_id.as_str();
        let children = with_feed_policy(
            || async move { feed.child_partitions(parent_id).await },
            FeedError::is_transient,
        )
        .await?;

        if children.is_empty() {
            return Err(FeedError::Fatal(format!(
                "partition {parent_id} reported as split but the store lists no children"
            )));
        }

        info!(
            parent_id,
            child_count = children.len(),
            continuation = parent
                .continuation_token
                .as_ref()
                .map(|t| t.as_str())
                .unwrap_or("<none>"),
            "Materializing child leases after split"
        );

        let mut created = Vec::with_capacity(children.len());
        for child in &children {
            match self
                .leases
                .create_if_absent(&child.id, parent.continuation_token.as_ref())
                .await?
            {
                CreateOutcome::Created(lease) => created.push(lease),
                CreateOutcome::AlreadyExists => {
                    warn!(
                        parent_id,
                        child_id = %child.id,
                        "Child lease already exists, another host handled this split"
                    );
                }
            }
        }
        Ok(created)
    }
}
