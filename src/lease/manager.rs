//! CRUD and ownership transitions over per-partition lease documents.
//!
//! Every mutation is an etag-conditional replace against the lease store, so
//! concurrent hosts are linearized by the store. `LeaseLost` is the sentinel
//! result: it means another host owns the partition now and the caller must
//! stop immediately without releasing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::clients::LeaseStoreClient;
use crate::constants::LEASE_ID_SEPARATOR;
use crate::error::{FeedError, FeedResult};
use crate::metrics;
use crate::types::ContinuationToken;

use super::Lease;

/// Result of a conditional lease creation.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(Lease),
    AlreadyExists,
}

/// Manages per-partition lease records for one host.
pub struct LeaseManager {
    client: Arc<dyn LeaseStoreClient>,
    prefix: String,
    host_name: String,
    expiration_interval: Duration,
}

impl LeaseManager {
    pub fn new(
        client: Arc<dyn LeaseStoreClient>,
        prefix: impl Into<String>,
        host_name: impl Into<String>,
        expiration_interval: Duration,
    ) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            host_name: host_name.into(),
            expiration_interval,
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn expiration_interval(&self) -> Duration {
        self.expiration_interval
    }

    fn document_id(&self, partition_id: &str) -> String {
        Lease::document_id(&self.prefix, partition_id)
    }

    /// List every lease in the collection, ordered by partition id.
    ///
    /// The reserved `.info`/`.lock` documents are outside the
    /// `{prefix}..` namespace and never show up here.
    pub async fn list_all(&self) -> FeedResult<Vec<Lease>> {
        let list_prefix = format!("{}{}", self.prefix, LEASE_ID_SEPARATOR);
        let docs = self.client.list_prefix(&list_prefix).await?;
        let mut leases = Vec::with_capacity(docs.len());
        for doc in &docs {
            match Lease::from_document(doc) {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    // A malformed document is a foreign object in our
                    // namespace; skip it rather than wedge the balancer.
                    warn!(document_id = %doc.id, error = %e, "Skipping unparsable lease document");
                }
            }
        }
        Ok(leases)
    }

    /// List leases currently owned by `host`.
    pub async fn list_owned_by(&self, host: &str) -> FeedResult<Vec<Lease>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|l| l.is_owned_by(host))
            .collect())
    }

    /// Conditionally create an unowned lease for a partition.
    pub async fn create_if_absent(
        &self,
        partition_id: &str,
        continuation_token: Option<&ContinuationToken>,
    ) -> FeedResult<CreateOutcome> {
        let id = self.document_id(partition_id);
        let body = Lease::new_body(partition_id, continuation_token);
        match self.client.create(&id, body, None).await {
            Ok(doc) => {
                metrics::record_lease_operation("create", "success");
                debug!(partition_id, "Created lease");
                Ok(CreateOutcome::Created(Lease::from_document(&doc)?))
            }
            Err(e) if e.is_conflict() => Ok(CreateOutcome::AlreadyExists),
            Err(e) => {
                metrics::record_lease_operation("create", "error");
                Err(e)
            }
        }
    }

    /// Take ownership of a lease.
    ///
    /// Read-modify-write guarded by the lease's etag. On conflict the
    /// document is re-read and the write retried at most once if the lease is
    /// still ownable by this host (expired, unowned, or already ours);
    /// otherwise the acquisition surfaces `LeaseLost`.
    pub async fn acquire(&self, lease: &Lease) -> FeedResult<Lease> {
        let id = self.document_id(&lease.partition_id);
        let mut current = lease.clone();

        for attempt in 0..2 {
            let mut next = current.clone();
            next.owner = Some(self.host_name.clone());
            match self.client.replace(&id, next.to_body(), &current.etag).await {
                Ok(doc) => {
                    metrics::record_lease_operation("acquire", "success");
                    debug!(partition_id = %lease.partition_id, "Acquired lease");
                    return Lease::from_document(&doc);
                }
                Err(e) if matches!(e, FeedError::PreconditionFailed(_)) && attempt == 0 => {
                    let fresh = self.read_lease(&lease.partition_id).await?;
                    let ownable = fresh.is_owned_by(&self.host_name)
                        || fresh.is_expired(self.expiration_interval, Utc::now());
                    if ownable {
                        current = fresh;
                        continue;
                    }
                    metrics::record_lease_operation("acquire", "lost");
                    return Err(self.lease_lost(&lease.partition_id));
                }
                Err(e) if matches!(e, FeedError::PreconditionFailed(_) | FeedError::NotFound(_)) => {
                    metrics::record_lease_operation("acquire", "lost");
                    return Err(self.lease_lost(&lease.partition_id));
                }
                Err(e) => {
                    metrics::record_lease_operation("acquire", "error");
                    return Err(e);
                }
            }
        }
        Err(self.lease_lost(&lease.partition_id))
    }

    /// Refresh a lease's timestamp, proving this host is still alive.
    ///
    /// Tolerates a stale etag as long as the stored owner is still this host
    /// (a concurrent checkpoint on the same partition bumps the etag without
    /// changing ownership).
    pub async fn renew(&self, lease: &Lease) -> FeedResult<Lease> {
        if !lease.is_owned_by(&self.host_name) {
            return Err(self.lease_lost(&lease.partition_id));
        }
        match self.replace_if_still_owned(lease, |_| {}).await {
            Ok(updated) => {
                metrics::record_lease_operation("renew", "success");
                Ok(updated)
            }
            Err(e) => {
                if e.is_lease_lost() {
                    metrics::record_lease_operation("renew", "lost");
                } else {
                    metrics::record_lease_operation("renew", "error");
                }
                Err(e)
            }
        }
    }

    /// Clear the lease's owner so any host may pick it up.
    pub async fn release(&self, lease: &Lease) -> FeedResult<()> {
        let id = self.document_id(&lease.partition_id);
        let mut current = lease.clone();

        for attempt in 0..2 {
            if !current.is_owned_by(&self.host_name) {
                // Someone else took it; nothing of ours to release.
                return Ok(());
            }
            let mut next = current.clone();
            next.owner = None;
            match self.client.replace(&id, next.to_body(), &current.etag).await {
                Ok(_) => {
                    metrics::record_lease_operation("release", "success");
                    debug!(partition_id = %lease.partition_id, "Released lease");
                    return Ok(());
                }
                Err(e) if matches!(e, FeedError::PreconditionFailed(_)) && attempt == 0 => {
                    match self.read_lease(&lease.partition_id).await {
                        Ok(fresh) => current = fresh,
                        Err(e) if e.is_not_found() => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if matches!(e, FeedError::PreconditionFailed(_) | FeedError::NotFound(_)) => {
                    // Lost the race; the lease is no longer ours to clear.
                    return Ok(());
                }
                Err(e) => {
                    metrics::record_lease_operation("release", "error");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Durably advance the lease's continuation token.
    ///
    /// Never called with a token older than the most recently acknowledged
    /// batch; fails with `LeaseLost` when another host owns the lease.
    pub async fn checkpoint(
        &self,
        lease: &Lease,
        continuation_token: &ContinuationToken,
    ) -> FeedResult<Lease> {
        if !lease.is_owned_by(&self.host_name) {
            return Err(self.lease_lost(&lease.partition_id));
        }
        let token = continuation_token.clone();
        match self
            .replace_if_still_owned(lease, move |l| {
                l.continuation_token = Some(token.clone());
            })
            .await
        {
            Ok(updated) => {
                metrics::record_lease_operation("checkpoint", "success");
                Ok(updated)
            }
            Err(e) => {
                if e.is_lease_lost() {
                    metrics::record_lease_operation("checkpoint", "lost");
                } else {
                    metrics::record_lease_operation("checkpoint", "error");
                }
                Err(e)
            }
        }
    }

    /// Replace the opaque key/value bag user code attaches to a lease.
    pub async fn update_properties(
        &self,
        lease: &Lease,
        properties: HashMap<String, String>,
    ) -> FeedResult<Lease> {
        if !lease.is_owned_by(&self.host_name) {
            return Err(self.lease_lost(&lease.partition_id));
        }
        self.replace_if_still_owned(lease, move |l| {
            l.properties = properties.clone();
        })
        .await
    }

    /// Delete a lease document (parent retirement after a split).
    ///
    /// A missing document is success: a concurrent supervisor may have
    /// retired the parent already.
    pub async fn delete(&self, lease: &Lease) -> FeedResult<()> {
        let id = self.document_id(&lease.partition_id);
        match self.client.delete(&id).await {
            Ok(()) => {
                metrics::record_lease_operation("delete", "success");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                metrics::record_lease_operation("delete", "error");
                Err(e)
            }
        }
    }

    async fn read_lease(&self, partition_id: &str) -> FeedResult<Lease> {
        let doc = self.client.read(&self.document_id(partition_id)).await?;
        Lease::from_document(&doc)
    }

    /// Etag-guarded replace that retries once on conflict when the stored
    /// owner is still this host.
    async fn replace_if_still_owned(
        &self,
        lease: &Lease,
        mutate: impl Fn(&mut Lease),
    ) -> FeedResult<Lease> {
        let id = self.document_id(&lease.partition_id);
        let mut current = lease.clone();

        for attempt in 0..2 {
            let mut next = current.clone();
            mutate(&mut next);
            match self.client.replace(&id, next.to_body(), &current.etag).await {
                Ok(doc) => return Lease::from_document(&doc),
                Err(e) if matches!(e, FeedError::PreconditionFailed(_)) && attempt == 0 => {
                    let fresh = match self.read_lease(&lease.partition_id).await {
                        Ok(fresh) => fresh,
                        Err(e) if e.is_not_found() => {
                            return Err(self.lease_lost(&lease.partition_id));
                        }
                        Err(e) => return Err(e),
                    };
                    if !fresh.is_owned_by(&self.host_name) {
                        return Err(self.lease_lost(&lease.partition_id));
                    }
                    current = fresh;
                }
                Err(e) if matches!(e, FeedError::PreconditionFailed(_) | FeedError::NotFound(_)) => {
                    return Err(self.lease_lost(&lease.partition_id));
                }
                Err(e) => return Err(e),
            }
        }
        Err(self.lease_lost(&lease.partition_id))
    }

    fn lease_lost(&self, partition_id: &str) -> FeedError {
        FeedError::LeaseLost {
            partition_id: partition_id.to_string(),
        }
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("prefix", &self.prefix)
            .field("host_name", &self.host_name)
            .field("expiration_interval", &self.expiration_interval)
            .finish_non_exhaustive()
    }
}
