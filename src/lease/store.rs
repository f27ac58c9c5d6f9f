//! Bootstrap marker and advisory init lock.
//!
//! Two reserved documents gate one-time bootstrap of a lease collection:
//! `{prefix}.info` (existence means bootstrap completed) and `{prefix}.lock`
//! (a TTL'd advisory lock so at most one host runs bootstrap at a time).

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::clients::LeaseStoreClient;
use crate::constants::{INIT_LOCK_SUFFIX, STORE_MARKER_SUFFIX};
use crate::error::FeedResult;

/// Single durable marker plus advisory lock for one-time bootstrap.
pub struct LeaseStore {
    client: Arc<dyn LeaseStoreClient>,
    prefix: String,
}

impl LeaseStore {
    pub fn new(client: Arc<dyn LeaseStoreClient>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn marker_id(&self) -> String {
        format!("{}{}", self.prefix, STORE_MARKER_SUFFIX)
    }

    fn lock_id(&self) -> String {
        format!("{}{}", self.prefix, INIT_LOCK_SUFFIX)
    }

    /// True iff the store-marker exists, i.e. bootstrap completed.
    pub async fn is_initialized(&self) -> FeedResult<bool> {
        match self.client.read(&self.marker_id()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Try to create the init-lock with the given TTL.
    ///
    /// Returns `false` when another host already holds the lock. Store
    /// throttling propagates as `Transient`.
    pub async fn acquire_init_lock(&self, ttl: Duration) -> FeedResult<bool> {
        let lock_id = self.lock_id();
        match self
            .client
            .create(&lock_id, serde_json::json!({}), Some(ttl))
            .await
        {
            Ok(_) => {
                debug!(lock_id = %lock_id, ttl_secs = ttl.as_secs(), "Acquired init lock");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create the store-marker. A pre-existing marker is success.
    pub async fn mark_initialized(&self) -> FeedResult<()> {
        match self
            .client
            .create(&self.marker_id(), serde_json::json!({}), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete the init-lock. A missing lock is success.
    pub async fn release_init_lock(&self) -> FeedResult<()> {
        match self.client.delete(&self.lock_id()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for LeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
