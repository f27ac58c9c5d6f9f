//! Injected client traits for the two remote stores.
//!
//! The processor never talks to a concrete database. Library consumers inject
//! a [`LeaseStoreClient`] (durable lease documents with optimistic
//! concurrency) and a [`ChangeFeedClient`] (the monitored store's change
//! log). Both are assumed thread-safe and internally pooled; the processor
//! adds no locking on top.
//!
//! An in-memory implementation of both traits ships behind the
//! `test-utilities` feature (see [`crate::mock`]).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::FeedResult;
use crate::types::{FeedCursor, FeedResponse, PartitionRange};

/// A document stored in the lease collection.
///
/// `etag` is the store's opaque concurrency token, refreshed on every
/// mutation. `timestamp` is the server time of the last mutation and drives
/// lease expiry.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: String,
    pub etag: String,
    pub timestamp: DateTime<Utc>,
    pub body: serde_json::Value,
}

/// CRUD over named JSON documents in a logical lease collection.
///
/// Error contract:
/// - `create` fails with [`FeedError::Conflict`](crate::FeedError::Conflict)
///   when the id already exists.
/// - `replace` fails with
///   [`FeedError::PreconditionFailed`](crate::FeedError::PreconditionFailed)
///   when `if_match` no longer matches the stored etag.
/// - `read` and `delete` fail with
///   [`FeedError::NotFound`](crate::FeedError::NotFound) for missing ids.
/// - Throttling and connectivity problems surface as
///   [`FeedError::Transient`](crate::FeedError::Transient) or
///   [`FeedError::Throttled`](crate::FeedError::Throttled).
#[async_trait]
pub trait LeaseStoreClient: Send + Sync {
    /// Conditionally create a document. `ttl` asks the store to expire the
    /// document server-side (used for the bootstrap init-lock).
    async fn create(
        &self,
        id: &str,
        body: serde_json::Value,
        ttl: Option<Duration>,
    ) -> FeedResult<StoredDocument>;

    /// Read a document by id.
    async fn read(&self, id: &str) -> FeedResult<StoredDocument>;

    /// Replace a document's body iff the stored etag equals `if_match`.
    async fn replace(
        &self,
        id: &str,
        body: serde_json::Value,
        if_match: &str,
    ) -> FeedResult<StoredDocument>;

    /// Delete a document by id.
    async fn delete(&self, id: &str) -> FeedResult<()>;

    /// List documents whose id starts with `prefix`, ordered by id.
    async fn list_prefix(&self, prefix: &str) -> FeedResult<Vec<StoredDocument>>;
}

/// Read access to the monitored store's partitioned change log.
#[async_trait]
pub trait ChangeFeedClient: Send + Sync {
    /// Read the next batch of changes for one partition.
    ///
    /// Unrecoverable server errors surface as
    /// [`FeedError::Fatal`](crate::FeedError::Fatal); everything the caller
    /// should react to in the read loop is a [`FeedResponse`] variant.
    async fn read_changes(
        &self,
        partition_id: &str,
        cursor: &FeedCursor,
        max_item_count: usize,
    ) -> FeedResult<FeedResponse>;

    /// Enumerate the store's current partitions, paging internally by
    /// `max_batch_size`.
    async fn list_partitions(&self, max_batch_size: usize) -> FeedResult<Vec<PartitionRange>>;

    /// Enumerate the child partitions of a split parent.
    async fn child_partitions(&self, parent_id: &str) -> FeedResult<Vec<PartitionRange>>;
}
