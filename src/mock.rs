//! In-memory lease store and change feed for testing.
//!
//! Full-featured implementations of both injected client traits, plus a
//! counting observer, so the whole host can be exercised without external
//! dependencies.
//!
//! Available when the `test-utilities` feature is enabled, or during unit
//! tests:
//!
//! ```toml
//! [dev-dependencies]
//! changeling = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::clients::{ChangeFeedClient, LeaseStoreClient, StoredDocument};
use crate::error::{FeedError, FeedResult};
use crate::observer::{ChangeObserver, ObserverContext};
use crate::types::{
    ChangeBatch, ChangeRecord, CloseReason, ContinuationToken, FeedCursor, FeedResponse,
    PartitionRange,
};

#[derive(Debug, Clone)]
struct StoredEntry {
    etag: String,
    timestamp: DateTime<Utc>,
    body: serde_json::Value,
    expires_at: Option<Instant>,
}

/// In-memory [`LeaseStoreClient`] with etag concurrency and document TTL.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    documents: DashMap<String, StoredEntry>,
    next_etag: AtomicU64,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint_etag(&self) -> String {
        format!("{}", self.next_etag.fetch_add(1, Ordering::SeqCst))
    }

    fn is_live(entry: &StoredEntry) -> bool {
        entry.expires_at.is_none_or(|at| at > Instant::now())
    }

    fn to_document(id: &str, entry: &StoredEntry) -> StoredDocument {
        StoredDocument {
            id: id.to_string(),
            etag: entry.etag.clone(),
            timestamp: entry.timestamp,
            body: entry.body.clone(),
        }
    }

    /// Number of live documents (test assertion helper).
    pub fn document_count(&self) -> usize {
        self.documents
            .iter()
            .filter(|e| Self::is_live(e.value()))
            .count()
    }

    /// Ids of live documents, sorted (test assertion helper).
    pub fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .documents
            .iter()
            .filter(|e| Self::is_live(e.value()))
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Backdate a document's server timestamp, e.g. to expire a lease.
    pub fn age_document(&self, id: &str, by: Duration) {
        if let Some(mut entry) = self.documents.get_mut(id) {
            entry.timestamp -= chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        }
    }
}

#[async_trait]
impl LeaseStoreClient for InMemoryLeaseStore {
    async fn create(
        &self,
        id: &str,
        body: serde_json::Value,
        ttl: Option<Duration>,
    ) -> FeedResult<StoredDocument> {
        let entry = StoredEntry {
            etag: self.mint_etag(),
            timestamp: Utc::now(),
            body,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        match self.documents.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if Self::is_live(occupied.get()) {
                    return Err(FeedError::Conflict(id.to_string()));
                }
                occupied.insert(entry.clone());
                Ok(Self::to_document(id, &entry))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry.clone());
                Ok(Self::to_document(id, &entry))
            }
        }
    }

    async fn read(&self, id: &str) -> FeedResult<StoredDocument> {
        match self.documents.get(id) {
            Some(entry) if Self::is_live(entry.value()) => {
                Ok(Self::to_document(id, entry.value()))
            }
            _ => Err(FeedError::NotFound(id.to_string())),
        }
    }

    async fn replace(
        &self,
        id: &str,
        body: serde_json::Value,
        if_match: &str,
    ) -> FeedResult<StoredDocument> {
        let mut entry = match self.documents.get_mut(id) {
            Some(entry) if Self::is_live(entry.value()) => entry,
            _ => return Err(FeedError::NotFound(id.to_string())),
        };
        if entry.etag != if_match {
            return Err(FeedError::PreconditionFailed(id.to_string()));
        }
        entry.etag = self.mint_etag();
        entry.timestamp = Utc::now();
        entry.body = body;
        Ok(Self::to_document(id, entry.value()))
    }

    async fn delete(&self, id: &str) -> FeedResult<()> {
        match self.documents.remove(id) {
            Some((_, entry)) if Self::is_live(&entry) => Ok(()),
            _ => Err(FeedError::NotFound(id.to_string())),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> FeedResult<Vec<StoredDocument>> {
        let mut docs: Vec<StoredDocument> = self
            .documents
            .iter()
            .filter(|e| e.key().starts_with(prefix) && Self::is_live(e.value()))
            .map(|e| Self::to_document(e.key(), e.value()))
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }
}

#[derive(Debug, Clone)]
struct FeedPartition {
    range: PartitionRange,
    /// Global index of `records[0]`; child partitions start where the parent
    /// stopped.
    base: usize,
    records: Vec<ChangeRecord>,
    gone: bool,
    children: Vec<String>,
}

/// In-memory [`ChangeFeedClient`] with split support.
///
/// Continuation tokens are stringified record indexes, which keeps the
/// at-least-once accounting in tests easy to reason about.
#[derive(Debug, Default)]
pub struct InMemoryFeed {
    partitions: RwLock<HashMap<String, FeedPartition>>,
    inject_transient: AtomicU32,
    inject_fatal: AtomicU32,
}

impl InMemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty partition.
    pub fn add_partition(&self, id: &str) {
        let mut partitions = self.partitions.write().expect("feed lock poisoned");
        let index = partitions.len();
        partitions.insert(
            id.to_string(),
            FeedPartition {
                range: PartitionRange {
                    id: id.to_string(),
                    min_inclusive: format!("{index:02X}"),
                    max_exclusive: format!("{:02X}", index + 1),
                    parents: Vec::new(),
                },
                base: 0,
                records: Vec::new(),
                gone: false,
                children: Vec::new(),
            },
        );
    }

    /// Append `count` generated records to a partition.
    pub fn push_records(&self, id: &str, count: usize) {
        let mut partitions = self.partitions.write().expect("feed lock poisoned");
        let partition = partitions.get_mut(id).expect("unknown partition");
        let start = partition.base + partition.records.len();
        for n in 0..count {
            partition.records.push(ChangeRecord::new(serde_json::json!({
                "partition": id,
                "seq": start + n,
            })));
        }
    }

    /// Split a partition: the parent is gone, each child resumes at the
    /// parent's final record index.
    pub fn split(&self, parent_id: &str, child_ids: &[&str]) {
        let mut partitions = self.partitions.write().expect("feed lock poisoned");
        let parent = partitions.get_mut(parent_id).expect("unknown partition");
        parent.gone = true;
        parent.children = child_ids.iter().map(|c| c.to_string()).collect();
        let split_at = parent.base + parent.records.len();
        let parent_range = parent.range.clone();

        for (n, child_id) in child_ids.iter().enumerate() {
            partitions.insert(
                child_id.to_string(),
                FeedPartition {
                    range: PartitionRange {
                        id: child_id.to_string(),
                        min_inclusive: format!("{}-{n}", parent_range.min_inclusive),
                        max_exclusive: format!("{}-{n}", parent_range.max_exclusive),
                        parents: vec![parent_id.to_string()],
                    },
                    base: split_at,
                    records: Vec::new(),
                    gone: false,
                    children: Vec::new(),
                },
            );
        }
    }

    /// Total records across live partitions (test assertion helper).
    pub fn record_count(&self) -> usize {
        self.partitions
            .read()
            .expect("feed lock poisoned")
            .values()
            .filter(|p| !p.gone)
            .map(|p| p.records.len())
            .sum()
    }

    /// Make the next `count` reads fail with a transient error.
    pub fn inject_transient_errors(&self, count: u32) {
        self.inject_transient.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` reads fail with an unrecoverable error.
    pub fn inject_fatal_errors(&self, count: u32) {
        self.inject_fatal.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChangeFeedClient for InMemoryFeed {
    async fn read_changes(
        &self,
        partition_id: &str,
        cursor: &FeedCursor,
        max_item_count: usize,
    ) -> FeedResult<FeedResponse> {
        if self
            .inject_fatal
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FeedError::Fatal("injected fatal".to_string()));
        }
        if self
            .inject_transient
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FeedError::Transient("injected".to_string()));
        }

        let partitions = self.partitions.read().expect("feed lock poisoned");
        let partition = partitions
            .get(partition_id)
            .ok_or_else(|| FeedError::Fatal(format!("unknown partition {partition_id}")))?;
        if partition.gone {
            return Ok(FeedResponse::PartitionGone);
        }

        let index = match cursor {
            FeedCursor::Beginning | FeedCursor::Time(_) => partition.base,
            FeedCursor::Continuation(token) => token
                .as_str()
                .parse::<usize>()
                .map_err(|_| FeedError::Fatal(format!("malformed token {token}")))?,
        };
        let local = index.saturating_sub(partition.base);

        if local >= partition.records.len() {
            return Ok(FeedResponse::NotModified {
                continuation: ContinuationToken::new(index.to_string()),
            });
        }

        let end = (local + max_item_count).min(partition.records.len());
        let records = partition.records[local..end].to_vec();
        let next = partition.base + end;
        Ok(FeedResponse::Batch {
            records,
            continuation: ContinuationToken::new(next.to_string()),
        })
    }

    async fn list_partitions(&self, _max_batch_size: usize) -> FeedResult<Vec<PartitionRange>> {
        let partitions = self.partitions.read().expect("feed lock poisoned");
        let mut ranges: Vec<PartitionRange> = partitions
            .values()
            .filter(|p| !p.gone)
            .map(|p| p.range.clone())
            .collect();
        ranges.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(ranges)
    }

    async fn child_partitions(&self, parent_id: &str) -> FeedResult<Vec<PartitionRange>> {
        let partitions = self.partitions.read().expect("feed lock poisoned");
        let parent = partitions
            .get(parent_id)
            .ok_or_else(|| FeedError::NotFound(parent_id.to_string()))?;
        Ok(parent
            .children
            .iter()
            .filter_map(|child| partitions.get(child).map(|p| p.range.clone()))
            .collect())
    }
}

/// Counts observer callbacks across partitions; optionally injects failures
/// to exercise at-least-once redelivery.
#[derive(Debug, Default)]
pub struct CountingObserver {
    opened: AtomicUsize,
    closed: AtomicUsize,
    processed_records: AtomicUsize,
    processed_batches: AtomicUsize,
    fail_first_per_partition: bool,
    remaining_random_failures: AtomicU32,
    first_seen: DashMap<String, ()>,
    closed_partitions: DashMap<String, CloseReason>,
    close_log: Mutex<Vec<(String, CloseReason)>>,
    calls_after_close: AtomicUsize,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first batch of every partition and up to `random_failures`
    /// additional batches.
    pub fn with_failures(fail_first_per_partition: bool, random_failures: u32) -> Self {
        Self {
            fail_first_per_partition,
            remaining_random_failures: AtomicU32::new(random_failures),
            ..Self::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn processed_records(&self) -> usize {
        self.processed_records.load(Ordering::SeqCst)
    }

    pub fn processed_batches(&self) -> usize {
        self.processed_batches.load(Ordering::SeqCst)
    }

    /// Observer invocations that arrived after `close` for the partition.
    pub fn calls_after_close(&self) -> usize {
        self.calls_after_close.load(Ordering::SeqCst)
    }

    pub fn close_reasons(&self) -> Vec<(String, CloseReason)> {
        self.close_log.lock().expect("close log poisoned").clone()
    }

    fn should_fail(&self, partition_id: &str) -> bool {
        if self.fail_first_per_partition && self.first_seen.insert(partition_id.to_string(), ()).is_none()
        {
            return true;
        }
        if self.remaining_random_failures.load(Ordering::SeqCst) > 0
            && fastrand::bool()
            && self
                .remaining_random_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return true;
        }
        false
    }
}

#[async_trait]
impl ChangeObserver for CountingObserver {
    async fn open(&self, context: &ObserverContext) -> FeedResult<()> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.closed_partitions.remove(context.partition_id());
        Ok(())
    }

    async fn process_changes(
        &self,
        context: &ObserverContext,
        batch: ChangeBatch,
        _cancel: &CancellationToken,
    ) -> FeedResult<()> {
        if self.closed_partitions.contains_key(context.partition_id()) {
            self.calls_after_close.fetch_add(1, Ordering::SeqCst);
        }
        if self.should_fail(context.partition_id()) {
            return Err(FeedError::ObserverFailed {
                partition_id: context.partition_id().to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.processed_batches.fetch_add(1, Ordering::SeqCst);
        self.processed_records
            .fetch_add(batch.records.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, context: &ObserverContext, reason: CloseReason) -> FeedResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.closed_partitions
            .insert(context.partition_id().to_string(), reason);
        self.close_log
            .lock()
            .expect("close log poisoned")
            .push((context.partition_id().to_string(), reason));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_conflicts_on_duplicate() {
        let store = InMemoryLeaseStore::new();
        store
            .create("cf.info", serde_json::json!({}), None)
            .await
            .unwrap();
        let err = store
            .create("cf.info", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn ttl_expires_documents() {
        let store = InMemoryLeaseStore::new();
        store
            .create("cf.lock", serde_json::json!({}), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(store.read("cf.lock").await.is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.read("cf.lock").await.unwrap_err().is_not_found());
        // Expired lock can be re-created.
        assert!(
            store
                .create("cf.lock", serde_json::json!({}), Some(Duration::from_secs(5)))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn replace_enforces_etag() {
        let store = InMemoryLeaseStore::new();
        let doc = store
            .create("cf..0", serde_json::json!({"owner": "a"}), None)
            .await
            .unwrap();

        let updated = store
            .replace("cf..0", serde_json::json!({"owner": "b"}), &doc.etag)
            .await
            .unwrap();
        assert_ne!(updated.etag, doc.etag);

        let err = store
            .replace("cf..0", serde_json::json!({"owner": "c"}), &doc.etag)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn list_prefix_is_ordered_and_scoped() {
        let store = InMemoryLeaseStore::new();
        for id in ["cf..2", "cf..0", "cf..1", "cf.info", "other..5"] {
            store.create(id, serde_json::json!({}), None).await.unwrap();
        }
        let docs = store.list_prefix("cf..").await.unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["cf..0", "cf..1", "cf..2"]);
    }

    #[tokio::test]
    async fn feed_reads_in_batches() {
        let feed = InMemoryFeed::new();
        feed.add_partition("0");
        feed.push_records("0", 250);

        let mut cursor = FeedCursor::Beginning;
        let mut total = 0;
        loop {
            match feed.read_changes("0", &cursor, 100).await.unwrap() {
                FeedResponse::Batch {
                    records,
                    continuation,
                } => {
                    total += records.len();
                    cursor = FeedCursor::Continuation(continuation);
                }
                FeedResponse::NotModified { .. } => break,
                other => panic!("unexpected response {other:?}"),
            }
        }
        assert_eq!(total, 250);
    }

    #[tokio::test]
    async fn split_children_resume_at_parent_index() {
        let feed = InMemoryFeed::new();
        feed.add_partition("p");
        feed.push_records("p", 40);
        feed.split("p", &["p1", "p2"]);
        feed.push_records("p1", 3);

        assert!(matches!(
            feed.read_changes("p", &FeedCursor::Beginning, 10).await.unwrap(),
            FeedResponse::PartitionGone
        ));

        let children = feed.child_partitions("p").await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.parents == vec!["p".to_string()]));

        // Resuming at the parent's final token yields the child's records.
        let token = ContinuationToken::new("40");
        match feed
            .read_changes("p1", &FeedCursor::Continuation(token), 10)
            .await
            .unwrap()
        {
            FeedResponse::Batch { records, .. } => assert_eq!(records.len(), 3),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_injection() {
        let feed = InMemoryFeed::new();
        feed.add_partition("0");
        feed.inject_fatal_errors(1);
        let err = feed
            .read_changes("0", &FeedCursor::Beginning, 10)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(feed.read_changes("0", &FeedCursor::Beginning, 10).await.is_ok());
    }

    #[tokio::test]
    async fn transient_injection() {
        let feed = InMemoryFeed::new();
        feed.add_partition("0");
        feed.inject_transient_errors(2);
        assert!(
            feed.read_changes("0", &FeedCursor::Beginning, 10)
                .await
                .unwrap_err()
                .is_transient()
        );
        assert!(
            feed.read_changes("0", &FeedCursor::Beginning, 10)
                .await
                .unwrap_err()
                .is_transient()
        );
        assert!(feed.read_changes("0", &FeedCursor::Beginning, 10).await.is_ok());
    }
}
