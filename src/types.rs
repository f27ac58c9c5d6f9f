//! Core data types shared across the processor.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque per-partition resume cursor.
///
/// The only supported operations are equality and handing the value back to
/// the server to resume a read. Lexicographic ordering is deliberately not
/// exposed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(pub String);

impl ContinuationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContinuationToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ContinuationToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A disjoint slice of the monitored store's key space.
///
/// Ranges are half-open: `min_inclusive <= key < max_exclusive`. When the
/// store splits a partition, the child ranges exactly cover the parent range
/// and report the parent's id in `parents`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRange {
    /// Opaque partition identifier assigned by the monitored store.
    pub id: String,
    /// Inclusive lower bound over the hash/token space.
    pub min_inclusive: String,
    /// Exclusive upper bound over the hash/token space.
    pub max_exclusive: String,
    /// Ids of the parent partitions this range was split from, if any.
    #[serde(default)]
    pub parents: Vec<String>,
}

/// A single change-feed record: an opaque document payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub body: serde_json::Value,
}

impl ChangeRecord {
    pub fn new(body: serde_json::Value) -> Self {
        Self { body }
    }
}

/// A batch of change records for one partition, labeled with the continuation
/// token that resumes reading *after* the batch.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub partition_id: String,
    pub records: Vec<ChangeRecord>,
    pub continuation: ContinuationToken,
}

/// Where to begin reading a partition's change feed.
#[derive(Debug, Clone)]
pub enum FeedCursor {
    /// Read from the oldest retained change.
    Beginning,
    /// Read changes recorded at or after the given server time.
    Time(DateTime<Utc>),
    /// Resume at a previously returned continuation token.
    Continuation(ContinuationToken),
}

/// One server response to a change-feed read.
#[derive(Debug, Clone)]
pub enum FeedResponse {
    /// New records plus the token to resume after them.
    Batch {
        records: Vec<ChangeRecord>,
        continuation: ContinuationToken,
    },
    /// Nothing new; the returned token resumes at the same place.
    NotModified { continuation: ContinuationToken },
    /// The server is shedding load; wait the suggested delay and retry.
    Throttled { retry_after: Duration },
    /// The partition no longer exists — it has been split into children.
    PartitionGone,
}

/// Why an observer is being closed. Delivered exactly once per opened
/// partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The host is shutting down or the partition was rebalanced away.
    Shutdown,
    /// Another host owns the partition's lease now.
    LeaseLost,
    /// The partition split; child partitions take over from its checkpoint.
    Split,
    /// The observer itself failed while processing a batch.
    ObserverFailed,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::LeaseLost => write!(f, "lease_lost"),
            CloseReason::Split => write!(f, "split"),
            CloseReason::ObserverFailed => write!(f, "observer_failed"),
        }
    }
}

/// Initial checkpoint seed for partitions that have no lease yet.
#[derive(Debug, Clone, Default)]
pub enum StartPosition {
    /// Start from the oldest retained change.
    #[default]
    Beginning,
    /// Start from changes recorded at or after the given time.
    Time(DateTime<Utc>),
    /// Start from an explicit continuation token.
    Continuation(ContinuationToken),
}

impl StartPosition {
    /// The token to seed new leases with, when the position carries one.
    pub fn seed_token(&self) -> Option<&ContinuationToken> {
        match self {
            StartPosition::Continuation(token) => Some(token),
            _ => None,
        }
    }

    /// The cursor for a first read on a partition with no checkpoint.
    pub fn initial_cursor(&self) -> FeedCursor {
        match self {
            StartPosition::Beginning => FeedCursor::Beginning,
            StartPosition::Time(t) => FeedCursor::Time(*t),
            StartPosition::Continuation(token) => FeedCursor::Continuation(token.clone()),
        }
    }
}

/// How often the processor persists its continuation token.
///
/// The token is never advanced past the most recently acknowledged batch,
/// whatever the cadence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CheckpointFrequency {
    /// Checkpoint after every acknowledged batch.
    #[default]
    EveryBatch,
    /// Checkpoint after every `n` acknowledged batches.
    EveryBatches(u32),
    /// Checkpoint when at least this much time passed since the last one.
    EveryInterval(Duration),
    /// Only checkpoint when the observer calls
    /// [`ObserverContext::checkpoint`](crate::observer::ObserverContext::checkpoint).
    Manual,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_token_round_trip() {
        let token = ContinuationToken::new("42");
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, "\"42\"");
        let back: ContinuationToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn start_position_seed_token() {
        assert!(StartPosition::Beginning.seed_token().is_none());
        assert!(StartPosition::Time(Utc::now()).seed_token().is_none());
        let pos = StartPosition::Continuation(ContinuationToken::new("7"));
        assert_eq!(pos.seed_token().unwrap().as_str(), "7");
    }

    #[test]
    fn close_reason_display() {
        assert_eq!(CloseReason::Shutdown.to_string(), "shutdown");
        assert_eq!(CloseReason::LeaseLost.to_string(), "lease_lost");
        assert_eq!(CloseReason::Split.to_string(), "split");
        assert_eq!(CloseReason::ObserverFailed.to_string(), "observer_failed");
    }

    #[test]
    fn partition_range_parents_default_empty() {
        let range: PartitionRange =
            serde_json::from_str(r#"{"id":"0","min_inclusive":"","max_exclusive":"FF"}"#).unwrap();
        assert!(range.parents.is_empty());
    }
}
