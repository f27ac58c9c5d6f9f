//! Error types for the change-feed processor.
//!
//! # Error Handling Patterns
//!
//! Two patterns are used depending on operation criticality:
//!
//! **Fail-fast (propagate)** for operations where failure means the caller
//! must stop or change course: lease acquisition, checkpointing, the
//! bootstrap protocol. `LeaseLost` is the sentinel every caller handles — it
//! means another host owns the partition now; stop immediately and do not
//! release.
//!
//! **Best-effort (log and continue)** for operations where partial failure is
//! acceptable: lease release during shutdown, health reporting, metric
//! collection.
//!
//! Transient store/feed failures are retried with exponential backoff and
//! jitter (see [`crate::retry`]); sustained failure beyond the configured
//! unhealthiness window is escalated by the supervisor to `LeaseLost`.

use std::time::Duration;

use thiserror::Error;

/// Result type for change-feed processor operations.
pub type FeedResult<T> = Result<T, FeedError>;

/// Errors that can occur while processing a change feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The requested document does not exist in the lease store.
    #[error("document not found: {0}")]
    NotFound(String),

    /// A conditional create collided with an existing document.
    ///
    /// A conflict on create is the universal signal for "someone else got
    /// here first" and most callers treat it as success.
    #[error("document already exists: {0}")]
    Conflict(String),

    /// A conditional replace failed because the stored etag changed.
    #[error("etag precondition failed for document {0}")]
    PreconditionFailed(String),

    /// Another host owns this partition's lease now.
    ///
    /// The receiving task must stop working on the partition immediately and
    /// must not release the lease.
    #[error("lease lost for partition {partition_id}")]
    LeaseLost { partition_id: String },

    /// The user-supplied observer returned an error or panicked.
    #[error("observer failed for partition {partition_id}: {message}")]
    ObserverFailed {
        partition_id: String,
        message: String,
    },

    /// A transient store or network failure; retry with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// The server asked us to back off.
    #[error("throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    /// Serialization/deserialization error on a lease document.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The processor configuration is invalid. Lists every violation found.
    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfiguration(Vec<String>),

    /// The host is shutting down.
    #[error("host is shutting down")]
    Shutdown,

    /// Unrecoverable failure; the host aborts.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl FeedError {
    /// Check if this error is retriable with backoff.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FeedError::Transient(_) | FeedError::Throttled { .. }
        )
    }

    /// Check if this error means another host owns the partition.
    #[inline]
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, FeedError::LeaseLost { .. })
    }

    /// Check if this is a "not found" signal from the lease store.
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, FeedError::NotFound(_))
    }

    /// Check if this is a conflict on a conditional create.
    #[inline]
    pub fn is_conflict(&self) -> bool {
        matches!(self, FeedError::Conflict(_))
    }

    /// Check if this error must abort the host.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FeedError::Fatal(_) | FeedError::InvalidConfiguration(_)
        )
    }
}
