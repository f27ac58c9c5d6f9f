//! Durable lease records and the operations that mutate them.
//!
//! A lease grants one host time-bounded exclusive ownership of a partition.
//! All durable state lives in the remote lease store; mutations are
//! linearized by the store's etag. Two reserved documents per collection —
//! `{prefix}.info` and `{prefix}.lock` — gate one-time bootstrap.

mod document;
mod manager;
mod store;

use std::sync::Arc;

pub use document::Lease;
pub use manager::{CreateOutcome, LeaseManager};
pub use store::LeaseStore;

/// A lease shared between the renewer and processor tasks of one supervisor.
///
/// Both tasks mutate the lease remotely (renew bumps the timestamp,
/// checkpoint advances the token) and each mutation refreshes the etag, so
/// they serialize through this mutex and store the updated record back after
/// every successful call.
pub type SharedLease = Arc<tokio::sync::Mutex<Lease>>;
