//! # Changeling
//! Distributed change-feed processor with lease-based partition ownership.
//!
//! A fleet of worker hosts fans out a partitioned, append-only change log
//! from a remote document database. Each host competes for exclusive,
//! time-bounded ownership (a lease) of individual partitions; while it owns a
//! partition it streams new records to a user-supplied observer and durably
//! checkpoints progress so another host can resume from the same point if
//! ownership changes.
//!
//! # Goals
//! - At-least-once delivery with per-partition ordering
//! - Automatic load balancing across a dynamic fleet, no coordinator process
//! - Dynamic repartitioning (split) handling with checkpoint continuity
//! - Pluggable stores: the database clients are injected traits
//!
//! # Architecture
//!
//! ```text
//!        ┌──────────┐     ┌──────────┐     ┌──────────┐
//!        │  Host A  │     │  Host B  │     │  Host C  │
//!        └────┬─────┘     └────┬─────┘     └────┬─────┘
//!             │  leases (etag-guarded documents) │
//!             └───────────────┬──────────────────┘
//!                             ▼
//!                      ┌─────────────┐
//!                      │ Lease store │  one record per partition
//!                      └─────────────┘  plus {prefix}.info / {prefix}.lock
//!                             │
//!                             ▼
//!                      ┌─────────────┐
//!                      │ Change feed │  partitioned append-only log
//!                      └─────────────┘
//! ```
//!
//! Per owned partition a host runs a supervisor pairing a lease renewer with
//! a processor; the processor reads batches, dispatches them to the observer,
//! and advances the checkpoint. A periodic balancer converges every host
//! toward an equal share of partitions.
//!
//! # Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//! use changeling::{
//!     ChangeBatch, ChangeFeedHost, ChangeObserver, CloseReason, FeedResult,
//!     ObserverContext, ProcessorConfig,
//! };
//!
//! struct PrintingObserver;
//!
//! #[async_trait]
//! impl ChangeObserver for PrintingObserver {
//!     async fn open(&self, ctx: &ObserverContext) -> FeedResult<()> {
//!         println!("opened {}", ctx.partition_id());
//!         Ok(())
//!     }
//!
//!     async fn process_changes(
//!         &self,
//!         _ctx: &ObserverContext,
//!         batch: ChangeBatch,
//!         _cancel: &CancellationToken,
//!     ) -> FeedResult<()> {
//!         println!("{} records", batch.records.len());
//!         Ok(())
//!     }
//!
//!     async fn close(&self, ctx: &ObserverContext, reason: CloseReason) -> FeedResult<()> {
//!         println!("closed {} ({reason})", ctx.partition_id());
//!         Ok(())
//!     }
//! }
//!
//! # async fn example(
//! #     feed: Arc<dyn changeling::ChangeFeedClient>,
//! #     store: Arc<dyn changeling::LeaseStoreClient>,
//! # ) -> FeedResult<()> {
//! let factory = Arc::new(|_partition: &str| {
//!     Arc::new(PrintingObserver) as Arc<dyn ChangeObserver>
//! });
//! let host = ChangeFeedHost::new(
//!     ProcessorConfig::with_prefix("orders-feed"),
//!     feed,
//!     store,
//!     factory,
//! )?;
//! host.start().await?;
//! # host.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod balancer;
pub mod bootstrap;
pub mod clients;
pub mod config;
pub mod constants;
pub mod error;
pub mod health;
pub mod host;
pub mod lease;
pub mod metrics;
pub mod observer;
pub mod partition;
pub mod retry;
pub mod telemetry;
pub mod types;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;

pub use balancer::{BalancingStrategy, EqualPartitionsStrategy, LoadBalancer};
pub use bootstrap::Bootstrapper;
pub use clients::{ChangeFeedClient, LeaseStoreClient, StoredDocument};
pub use config::ProcessorConfig;
pub use error::{FeedError, FeedResult};
pub use health::{
    HealthEvent, HealthEventKind, HealthMonitor, HealthSeverity, LoggingHealthMonitor,
};
pub use host::ChangeFeedHost;
pub use lease::{CreateOutcome, Lease, LeaseManager, LeaseStore};
pub use observer::{ChangeObserver, ObserverContext, ObserverFactory};
pub use partition::{
    HealthMonitoredController, PartitionController, PartitionLifecycle, PartitionProcessor,
    PartitionSupervisor, PartitionSynchronizer, ProcessorOutcome, ProcessorSettings,
};
pub use types::{
    ChangeBatch, ChangeRecord, CheckpointFrequency, CloseReason, ContinuationToken, FeedCursor,
    FeedResponse, PartitionRange, StartPosition,
};
