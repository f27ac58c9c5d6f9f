//! Crate-wide constants and defaults.

/// Default ownership expiry threshold for a lease, in seconds.
///
/// A lease whose `timestamp` is older than this is considered expired and may
/// be stolen by any host.
pub const DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS: u64 = 60;

/// Default period of the per-partition lease renewer task, in seconds.
pub const DEFAULT_LEASE_RENEW_INTERVAL_SECS: u64 = 17;

/// Default period of the load-balancer tick, in seconds.
pub const DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS: u64 = 13;

/// Default sleep between empty change-feed reads, in seconds.
pub const DEFAULT_FEED_POLL_DELAY_SECS: u64 = 5;

/// Default server batch hint for change-feed reads.
pub const DEFAULT_MAX_ITEM_COUNT: usize = 100;

/// Default concurrency bound for bulk lease creation.
pub const DEFAULT_DEGREE_OF_PARALLELISM: usize = 25;

/// Default page size for partition enumeration.
pub const DEFAULT_QUERY_PARTITIONS_MAX_BATCH_SIZE: usize = 100;

/// Default TTL on the bootstrap init-lock document, in seconds.
pub const DEFAULT_BOOTSTRAP_LOCK_TTL_SECS: u64 = 30;

/// Default sleep between bootstrap attempts while another host holds the
/// init lock, in seconds.
pub const DEFAULT_BOOTSTRAP_RETRY_DELAY_SECS: u64 = 5;

/// Default window after which sustained failures are escalated and within
/// which repeated health events for the same partition/operation are
/// de-duplicated, in seconds (15 minutes).
pub const DEFAULT_UNHEALTHINESS_DURATION_SECS: u64 = 900;

/// Base delay for the processor's transient-error backoff, in milliseconds.
pub const PROCESSOR_BACKOFF_BASE_MS: u64 = 100;

/// Ceiling for the processor's transient-error backoff, in seconds.
pub const PROCESSOR_BACKOFF_MAX_SECS: u64 = 30;

/// Suffix of the reserved store-marker document: `{prefix}.info`.
pub const STORE_MARKER_SUFFIX: &str = ".info";

/// Suffix of the reserved init-lock document: `{prefix}.lock`.
pub const INIT_LOCK_SUFFIX: &str = ".lock";

/// Separator between the lease prefix and the partition id in lease document
/// ids: `{prefix}..{partition_id}`.
pub const LEASE_ID_SEPARATOR: &str = "..";
