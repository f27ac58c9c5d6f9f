//! Processor configuration.
//!
//! One explicit record with typed fields and a single validating entry point.
//! [`ProcessorConfig::validate`] collects every violation and fails with
//! `InvalidConfiguration` listing all of them up front, so misconfiguration
//! is caught at construction rather than mid-flight.

use std::time::Duration;

use crate::constants::{
    DEFAULT_BOOTSTRAP_LOCK_TTL_SECS, DEFAULT_BOOTSTRAP_RETRY_DELAY_SECS,
    DEFAULT_DEGREE_OF_PARALLELISM, DEFAULT_FEED_POLL_DELAY_SECS,
    DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS, DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS,
    DEFAULT_LEASE_RENEW_INTERVAL_SECS, DEFAULT_MAX_ITEM_COUNT,
    DEFAULT_QUERY_PARTITIONS_MAX_BATCH_SIZE, DEFAULT_UNHEALTHINESS_DURATION_SECS,
};
use crate::error::{FeedError, FeedResult};
use crate::types::{CheckpointFrequency, StartPosition};

/// Configuration for a change-feed host.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Host identity recorded as the lease owner. Auto-generated when `None`.
    pub host_name: Option<String>,

    /// Namespaces leases, marker, and lock across logical processors sharing
    /// one lease collection.
    pub lease_prefix: String,

    /// Ownership expiry threshold: a lease not renewed for this long may be
    /// stolen by any host.
    pub lease_expiration_interval: Duration,

    /// Period of the per-partition renewer task. Must be shorter than the
    /// expiration interval.
    pub lease_renew_interval: Duration,

    /// Period of the load-balancer tick.
    pub lease_acquire_interval: Duration,

    /// Lower bound on partitions the balancing strategy aims to own.
    pub min_partition_count: usize,

    /// Upper bound on partitions this host will own. `0` means unbounded.
    pub max_partition_count: usize,

    /// Sleep between change-feed reads that returned nothing.
    pub feed_poll_delay: Duration,

    /// Server batch hint for change-feed reads.
    pub max_item_count: usize,

    /// Initial checkpoint seed for partitions that have no lease yet.
    pub start_position: StartPosition,

    /// Checkpoint cadence for the partition processor.
    pub checkpoint_frequency: CheckpointFrequency,

    /// Concurrency bound for bulk lease creation.
    pub degree_of_parallelism: usize,

    /// Page size for partition enumeration.
    pub query_partitions_max_batch_size: usize,

    /// TTL on the bootstrap init-lock document.
    pub bootstrap_lock_ttl: Duration,

    /// Sleep between bootstrap attempts while another host holds the lock.
    pub bootstrap_retry_delay: Duration,

    /// Window after which sustained renewal failure is escalated to lease
    /// loss, and within which the default health monitor de-duplicates
    /// repeated events.
    pub unhealthiness_duration: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            host_name: None,
            lease_prefix: String::new(),
            lease_expiration_interval: Duration::from_secs(
                DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS,
            ),
            lease_renew_interval: Duration::from_secs(DEFAULT_LEASE_RENEW_INTERVAL_SECS),
            lease_acquire_interval: Duration::from_secs(DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS),
            min_partition_count: 0,
            max_partition_count: 0,
            feed_poll_delay: Duration::from_secs(DEFAULT_FEED_POLL_DELAY_SECS),
            max_item_count: DEFAULT_MAX_ITEM_COUNT,
            start_position: StartPosition::default(),
            checkpoint_frequency: CheckpointFrequency::default(),
            degree_of_parallelism: DEFAULT_DEGREE_OF_PARALLELISM,
            query_partitions_max_batch_size: DEFAULT_QUERY_PARTITIONS_MAX_BATCH_SIZE,
            bootstrap_lock_ttl: Duration::from_secs(DEFAULT_BOOTSTRAP_LOCK_TTL_SECS),
            bootstrap_retry_delay: Duration::from_secs(DEFAULT_BOOTSTRAP_RETRY_DELAY_SECS),
            unhealthiness_duration: Duration::from_secs(DEFAULT_UNHEALTHINESS_DURATION_SECS),
        }
    }
}

impl ProcessorConfig {
    /// Minimal valid configuration for a named lease collection.
    pub fn with_prefix(lease_prefix: impl Into<String>) -> Self {
        Self {
            lease_prefix: lease_prefix.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration, collecting every violation.
    pub fn validate(&self) -> FeedResult<()> {
        let mut problems = Vec::new();

        if self.lease_prefix.is_empty() {
            problems.push("lease_prefix must not be empty".to_string());
        }
        if self.lease_expiration_interval.is_zero() {
            problems.push("lease_expiration_interval must be greater than zero".to_string());
        }
        if self.lease_renew_interval.is_zero() {
            problems.push("lease_renew_interval must be greater than zero".to_string());
        }
        if self.lease_renew_interval >= self.lease_expiration_interval {
            problems.push(format!(
                "lease_renew_interval ({:?}) must be shorter than lease_expiration_interval ({:?})",
                self.lease_renew_interval, self.lease_expiration_interval
            ));
        }
        if self.lease_acquire_interval.is_zero() {
            problems.push("lease_acquire_interval must be greater than zero".to_string());
        }
        if self.max_partition_count != 0 && self.min_partition_count > self.max_partition_count {
            problems.push(format!(
                "min_partition_count ({}) must not exceed max_partition_count ({})",
                self.min_partition_count, self.max_partition_count
            ));
        }
        if self.max_item_count == 0 {
            problems.push("max_item_count must be greater than zero".to_string());
        }
        if self.degree_of_parallelism == 0 {
            problems.push("degree_of_parallelism must be greater than zero".to_string());
        }
        if self.query_partitions_max_batch_size == 0 {
            problems.push("query_partitions_max_batch_size must be greater than zero".to_string());
        }
        if self.bootstrap_lock_ttl.is_zero() {
            problems.push("bootstrap_lock_ttl must be greater than zero".to_string());
        }
        if let CheckpointFrequency::EveryBatches(0) = self.checkpoint_frequency {
            problems.push("checkpoint_frequency: batch count must be greater than zero".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(FeedError::InvalidConfiguration(problems))
        }
    }

    /// The configured host name, or a generated one.
    pub fn resolve_host_name(&self) -> String {
        match &self.host_name {
            Some(name) => name.clone(),
            None => format!("host-{:016x}", fastrand::u64(..)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_with_prefix_is_valid() {
        assert!(ProcessorConfig::with_prefix("cf").validate().is_ok());
    }

    #[test]
    fn empty_prefix_is_rejected() {
        let err = ProcessorConfig::default().validate().unwrap_err();
        match err {
            FeedError::InvalidConfiguration(problems) => {
                assert!(problems.iter().any(|p| p.contains("lease_prefix")));
            }
            other => panic!("expected InvalidConfiguration, got {other}"),
        }
    }

    #[test]
    fn all_violations_are_collected() {
        let config = ProcessorConfig {
            lease_prefix: String::new(),
            lease_renew_interval: Duration::from_secs(120),
            lease_expiration_interval: Duration::from_secs(60),
            max_item_count: 0,
            degree_of_parallelism: 0,
            min_partition_count: 5,
            max_partition_count: 2,
            ..Default::default()
        };
        match config.validate().unwrap_err() {
            FeedError::InvalidConfiguration(problems) => {
                assert!(problems.len() >= 5, "got: {problems:?}");
            }
            other => panic!("expected InvalidConfiguration, got {other}"),
        }
    }

    #[test]
    fn renew_must_be_shorter_than_expiration() {
        let config = ProcessorConfig {
            lease_renew_interval: Duration::from_secs(60),
            lease_expiration_interval: Duration::from_secs(60),
            ..ProcessorConfig::with_prefix("cf")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_partition_count_means_unbounded() {
        let config = ProcessorConfig {
            min_partition_count: 10,
            max_partition_count: 0,
            ..ProcessorConfig::with_prefix("cf")
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn manual_checkpointing_validates() {
        let config = ProcessorConfig {
            checkpoint_frequency: CheckpointFrequency::Manual,
            ..ProcessorConfig::with_prefix("cf")
        };
        assert!(config.validate().is_ok());

        let config = ProcessorConfig {
            checkpoint_frequency: CheckpointFrequency::EveryBatches(0),
            ..ProcessorConfig::with_prefix("cf")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn host_name_resolution() {
        let named = ProcessorConfig {
            host_name: Some("worker-3".to_string()),
            ..ProcessorConfig::with_prefix("cf")
        };
        assert_eq!(named.resolve_host_name(), "worker-3");

        let generated = ProcessorConfig::with_prefix("cf").resolve_host_name();
        assert!(generated.starts_with("host-"));
    }
}
