//! Failure classification and noise suppression.
//!
//! Components report typed health events here instead of deciding policy
//! themselves. The default [`LoggingHealthMonitor`] logs by severity with
//! per-partition-per-operation de-duplication so a flapping store does not
//! flood the log; users substitute their own implementation to page, count
//! toward give-up policies, or abort the host on fatal events.
//!
//! The monitor is never on the data path.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::metrics;

/// Severity of a health event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSeverity {
    Informational,
    Warning,
    Critical,
}

impl HealthSeverity {
    pub fn as_label(&self) -> &'static str {
        match self {
            HealthSeverity::Informational => "informational",
            HealthSeverity::Warning => "warning",
            HealthSeverity::Critical => "critical",
        }
    }
}

/// What kind of operation produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthEventKind {
    AcquireLeaseFailure,
    ReleaseLeaseFailure,
    Observer,
    General,
}

impl HealthEventKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            HealthEventKind::AcquireLeaseFailure => "acquire_lease_failure",
            HealthEventKind::ReleaseLeaseFailure => "release_lease_failure",
            HealthEventKind::Observer => "observer",
            HealthEventKind::General => "general",
        }
    }
}

/// A single health report.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub severity: HealthSeverity,
    pub kind: HealthEventKind,
    /// Partition the event concerns, when it concerns one.
    pub partition_id: Option<String>,
    pub message: String,
}

impl HealthEvent {
    pub fn new(
        severity: HealthSeverity,
        kind: HealthEventKind,
        partition_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            kind,
            partition_id,
            message: message.into(),
        }
    }
}

/// Sink for health events.
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    async fn report(&self, event: HealthEvent);

    /// Drop internal suppression state that has aged out.
    ///
    /// The host calls this periodically so de-duplication windows do not
    /// grow without bound. The default does nothing; monitors that keep no
    /// per-partition state can ignore it.
    fn prune(&self) {}
}

/// Default monitor: structured logging with de-duplication.
///
/// Repeated events for the same `(kind, partition)` within the suppression
/// window are demoted to `debug!`.
pub struct LoggingHealthMonitor {
    window: Duration,
    last_seen: DashMap<(HealthEventKind, Option<String>), Instant>,
}

impl LoggingHealthMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: DashMap::new(),
        }
    }

    fn is_duplicate(&self, key: &(HealthEventKind, Option<String>)) -> bool {
        let now = Instant::now();
        let mut duplicate = false;
        self.last_seen
            .entry(key.clone())
            .and_modify(|seen| {
                if now.duration_since(*seen) < self.window {
                    duplicate = true;
                } else {
                    *seen = now;
                }
            })
            .or_insert(now);
        duplicate
    }

    #[cfg(test)]
    fn suppressed_count(&self) -> usize {
        self.last_seen.len()
    }
}

#[async_trait]
impl HealthMonitor for LoggingHealthMonitor {
    fn prune(&self) {
        let window = self.window;
        self.last_seen.retain(|_, seen| seen.elapsed() < window);
    }

    async fn report(&self, event: HealthEvent) {
        metrics::record_health_event(event.kind.as_label(), event.severity.as_label());

        let key = (event.kind, event.partition_id.clone());
        if self.is_duplicate(&key) {
            debug!(
                kind = event.kind.as_label(),
                partition_id = event.partition_id.as_deref().unwrap_or("-"),
                message = %event.message,
                "Suppressed repeated health event"
            );
            return;
        }

        let partition = event.partition_id.as_deref().unwrap_or("-");
        match event.severity {
            HealthSeverity::Informational => {
                info!(kind = event.kind.as_label(), partition_id = partition, message = %event.message, "Health event")
            }
            HealthSeverity::Warning => {
                warn!(kind = event.kind.as_label(), partition_id = partition, message = %event.message, "Health event")
            }
            HealthSeverity::Critical => {
                error!(kind = event.kind.as_label(), partition_id = partition, message = %event.message, "Health event")
            }
        }
    }
}
