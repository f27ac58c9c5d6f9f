//! Unified retry policies for consistent backoff behavior across the crate.
//!
//! All policies include jitter to prevent thundering herd when many hosts hit
//! the same stressed store.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `store_policy` | 50ms | 5s | 5 | Lease store CRUD |
//! | `feed_policy` | 100ms | 10s | 5 | Change-feed reads outside the processor loop |
//! | `fast_policy` | 5ms | 100ms | 3 | Cheap in-process retries |
//!
//! The partition processor's read loop does not use these policies; its
//! backoff is stateful (resets on success, honors server-suggested delays)
//! and lives in [`crate::partition`].

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Policy for lease store operations (create, replace, delete, list).
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for change-feed calls made outside the processor read loop
/// (partition enumeration, child enumeration).
pub fn feed_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for hot-path retries where latency matters.
pub fn fast_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(100))
        .with_max_times(3)
        .with_jitter()
}

/// Execute an async operation with the store retry policy.
pub async fn with_store_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation.retry(store_policy()).when(condition).await
}

/// Execute an async operation with the feed retry policy.
pub async fn with_feed_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation.retry(feed_policy()).when(condition).await
}

/// Add +/- 15% pseudo-random jitter to a base interval.
///
/// Periodic loops (renewer ticks, balancer ticks) use this so a fleet
/// restarted together does not hammer the stores in lockstep.
pub fn with_jitter(base: Duration) -> Duration {
    let jitter_factor = 0.85 + fastrand::f64() * 0.30;
    Duration::from_secs_f64(base.as_secs_f64() * jitter_factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);

        let result = (|| async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"))
            } else {
                Ok(7)
            }
        })
        .retry(fast_policy())
        .when(|_| true)
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn condition_gates_retry() {
        let attempts = AtomicU32::new(0);

        let result: Result<i32, std::io::Error> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "not found",
            ))
        })
        .retry(fast_policy())
        .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_store_policy_wrapper() {
        let attempts = AtomicU32::new(0);

        let result = with_store_policy(
            || {
                let attempts = &attempts;
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"))
                    } else {
                        Ok("ok")
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = with_jitter(base);
            assert!(jittered >= Duration::from_secs_f64(8.5));
            assert!(jittered <= Duration::from_secs_f64(11.5));
        }
    }
}
