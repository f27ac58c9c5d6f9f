//! Partition split handling: parent retirement, child lease seeding, and
//! checkpoint continuity across the split.

use std::sync::Arc;
use std::time::Duration;

use changeling::mock::{CountingObserver, InMemoryFeed, InMemoryLeaseStore};
use changeling::{ChangeFeedHost, ChangeObserver, CloseReason, ProcessorConfig};

fn test_config() -> ProcessorConfig {
    ProcessorConfig {
        host_name: Some("host-a".to_string()),
        lease_expiration_interval: Duration::from_secs(5),
        lease_renew_interval: Duration::from_millis(500),
        lease_acquire_interval: Duration::from_millis(200),
        feed_poll_delay: Duration::from_millis(20),
        bootstrap_lock_ttl: Duration::from_secs(2),
        bootstrap_retry_delay: Duration::from_millis(50),
        ..ProcessorConfig::with_prefix("cf")
    }
}

async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}

#[tokio::test]
async fn split_retires_parent_and_seeds_children_from_checkpoint() {
    let feed = Arc::new(InMemoryFeed::new());
    feed.add_partition("p");
    feed.push_records("p", 40);
    let store = Arc::new(InMemoryLeaseStore::new());
    let observer = Arc::new(CountingObserver::new());
    let observer_for_factory = observer.clone();

    let host = ChangeFeedHost::new(
        test_config(),
        feed.clone(),
        store.clone(),
        Arc::new(move |_partition: &str| {
            observer_for_factory.clone() as Arc<dyn ChangeObserver>
        }),
    )
    .unwrap();
    host.start().await.unwrap();

    // Drain the parent so its checkpoint sits at the split token.
    assert!(
        wait_until(Duration::from_secs(10), || observer.processed_records() == 40).await,
        "processed {}",
        observer.processed_records()
    );

    // The store replaces the parent with two children.
    feed.split("p", &["p1", "p2"]);

    // The parent closes with Split exactly once and its lease is deleted.
    assert!(
        wait_until(Duration::from_secs(10), || {
            observer
                .close_reasons()
                .iter()
                .any(|(partition, reason)| partition == "p" && *reason == CloseReason::Split)
        })
        .await
    );
    let parent_splits = observer
        .close_reasons()
        .iter()
        .filter(|(partition, reason)| partition == "p" && *reason == CloseReason::Split)
        .count();
    assert_eq!(parent_splits, 1);

    // Child leases exist, seeded with the parent's final checkpoint.
    assert!(
        wait_until(Duration::from_secs(10), || {
            store.document_ids().contains(&"cf..p1".to_string())
                && store.document_ids().contains(&"cf..p2".to_string())
                && !store.document_ids().contains(&"cf..p".to_string())
        })
        .await,
        "documents: {:?}",
        store.document_ids()
    );

    let leases = host.lease_manager().list_all().await.unwrap();
    for child in ["p1", "p2"] {
        let lease = leases
            .iter()
            .find(|l| l.partition_id == child)
            .unwrap_or_else(|| panic!("missing lease for {child}"));
        assert_eq!(
            lease.continuation_token.as_ref().map(|t| t.as_str()),
            Some("40"),
            "child {child} not seeded from parent checkpoint"
        );
    }

    // New records on the children flow through, resuming at the split token.
    feed.push_records("p1", 5);
    feed.push_records("p2", 7);
    assert!(
        wait_until(Duration::from_secs(10), || observer.processed_records() == 52).await,
        "processed {}",
        observer.processed_records()
    );

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn records_after_split_are_delivered_exactly_from_children() {
    let feed = Arc::new(InMemoryFeed::new());
    feed.add_partition("p");
    feed.push_records("p", 10);
    let store = Arc::new(InMemoryLeaseStore::new());
    let observer = Arc::new(CountingObserver::new());
    let observer_for_factory = observer.clone();

    let host = ChangeFeedHost::new(
        test_config(),
        feed.clone(),
        store,
        Arc::new(move |_partition: &str| {
            observer_for_factory.clone() as Arc<dyn ChangeObserver>
        }),
    )
    .unwrap();
    host.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(10), || observer.processed_records() == 10).await);

    feed.split("p", &["left", "right"]);
    feed.push_records("left", 4);
    feed.push_records("right", 6);

    // 10 parent records + 10 child records; nothing redelivered across the
    // split because the children resume at the parent's checkpoint.
    assert!(
        wait_until(Duration::from_secs(10), || observer.processed_records() == 20).await,
        "processed {}",
        observer.processed_records()
    );

    // Both children are now supervised in place of the parent.
    assert!(
        wait_until(Duration::from_secs(5), || {
            let mut owned = host.owned_partitions();
            owned.sort();
            owned == vec!["left".to_string(), "right".to_string()]
        })
        .await,
        "owned: {:?}",
        host.owned_partitions()
    );

    host.shutdown().await.unwrap();
}
