//! Bootstrap protocol tests: exactly-once lease creation under racing hosts,
//! init-lock behavior, and marker idempotence.

use std::sync::Arc;
use std::time::Duration;

use changeling::mock::{CountingObserver, InMemoryFeed, InMemoryLeaseStore};
use changeling::{
    ChangeFeedHost, ChangeObserver, LeaseStore, LeaseStoreClient, ProcessorConfig,
};

fn test_config(name: &str) -> ProcessorConfig {
    ProcessorConfig {
        host_name: Some(name.to_string()),
        lease_expiration_interval: Duration::from_secs(5),
        lease_renew_interval: Duration::from_millis(500),
        lease_acquire_interval: Duration::from_millis(200),
        feed_poll_delay: Duration::from_millis(20),
        bootstrap_lock_ttl: Duration::from_secs(2),
        bootstrap_retry_delay: Duration::from_millis(50),
        ..ProcessorConfig::with_prefix("cf")
    }
}

fn factory(observer: Arc<CountingObserver>) -> Arc<dyn changeling::ObserverFactory> {
    Arc::new(move |_partition: &str| observer.clone() as Arc<dyn ChangeObserver>)
}

#[tokio::test]
async fn racing_hosts_create_each_lease_exactly_once() {
    let feed = Arc::new(InMemoryFeed::new());
    for index in 0..4 {
        feed.add_partition(&format!("p{index}"));
    }
    let store = Arc::new(InMemoryLeaseStore::new());

    let host_a = ChangeFeedHost::new(
        test_config("host-a"),
        feed.clone(),
        store.clone(),
        factory(Arc::new(CountingObserver::new())),
    )
    .unwrap();
    let host_b = ChangeFeedHost::new(
        test_config("host-b"),
        feed.clone(),
        store.clone(),
        factory(Arc::new(CountingObserver::new())),
    )
    .unwrap();

    let (started_a, started_b) = tokio::join!(host_a.start(), host_b.start());
    started_a.unwrap();
    started_b.unwrap();

    // Exactly one lease per partition plus the marker; the lock is gone.
    let ids = store.document_ids();
    assert_eq!(
        ids,
        vec![
            "cf..p0".to_string(),
            "cf..p1".to_string(),
            "cf..p2".to_string(),
            "cf..p3".to_string(),
            "cf.info".to_string(),
        ]
    );

    host_a.shutdown().await.unwrap();
    host_b.shutdown().await.unwrap();
}

#[tokio::test]
async fn init_lock_blocks_second_holder_until_released() {
    let client = Arc::new(InMemoryLeaseStore::new());
    let store = LeaseStore::new(client.clone(), "cf");

    assert!(!store.is_initialized().await.unwrap());
    assert!(store.acquire_init_lock(Duration::from_secs(30)).await.unwrap());
    assert!(!store.acquire_init_lock(Duration::from_secs(30)).await.unwrap());

    store.release_init_lock().await.unwrap();
    assert!(store.acquire_init_lock(Duration::from_secs(30)).await.unwrap());
}

#[tokio::test]
async fn init_lock_ttl_expires() {
    let client = Arc::new(InMemoryLeaseStore::new());
    let store = LeaseStore::new(client, "cf");

    assert!(
        store
            .acquire_init_lock(Duration::from_millis(20))
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(40)).await;
    // The dead holder's lock no longer blocks anyone.
    assert!(
        store
            .acquire_init_lock(Duration::from_secs(30))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn marker_is_idempotent_and_permanent() {
    let client = Arc::new(InMemoryLeaseStore::new());
    let store = LeaseStore::new(client.clone(), "cf");

    store.mark_initialized().await.unwrap();
    // Marking again is success, not conflict.
    store.mark_initialized().await.unwrap();
    assert!(store.is_initialized().await.unwrap());

    // Releasing a missing lock is success too.
    store.release_init_lock().await.unwrap();

    // The marker survives as a plain document.
    assert!(client.read("cf.info").await.is_ok());
}

#[tokio::test]
async fn late_host_skips_bootstrap_work() {
    let feed = Arc::new(InMemoryFeed::new());
    feed.add_partition("p0");
    feed.push_records("p0", 10);
    let store = Arc::new(InMemoryLeaseStore::new());

    let observer_a = Arc::new(CountingObserver::new());
    let host_a = ChangeFeedHost::new(
        test_config("host-a"),
        feed.clone(),
        store.clone(),
        factory(observer_a.clone()),
    )
    .unwrap();
    host_a.start().await.unwrap();
    let after_first = store.document_count();

    // A second host starting later must not create anything new.
    let host_b = ChangeFeedHost::new(
        test_config("host-b"),
        feed.clone(),
        store.clone(),
        factory(Arc::new(CountingObserver::new())),
    )
    .unwrap();
    host_b.start().await.unwrap();
    assert_eq!(store.document_count(), after_first);

    host_a.shutdown().await.unwrap();
    host_b.shutdown().await.unwrap();
}
