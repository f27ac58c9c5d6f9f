//! Load balancer tick tests against a recording controller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use changeling::mock::InMemoryLeaseStore;
use changeling::{
    BalancingStrategy, CreateOutcome, EqualPartitionsStrategy, FeedResult, Lease, LeaseManager,
    LoadBalancer, PartitionLifecycle,
};

const EXPIRATION: Duration = Duration::from_secs(60);

/// Records add/remove calls and mirrors them into an owned set, without
/// spawning any supervisors.
#[derive(Default)]
struct RecordingController {
    owned: Mutex<Vec<String>>,
    added: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl RecordingController {
    fn added(&self) -> Vec<String> {
        self.added.lock().unwrap().clone()
    }

    fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PartitionLifecycle for RecordingController {
    async fn add(&self, lease: Lease) -> FeedResult<()> {
        self.added.lock().unwrap().push(lease.partition_id.clone());
        self.owned.lock().unwrap().push(lease.partition_id);
        Ok(())
    }

    async fn remove(&self, partition_id: &str) -> FeedResult<()> {
        self.removed.lock().unwrap().push(partition_id.to_string());
        self.owned.lock().unwrap().retain(|p| p != partition_id);
        Ok(())
    }

    async fn shutdown(&self) -> FeedResult<()> {
        self.owned.lock().unwrap().clear();
        Ok(())
    }

    fn owned_partitions(&self) -> Vec<String> {
        self.owned.lock().unwrap().clone()
    }
}

async fn seeded_manager(
    store: &Arc<InMemoryLeaseStore>,
    host: &str,
    partitions: usize,
) -> Arc<LeaseManager> {
    let manager = Arc::new(LeaseManager::new(store.clone(), "cf", host, EXPIRATION));
    for index in 0..partitions {
        if let CreateOutcome::AlreadyExists = manager
            .create_if_absent(&index.to_string(), None)
            .await
            .unwrap()
        {
            // Another test host seeded it first; fine.
        }
    }
    manager
}

fn balancer(
    manager: Arc<LeaseManager>,
    controller: Arc<RecordingController>,
    max_partitions: usize,
) -> LoadBalancer {
    let strategy: Arc<dyn BalancingStrategy> =
        Arc::new(EqualPartitionsStrategy::new(EXPIRATION, 0, max_partitions));
    LoadBalancer::new(manager, controller, strategy, Duration::from_millis(100))
}

#[tokio::test]
async fn tick_acquires_every_unowned_partition() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let manager = seeded_manager(&store, "host-a", 4).await;
    let controller = Arc::new(RecordingController::default());

    balancer(manager, controller.clone(), 0).tick().await.unwrap();

    let mut added = controller.added();
    added.sort();
    assert_eq!(added, vec!["0", "1", "2", "3"]);
    assert!(controller.removed().is_empty());
}

#[tokio::test]
async fn tick_respects_max_partition_count() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let manager = seeded_manager(&store, "host-a", 6).await;
    let controller = Arc::new(RecordingController::default());

    balancer(manager, controller.clone(), 2).tick().await.unwrap();

    assert_eq!(controller.added().len(), 2);
}

#[tokio::test]
async fn tick_is_stable_once_converged() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let manager = seeded_manager(&store, "host-a", 4).await;
    let controller = Arc::new(RecordingController::default());
    let balancer = balancer(manager.clone(), controller.clone(), 0);

    balancer.tick().await.unwrap();
    // The recording controller does not acquire, so acquire ourselves to
    // simulate running supervisors.
    for lease in manager.list_all().await.unwrap() {
        manager.acquire(&lease).await.unwrap();
    }

    balancer.tick().await.unwrap();
    // Second tick: everything already owned and supervised, nothing changes.
    assert_eq!(controller.added().len(), 4);
    assert!(controller.removed().is_empty());
}

#[tokio::test]
async fn tick_removes_partitions_rebalanced_away() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let manager_a = seeded_manager(&store, "host-a", 4).await;
    let manager_b = Arc::new(LeaseManager::new(store.clone(), "cf", "host-b", EXPIRATION));
    let controller = Arc::new(RecordingController::default());
    let balancer_a = balancer(manager_a.clone(), controller.clone(), 0);

    // host-a converges on all four partitions.
    balancer_a.tick().await.unwrap();
    for lease in manager_a.list_all().await.unwrap() {
        manager_a.acquire(&lease).await.unwrap();
    }

    // host-b steals two (they are overloaded relative to a two-host fleet).
    for lease in manager_a.list_all().await.unwrap().iter().take(2) {
        manager_b.acquire(lease).await.unwrap();
    }

    // host-a's next tick drops the stolen partitions.
    balancer_a.tick().await.unwrap();
    let mut removed = controller.removed();
    removed.sort();
    assert_eq!(removed.len(), 2);
    assert_eq!(controller.owned_partitions().len(), 2);
}

#[tokio::test]
async fn two_balancers_converge_without_overlap() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let manager_a = seeded_manager(&store, "host-a", 4).await;
    let manager_b = Arc::new(LeaseManager::new(store.clone(), "cf", "host-b", EXPIRATION));
    let controller_a = Arc::new(RecordingController::default());
    let controller_b = Arc::new(RecordingController::default());
    let balancer_a = balancer(manager_a.clone(), controller_a.clone(), 2);
    let balancer_b = balancer(manager_b.clone(), controller_b.clone(), 2);

    // Alternate ticks, acquiring what each controller was told to add, until
    // both hosts stabilize.
    for _ in 0..4 {
        balancer_a.tick().await.unwrap();
        for partition in controller_a.owned_partitions() {
            let leases = manager_a.list_all().await.unwrap();
            if let Some(lease) = leases
                .iter()
                .find(|l| l.partition_id == partition && !l.is_owned_by("host-a"))
            {
                let _ = manager_a.acquire(lease).await;
            }
        }
        balancer_b.tick().await.unwrap();
        for partition in controller_b.owned_partitions() {
            let leases = manager_b.list_all().await.unwrap();
            if let Some(lease) = leases
                .iter()
                .find(|l| l.partition_id == partition && !l.is_owned_by("host-b"))
            {
                let _ = manager_b.acquire(lease).await;
            }
        }
    }

    let owned_a = controller_a.owned_partitions();
    let owned_b = controller_b.owned_partitions();
    assert_eq!(owned_a.len() + owned_b.len(), 4, "a={owned_a:?} b={owned_b:?}");
    assert!(owned_a.iter().all(|p| !owned_b.contains(p)));
}
