/// Transaction failure tests
///
/// Rollback, lock conflicts, lock expiry and the time budget, driven by
/// faults injected into the in-memory store
/// Run with: cargo test --test transaction_failure_tests

mod common;

use bundledb::storage::{StoreError, VersionedStore, WriteOp};
use bundledb::{
    BundleEntryRequest, BundleRequest, DocumentStatus, ErrorType, InMemoryStore,
    PersistenceConfig, ResourceReader, TransactionCoordinator, VersionedLinks,
};
use common::{in_flight_rows, seed, statuses};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

const BUDGET_EXCEEDED: &str = "Transaction time is greater than max allowed code execution time. Please reduce your bundle size by sending fewer Bundle entries.";

fn coordinator(store: &Arc<InMemoryStore>) -> TransactionCoordinator {
    TransactionCoordinator::new(store.clone(), PersistenceConfig::new())
}

fn with_budget(store: &Arc<InMemoryStore>, budget: Duration) -> TransactionCoordinator {
    TransactionCoordinator::new(
        store.clone(),
        PersistenceConfig::new().max_execution_time(budget),
    )
}

#[tokio::test]
async fn test_failed_staging_chunk_rolls_back_everything() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, "Patient", "p1", 1, DocumentStatus::Available, json!({"active": false})).await;
    store
        .fail_writes_when(|op| matches!(op, WriteOp::Put { item, .. } if item.resource_type == "Poison"))
        .await;

    // 26 creates + the poisoned one + an update: the second staging chunk fails
    let mut entries: Vec<BundleEntryRequest> = (0..26)
        .map(|n| BundleEntryRequest::create("Observation", json!({"valueInteger": n})))
        .collect();
    entries.push(BundleEntryRequest::create("Poison", json!({})));
    entries.push(BundleEntryRequest::update("Patient", "p1", json!({"active": true})));

    let response = coordinator(&store)
        .transaction(BundleRequest::new(entries))
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.error_type, Some(ErrorType::SystemError));
    assert_eq!(response.message, "Failed to stage resources for transaction");
    assert_eq!(store.row_count().await, 1);
    assert_eq!(statuses(&store, "p1").await, vec![(1, DocumentStatus::Available)]);
    assert_eq!(in_flight_rows(&store).await, 0);
}

#[tokio::test]
async fn test_racing_updates_one_wins_one_conflicts() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, "Patient", "p1", 3, DocumentStatus::Available, json!({"n": 3})).await;
    // both coordinators read v3 before either of them locks it
    store.delay_queries(Duration::from_millis(50)).await;

    let first = coordinator(&store);
    let second = coordinator(&store);
    let update = |n: u64| {
        BundleRequest::new(vec![BundleEntryRequest::update("Patient", "p1", json!({"n": n}))])
    };

    let (a, b) = tokio::join!(first.transaction(update(4)), second.transaction(update(5)));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.success ^ b.success, "exactly one transaction must win");
    let loser = if a.success { &b } else { &a };
    assert_eq!(loser.error_type, Some(ErrorType::ConflictError));
    assert_eq!(loser.retry_after, Some(Duration::from_secs(35)));
    assert_eq!(
        loser.message,
        "Failed to lock resources for transaction due to conflict. Please try again after 35 seconds."
    );

    assert_eq!(
        statuses(&store, "p1").await,
        vec![(3, DocumentStatus::Deleted), (4, DocumentStatus::Available)]
    );
}

#[tokio::test]
async fn test_held_lock_blocks_and_expired_lock_is_stolen() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, "Patient", "held", 1, DocumentStatus::Locked, json!({})).await;
    let mut stale = seed(&store, "Patient", "stale", 1, DocumentStatus::Locked, json!({})).await;
    stale.lock_end_ts = 0;
    store.seed(stale).await;
    let coordinator = coordinator(&store);

    let blocked = coordinator
        .transaction(BundleRequest::new(vec![BundleEntryRequest::update(
            "Patient",
            "held",
            json!({"active": true}),
        )]))
        .await
        .unwrap();
    assert_eq!(blocked.error_type, Some(ErrorType::ConflictError));

    let stolen = coordinator
        .transaction(BundleRequest::new(vec![BundleEntryRequest::update(
            "Patient",
            "stale",
            json!({"active": true}),
        )]))
        .await
        .unwrap();
    assert!(stolen.success, "{}", stolen.message);
    assert_eq!(
        statuses(&store, "stale").await,
        vec![(1, DocumentStatus::Deleted), (2, DocumentStatus::Available)]
    );
}

#[tokio::test]
async fn test_lock_failure_releases_acquired_locks() {
    let store = Arc::new(InMemoryStore::new());
    let mut entries = Vec::new();
    for n in 0..30 {
        let id = format!("p{n}");
        seed(&store, "Patient", &id, 1, DocumentStatus::Available, json!({})).await;
        entries.push(BundleEntryRequest::update("Patient", id, json!({"active": true})));
    }
    store
        .fail_transact_write(2, StoreError::Unavailable("throttled".into()))
        .await;

    let response = coordinator(&store)
        .transaction(BundleRequest::new(entries))
        .await
        .unwrap();

    assert_eq!(response.error_type, Some(ErrorType::SystemError));
    assert_eq!(
        response.message,
        "Failed to lock resources for transaction. Please try again after 35 seconds."
    );
    assert_eq!(in_flight_rows(&store).await, 0);
    assert_eq!(store.items_with_status(DocumentStatus::Available).await.len(), 30);
}

#[tokio::test]
async fn test_budget_overrun_after_staging_rolls_back() {
    let store = Arc::new(InMemoryStore::new());
    store
        .delay_transact_write(1, Duration::from_millis(200))
        .await;
    let config = PersistenceConfig::new().max_execution_time(Duration::from_millis(50));
    let coordinator = TransactionCoordinator::new(store.clone(), config);

    let request = BundleRequest::new(vec![BundleEntryRequest::create(
        "Patient",
        json!({"active": true}),
    )])
    .started_at(Instant::now());
    let response = coordinator.transaction(request).await.unwrap();

    assert!(!response.success);
    assert_eq!(response.error_type, Some(ErrorType::UserError));
    assert_eq!(response.message, BUDGET_EXCEEDED);
    assert_eq!(store.row_count().await, 0);
    assert_eq!(store.items_with_status(DocumentStatus::Pending).await.len(), 0);
}

#[tokio::test]
async fn test_readers_see_previous_version_while_update_is_in_flight() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, "Patient", "p1", 1, DocumentStatus::Available, json!({"n": 1})).await;
    // calls: 1 lock, 2 stage, 3 commit
    store
        .delay_transact_write(3, Duration::from_millis(200))
        .await;
    let coordinator = Arc::new(coordinator(&store));
    let reader = ResourceReader::new(store.clone());

    let writer = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .transaction(BundleRequest::new(vec![BundleEntryRequest::update(
                    "Patient",
                    "p1",
                    json!({"n": 2}),
                )]))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        statuses(&store, "p1").await,
        vec![(1, DocumentStatus::Locked), (2, DocumentStatus::Pending)]
    );
    let during = reader.get_user_readable("Patient", "p1", None).await.unwrap();
    assert_eq!(during.vid, 1);
    assert_eq!(during.resource["n"], json!(1));

    let response = writer.await.unwrap().unwrap();
    assert!(response.success);
    let after = reader.get_user_readable("Patient", "p1", None).await.unwrap();
    assert_eq!(after.vid, 2);
    assert_eq!(after.resource["n"], json!(2));
}

#[tokio::test]
async fn test_store_primitives_are_shared_through_the_trait() {
    let store: Arc<dyn VersionedStore> = Arc::new(InMemoryStore::new());
    let coordinator = TransactionCoordinator::new(store.clone(), PersistenceConfig::new());
    let response = coordinator
        .transaction(BundleRequest::new(vec![BundleEntryRequest::create_with_id(
            "Patient",
            "p1",
            json!({}),
        )]))
        .await
        .unwrap();
    assert!(response.success);
    let versions = store.query_versions("p1", "Patient", 5).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].document_status, DocumentStatus::Available);
}

#[tokio::test]
async fn test_failed_release_does_not_keep_staged_rows() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, "Patient", "p1", 1, DocumentStatus::Available, json!({})).await;
    store
        .fail_writes_when(|op| matches!(op, WriteOp::Put { item, .. } if item.resource_type == "Poison"))
        .await;
    // every LOCKED -> AVAILABLE release is refused
    store
        .fail_writes_when(|op| {
            matches!(op, WriteOp::UpdateStatus(update) if update.new_status == DocumentStatus::Available)
        })
        .await;

    // the first staging chunk holds 25 creates, the second fails on the poison
    let mut entries: Vec<BundleEntryRequest> = (0..26)
        .map(|n| BundleEntryRequest::create("Observation", json!({"valueInteger": n})))
        .collect();
    entries.push(BundleEntryRequest::create("Poison", json!({})));
    entries.push(BundleEntryRequest::update("Patient", "p1", json!({"active": true})));

    let response = coordinator(&store)
        .transaction(BundleRequest::new(entries))
        .await
        .unwrap();

    assert_eq!(response.error_type, Some(ErrorType::SystemError));
    assert_eq!(store.items_with_status(DocumentStatus::Pending).await.len(), 0);
    assert_eq!(store.row_count().await, 1);
    // the unreleased lock is left for its TTL to recover
    assert_eq!(statuses(&store, "p1").await, vec![(1, DocumentStatus::Locked)]);
}

#[tokio::test]
async fn test_failed_stage_restores_deleted_resource() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, "Patient", "p1", 1, DocumentStatus::Available, json!({})).await;
    store
        .fail_writes_when(|op| matches!(op, WriteOp::Put { item, .. } if item.resource_type == "Poison"))
        .await;
    // one item per call, so the delete is staged while the create fails
    let config = PersistenceConfig::new().transaction_chunk_size(1);
    let coordinator = TransactionCoordinator::new(store.clone(), config);

    let response = coordinator
        .transaction(BundleRequest::new(vec![
            BundleEntryRequest::delete("Patient", "p1"),
            BundleEntryRequest::create("Poison", json!({})),
        ]))
        .await
        .unwrap();

    assert_eq!(response.error_type, Some(ErrorType::SystemError));
    assert_eq!(response.message, "Failed to stage resources for transaction");
    assert_eq!(statuses(&store, "p1").await, vec![(1, DocumentStatus::Available)]);
    assert_eq!(in_flight_rows(&store).await, 0);
}

#[tokio::test]
async fn test_budget_overrun_after_locking_releases_locks() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, "Patient", "p1", 1, DocumentStatus::Available, json!({})).await;
    store
        .delay_transact_write(1, Duration::from_millis(200))
        .await;

    let response = with_budget(&store, Duration::from_millis(50))
        .transaction(BundleRequest::new(vec![BundleEntryRequest::update(
            "Patient",
            "p1",
            json!({"active": true}),
        )]))
        .await
        .unwrap();

    assert_eq!(response.error_type, Some(ErrorType::UserError));
    assert_eq!(response.message, BUDGET_EXCEEDED);
    assert_eq!(statuses(&store, "p1").await, vec![(1, DocumentStatus::Available)]);
    // lock, then release; nothing was staged
    assert_eq!(store.calls().transact_write, 2);
}

#[tokio::test]
async fn test_budget_overrun_after_reference_resolution() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, "Organization", "o1", 1, DocumentStatus::Available, json!({})).await;
    // creates lock nothing, so only the reference lookup is slowed down
    store.delay_queries(Duration::from_millis(200)).await;
    let links = VersionedLinks::new().with_paths("Patient", ["managingOrganization.reference"]);
    let config = PersistenceConfig::new()
        .max_execution_time(Duration::from_millis(50))
        .versioned_links(links);
    let coordinator = TransactionCoordinator::new(store.clone(), config);

    let response = coordinator
        .transaction(BundleRequest::new(vec![BundleEntryRequest::create_with_id(
            "Patient",
            "p1",
            json!({"managingOrganization": {"reference": "Organization/o1"}}),
        )]))
        .await
        .unwrap();

    assert_eq!(response.error_type, Some(ErrorType::UserError));
    assert_eq!(response.message, BUDGET_EXCEEDED);
    assert_eq!(store.calls().transact_write, 0);
    assert_eq!(store.row_count().await, 1);
}

#[tokio::test]
async fn test_failed_stage_over_budget_reports_the_budget() {
    let store = Arc::new(InMemoryStore::new());
    store
        .delay_transact_write(1, Duration::from_millis(200))
        .await;
    store
        .fail_transact_write(1, StoreError::Unavailable("throttled".into()))
        .await;

    let response = with_budget(&store, Duration::from_millis(50))
        .transaction(BundleRequest::new(vec![BundleEntryRequest::create(
            "Patient",
            json!({}),
        )]))
        .await
        .unwrap();

    assert_eq!(response.error_type, Some(ErrorType::UserError));
    assert_eq!(response.message, BUDGET_EXCEEDED);
    assert_eq!(store.row_count().await, 0);
}

#[tokio::test]
async fn test_failed_lock_over_budget_reports_the_budget() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, "Patient", "p1", 1, DocumentStatus::Available, json!({})).await;
    store
        .delay_transact_write(1, Duration::from_millis(200))
        .await;
    store
        .fail_transact_write(1, StoreError::Unavailable("throttled".into()))
        .await;

    let response = with_budget(&store, Duration::from_millis(50))
        .transaction(BundleRequest::new(vec![BundleEntryRequest::update(
            "Patient",
            "p1",
            json!({"active": true}),
        )]))
        .await
        .unwrap();

    assert_eq!(response.error_type, Some(ErrorType::UserError));
    assert_eq!(response.message, BUDGET_EXCEEDED);
    assert_eq!(statuses(&store, "p1").await, vec![(1, DocumentStatus::Available)]);
}
