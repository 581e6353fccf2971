#![allow(dead_code)]

use bundledb::storage::item::prep_item_for_insert;
use bundledb::storage::WriteContext;
use bundledb::{DocumentStatus, InMemoryStore, StoredItem};
use serde_json::Value;

/// Insert one version row directly into `store`.
pub async fn seed(
    store: &InMemoryStore,
    resource_type: &str,
    id: &str,
    vid: u64,
    status: DocumentStatus,
    resource: Value,
) -> StoredItem {
    seed_for_tenant(store, None, resource_type, id, vid, status, resource).await
}

pub async fn seed_for_tenant(
    store: &InMemoryStore,
    tenant_id: Option<&str>,
    resource_type: &str,
    id: &str,
    vid: u64,
    status: DocumentStatus,
    resource: Value,
) -> StoredItem {
    let ctx = WriteContext::new(tenant_id, 35_000);
    let item = prep_item_for_insert(&resource, resource_type, id, vid, status, &ctx).unwrap();
    store.seed(item.clone()).await;
    item
}

/// Status of every version of `hash_key`, oldest first.
pub async fn statuses(store: &InMemoryStore, hash_key: &str) -> Vec<(u64, DocumentStatus)> {
    store
        .versions(hash_key)
        .await
        .into_iter()
        .map(|item| (item.vid, item.document_status))
        .collect()
}

pub async fn in_flight_rows(store: &InMemoryStore) -> usize {
    let mut count = 0;
    for status in [
        DocumentStatus::Pending,
        DocumentStatus::Locked,
        DocumentStatus::PendingDelete,
    ] {
        count += store.items_with_status(status).await.len();
    }
    count
}
