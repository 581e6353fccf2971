use super::engine::{
    CancellationReason, ItemKey, PutCondition, StatementError, StatusStatement, StatusUpdate,
    StoreError, StoreResult, VersionedStore, WriteOp,
};
use super::item::StoredItem;
use crate::core::DocumentStatus;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Items one multi-item call accepts
pub const MAX_ITEMS_PER_CALL: usize = 25;

type WritePredicate = Arc<dyn Fn(&WriteOp) -> bool + Send + Sync>;

/// Failures and latency injected into an [`InMemoryStore`].
///
/// Call numbers are 1-based and count every call of that kind since the
/// store was created.
#[derive(Default)]
struct FaultPlan {
    failing_writes: HashMap<usize, StoreError>,
    delayed_writes: HashMap<usize, Duration>,
    poisoned_ops: Vec<WritePredicate>,
    query_delay: Option<Duration>,
    failing_batches: HashMap<usize, StoreError>,
    unprocessed: HashSet<String>,
}

/// Number of calls made per primitive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub transact_write: usize,
    pub transact_get: usize,
    pub query_versions: usize,
    pub batch_write: usize,
    pub batch_execute: usize,
}

#[derive(Default)]
struct Counters {
    transact_write: AtomicUsize,
    transact_get: AtomicUsize,
    query_versions: AtomicUsize,
    batch_write: AtomicUsize,
    batch_execute: AtomicUsize,
}

/// Versioned document store kept in process memory.
///
/// Rows are grouped by hash key and ordered by version, so the newest
/// version of a resource is the last entry of its group. Each call takes the
/// table lock once, which makes every single call atomic; nothing spans calls.
#[derive(Default)]
pub struct InMemoryStore {
    /// hash key -> vid -> row
    rows: RwLock<BTreeMap<String, BTreeMap<u64, StoredItem>>>,
    faults: Mutex<FaultPlan>,
    counters: Counters,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- fault injection ---------------------------------------------------

    /// Fail the `call`-th transactional write with `error`
    pub async fn fail_transact_write(&self, call: usize, error: StoreError) {
        self.faults.lock().await.failing_writes.insert(call, error);
    }

    /// Hold the `call`-th transactional write for `delay` before applying it
    pub async fn delay_transact_write(&self, call: usize, delay: Duration) {
        self.faults.lock().await.delayed_writes.insert(call, delay);
    }

    /// Fail every transactional write containing an op matching `predicate`
    pub async fn fail_writes_when<F>(&self, predicate: F)
    where
        F: Fn(&WriteOp) -> bool + Send + Sync + 'static,
    {
        self.faults.lock().await.poisoned_ops.push(Arc::new(predicate));
    }

    /// Hold every version query for `delay`
    pub async fn delay_queries(&self, delay: Duration) {
        self.faults.lock().await.query_delay = Some(delay);
    }

    /// Fail the `call`-th batch write with `error`
    pub async fn fail_batch_write(&self, call: usize, error: StoreError) {
        self.faults.lock().await.failing_batches.insert(call, error);
    }

    /// Hand back batch puts for `hash_key` as unprocessed
    pub async fn leave_unprocessed(&self, hash_key: impl Into<String>) {
        self.faults.lock().await.unprocessed.insert(hash_key.into());
    }

    // --- inspection --------------------------------------------------------

    /// Insert a row as-is, bypassing every condition
    pub async fn seed(&self, item: StoredItem) {
        self.rows
            .write()
            .await
            .entry(item.hash_key.clone())
            .or_default()
            .insert(item.vid, item);
    }

    /// All versions under `hash_key`, oldest first
    pub async fn versions(&self, hash_key: &str) -> Vec<StoredItem> {
        self.rows
            .read()
            .await
            .get(hash_key)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn items_with_status(&self, status: DocumentStatus) -> Vec<StoredItem> {
        self.rows
            .read()
            .await
            .values()
            .flat_map(|versions| versions.values())
            .filter(|item| item.document_status == status)
            .cloned()
            .collect()
    }

    pub async fn row_count(&self) -> usize {
        self.rows.read().await.values().map(BTreeMap::len).sum()
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            transact_write: self.counters.transact_write.load(Ordering::SeqCst),
            transact_get: self.counters.transact_get.load(Ordering::SeqCst),
            query_versions: self.counters.query_versions.load(Ordering::SeqCst),
            batch_write: self.counters.batch_write.load(Ordering::SeqCst),
            batch_execute: self.counters.batch_execute.load(Ordering::SeqCst),
        }
    }

    // --- evaluation --------------------------------------------------------

    fn check_call_size(len: usize) -> StoreResult<()> {
        if len > MAX_ITEMS_PER_CALL {
            return Err(StoreError::Validation(format!(
                "Member must have length less than or equal to {MAX_ITEMS_PER_CALL}"
            )));
        }
        Ok(())
    }

    fn check_distinct_keys(
        keys: impl IntoIterator<Item = ItemKey>,
        message: &str,
    ) -> StoreResult<()> {
        let mut seen = HashSet::new();
        if keys.into_iter().all(|key| seen.insert(key)) {
            Ok(())
        } else {
            Err(StoreError::Validation(message.to_string()))
        }
    }

    fn check_put(
        rows: &BTreeMap<String, BTreeMap<u64, StoredItem>>,
        item: &StoredItem,
        condition: PutCondition,
    ) -> bool {
        match condition {
            PutCondition::Always => true,
            PutCondition::IfAbsent => rows
                .get(&item.hash_key)
                .is_none_or(|versions| !versions.contains_key(&item.vid)),
        }
    }

    fn check_update(
        rows: &BTreeMap<String, BTreeMap<u64, StoredItem>>,
        update: &StatusUpdate,
    ) -> bool {
        rows.get(&update.key.hash_key)
            .and_then(|versions| versions.get(&update.key.vid))
            .is_some_and(|row| {
                row.resource_type == update.resource_type
                    && update.guard.admits(row.document_status, row.lock_end_ts)
            })
    }

    fn apply_update(
        rows: &mut BTreeMap<String, BTreeMap<u64, StoredItem>>,
        update: &StatusUpdate,
    ) {
        if let Some(row) = rows
            .get_mut(&update.key.hash_key)
            .and_then(|versions| versions.get_mut(&update.key.vid))
        {
            row.document_status = update.new_status;
            row.lock_end_ts = update.lock_end_ts;
            if update.clear_subscription {
                row.subscription_status = None;
            }
        }
    }

    async fn injected_write_fault(&self, call: usize, ops: &[WriteOp]) -> StoreResult<()> {
        let (delay, failure) = {
            let mut faults = self.faults.lock().await;
            let delay = faults.delayed_writes.remove(&call);
            let mut failure = faults.failing_writes.remove(&call);
            if failure.is_none()
                && ops
                    .iter()
                    .any(|op| faults.poisoned_ops.iter().any(|poisoned| poisoned(op)))
            {
                failure = Some(StoreError::Unavailable("injected write fault".into()));
            }
            (delay, failure)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        failure.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl VersionedStore for InMemoryStore {
    async fn get_item(&self, key: &ItemKey) -> StoreResult<Option<StoredItem>> {
        Ok(self
            .rows
            .read()
            .await
            .get(&key.hash_key)
            .and_then(|versions| versions.get(&key.vid))
            .cloned())
    }

    async fn put_item(&self, item: StoredItem, condition: PutCondition) -> StoreResult<()> {
        let mut rows = self.rows.write().await;
        if !Self::check_put(&rows, &item, condition) {
            return Err(StoreError::ConditionalCheckFailed);
        }
        rows.entry(item.hash_key.clone())
            .or_default()
            .insert(item.vid, item);
        Ok(())
    }

    async fn update_status(&self, update: StatusUpdate) -> StoreResult<()> {
        let mut rows = self.rows.write().await;
        if !Self::check_update(&rows, &update) {
            return Err(StoreError::ConditionalCheckFailed);
        }
        Self::apply_update(&mut rows, &update);
        Ok(())
    }

    async fn query_versions(
        &self,
        hash_key: &str,
        resource_type: &str,
        limit: usize,
    ) -> StoreResult<Vec<StoredItem>> {
        self.counters.query_versions.fetch_add(1, Ordering::SeqCst);
        let delay = self.faults.lock().await.query_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let rows = self.rows.read().await;
        Ok(rows
            .get(hash_key)
            .map(|versions| {
                versions
                    .values()
                    .rev()
                    .filter(|item| item.resource_type == resource_type)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        let call = self.counters.transact_write.fetch_add(1, Ordering::SeqCst) + 1;
        Self::check_call_size(ops.len())?;

        Self::check_distinct_keys(
            ops.iter().map(WriteOp::key),
            "Transaction request cannot include multiple operations on one item",
        )?;

        self.injected_write_fault(call, &ops).await?;

        let mut rows = self.rows.write().await;
        let reasons: Vec<CancellationReason> = ops
            .iter()
            .map(|op| {
                let admitted = match op {
                    WriteOp::Put { item, condition } => Self::check_put(&rows, item, *condition),
                    WriteOp::Delete { .. } => true,
                    WriteOp::UpdateStatus(update) => Self::check_update(&rows, update),
                };
                if admitted {
                    CancellationReason::None
                } else {
                    CancellationReason::ConditionalCheckFailed
                }
            })
            .collect();
        if reasons.iter().any(|reason| *reason != CancellationReason::None) {
            return Err(StoreError::TransactionCanceled { reasons });
        }

        for op in ops {
            match op {
                WriteOp::Put { item, .. } => {
                    rows.entry(item.hash_key.clone())
                        .or_default()
                        .insert(item.vid, item);
                }
                WriteOp::Delete { key } => {
                    if let Some(versions) = rows.get_mut(&key.hash_key) {
                        versions.remove(&key.vid);
                        if versions.is_empty() {
                            rows.remove(&key.hash_key);
                        }
                    }
                }
                WriteOp::UpdateStatus(update) => Self::apply_update(&mut rows, &update),
            }
        }
        Ok(())
    }

    async fn transact_get(&self, keys: Vec<ItemKey>) -> StoreResult<Vec<Option<StoredItem>>> {
        self.counters.transact_get.fetch_add(1, Ordering::SeqCst);
        Self::check_call_size(keys.len())?;

        let rows = self.rows.read().await;
        Ok(keys
            .iter()
            .map(|key| {
                rows.get(&key.hash_key)
                    .and_then(|versions| versions.get(&key.vid))
                    .cloned()
            })
            .collect())
    }

    async fn batch_write(&self, items: Vec<StoredItem>) -> StoreResult<Vec<StoredItem>> {
        let call = self.counters.batch_write.fetch_add(1, Ordering::SeqCst) + 1;
        Self::check_call_size(items.len())?;
        Self::check_distinct_keys(
            items.iter().map(StoredItem::key),
            "Provided list of item keys contains duplicates",
        )?;

        let (failure, unprocessed_keys) = {
            let mut faults = self.faults.lock().await;
            (faults.failing_batches.remove(&call), faults.unprocessed.clone())
        };
        if let Some(error) = failure {
            return Err(error);
        }

        let mut rows = self.rows.write().await;
        let mut unprocessed = Vec::new();
        for item in items {
            if unprocessed_keys.contains(&item.hash_key) {
                unprocessed.push(item);
                continue;
            }
            rows.entry(item.hash_key.clone())
                .or_default()
                .insert(item.vid, item);
        }
        Ok(unprocessed)
    }

    async fn batch_execute(
        &self,
        statements: Vec<StatusStatement>,
    ) -> StoreResult<Vec<Option<StatementError>>> {
        self.counters.batch_execute.fetch_add(1, Ordering::SeqCst);
        Self::check_call_size(statements.len())?;

        let now_ms = Utc::now().timestamp_millis();
        let mut rows = self.rows.write().await;
        Ok(statements
            .iter()
            .map(|statement| {
                let row = rows
                    .get_mut(&statement.key.hash_key)
                    .and_then(|versions| versions.get_mut(&statement.key.vid));
                match row {
                    Some(row) => {
                        row.document_status = statement.new_status;
                        row.lock_end_ts = now_ms;
                        if statement.new_status == DocumentStatus::Deleted {
                            row.subscription_status = None;
                        }
                        None
                    }
                    None => Some(StatementError {
                        code: "ConditionalCheckFailed".into(),
                        message: "The conditional request failed".into(),
                    }),
                }
            })
            .collect())
    }
}
