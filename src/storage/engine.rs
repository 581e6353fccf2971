use super::item::StoredItem;
use crate::core::DocumentStatus;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Physical key of one resource version: hash key plus version number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub hash_key: String,
    pub vid: u64,
}

impl ItemKey {
    pub fn new(hash_key: impl Into<String>, vid: u64) -> Self {
        Self {
            hash_key: hash_key.into(),
            vid,
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.hash_key, self.vid)
    }
}

/// Status precondition evaluated atomically with the write it guards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusGuard {
    /// Row holds `expected`, or holds a transitional status whose lock
    /// expired before `now_ms`.
    ExpectedOrExpired { expected: DocumentStatus, now_ms: i64 },
    /// Row holds any of the listed statuses.
    AnyOf(Vec<DocumentStatus>),
}

impl StatusGuard {
    pub fn admits(&self, status: DocumentStatus, lock_end_ts: i64) -> bool {
        match self {
            StatusGuard::ExpectedOrExpired { expected, now_ms } => {
                status == *expected || (status.is_transitional() && lock_end_ts < *now_ms)
            }
            StatusGuard::AnyOf(allowed) => allowed.contains(&status),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    Always,
    /// Fail unless no item exists under the key
    IfAbsent,
}

/// Conditional status transition of an existing row.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub key: ItemKey,
    /// Row must belong to this resource type
    pub resource_type: String,
    pub new_status: DocumentStatus,
    pub lock_end_ts: i64,
    pub guard: StatusGuard,
    /// Drop the active-subscription marker along with the transition
    pub clear_subscription: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        item: StoredItem,
        condition: PutCondition,
    },
    Delete {
        key: ItemKey,
    },
    UpdateStatus(StatusUpdate),
}

impl WriteOp {
    pub fn key(&self) -> ItemKey {
        match self {
            WriteOp::Put { item, .. } => item.key(),
            WriteOp::Delete { key } => key.clone(),
            WriteOp::UpdateStatus(update) => update.key.clone(),
        }
    }
}

/// Unconditional status assignment used by best-effort batches.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusStatement {
    pub key: ItemKey,
    pub new_status: DocumentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementError {
    pub code: String,
    pub message: String,
}

impl fmt::Display for StatementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Why one item of a cancelled transaction was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancellationReason {
    None,
    ConditionalCheckFailed,
    Validation(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("The conditional request failed")]
    ConditionalCheckFailed,

    #[error("Transaction cancelled: {reasons:?}")]
    TransactionCanceled { reasons: Vec<CancellationReason> },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// True when the store refused the write because a guard did not hold,
    /// i.e. another writer got there first.
    pub fn is_conditional_failure(&self) -> bool {
        match self {
            StoreError::ConditionalCheckFailed => true,
            StoreError::TransactionCanceled { reasons } => reasons
                .iter()
                .any(|reason| *reason == CancellationReason::ConditionalCheckFailed),
            _ => false,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Document store primitives consumed by the persistence core.
///
/// The store offers no isolation beyond single calls: a transactional
/// write is all-or-nothing across at most a bounded number of items, and
/// everything else is evaluated item by item.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Point get of one version
    async fn get_item(&self, key: &ItemKey) -> StoreResult<Option<StoredItem>>;

    /// Single conditional put
    async fn put_item(&self, item: StoredItem, condition: PutCondition) -> StoreResult<()>;

    /// Single conditional status transition
    async fn update_status(&self, update: StatusUpdate) -> StoreResult<()>;

    /// Up to `limit` most recent versions of `resource_type` under
    /// `hash_key`, newest first
    async fn query_versions(
        &self,
        hash_key: &str,
        resource_type: &str,
        limit: usize,
    ) -> StoreResult<Vec<StoredItem>>;

    /// All-or-nothing conditional multi-item write
    async fn transact_write(&self, ops: Vec<WriteOp>) -> StoreResult<()>;

    /// Multi-item point get, results aligned with `keys`
    async fn transact_get(&self, keys: Vec<ItemKey>) -> StoreResult<Vec<Option<StoredItem>>>;

    /// Best-effort unconditional puts; returns the items left unprocessed
    async fn batch_write(&self, items: Vec<StoredItem>) -> StoreResult<Vec<StoredItem>>;

    /// Best-effort status statements, one optional error per statement
    async fn batch_execute(
        &self,
        statements: Vec<StatusStatement>,
    ) -> StoreResult<Vec<Option<StatementError>>>;
}
