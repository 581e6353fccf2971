use crate::core::{DocumentStatus, Operation, ResourceKey, Result};
use crate::storage::params::{delete_item, status_update};
use crate::storage::{StatusGuard, WriteContext, WriteOp};

/// How a transaction came to hold a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRole {
    /// Existing version moved to LOCKED during the lock phase
    Reserved,
    /// New PENDING version written during staging
    Staged,
}

/// One row a transaction is responsible for settling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemLock {
    pub resource_type: String,
    pub id: String,
    pub vid: u64,
    pub operation: Operation,
    pub role: LockRole,
}

impl ItemLock {
    pub fn reserved(key: &ResourceKey, vid: u64, operation: Operation) -> Self {
        Self {
            resource_type: key.resource_type.clone(),
            id: key.id.clone(),
            vid,
            operation,
            role: LockRole::Reserved,
        }
    }

    pub fn staged(key: &ResourceKey, vid: u64, operation: Operation) -> Self {
        Self {
            role: LockRole::Staged,
            ..Self::reserved(key, vid, operation)
        }
    }

    /// Final transition applied once every entry has been staged.
    ///
    /// | role     | operation | from           | to        |
    /// |----------|-----------|----------------|-----------|
    /// | staged   | any       | PENDING        | AVAILABLE |
    /// | reserved | update    | LOCKED         | DELETED   |
    /// | reserved | delete    | PENDING_DELETE | DELETED   |
    /// | reserved | read      | LOCKED         | AVAILABLE |
    pub fn commit_op(&self, ctx: &WriteContext) -> Result<WriteOp> {
        let (from, to) = match (self.role, self.operation) {
            (LockRole::Staged, _) => (DocumentStatus::Pending, DocumentStatus::Available),
            (LockRole::Reserved, Operation::Delete) => {
                (DocumentStatus::PendingDelete, DocumentStatus::Deleted)
            }
            (LockRole::Reserved, Operation::Update) => {
                (DocumentStatus::Locked, DocumentStatus::Deleted)
            }
            (LockRole::Reserved, _) => (DocumentStatus::Locked, DocumentStatus::Available),
        };
        status_update(
            &self.resource_type,
            &self.id,
            self.vid,
            to,
            StatusGuard::AnyOf(vec![from]),
            ctx,
        )
        .map(WriteOp::UpdateStatus)
    }

    /// Undo this lock: staged rows are removed, reserved rows become
    /// AVAILABLE again.
    pub fn rollback_op(&self, ctx: &WriteContext) -> Result<WriteOp> {
        match self.role {
            LockRole::Staged => Ok(delete_item(ctx.item_key(&self.id, self.vid)?)),
            LockRole::Reserved => status_update(
                &self.resource_type,
                &self.id,
                self.vid,
                DocumentStatus::Available,
                StatusGuard::AnyOf(vec![DocumentStatus::Locked, DocumentStatus::PendingDelete]),
                ctx,
            )
            .map(WriteOp::UpdateStatus),
        }
    }
}

pub fn commit_ops(locks: &[ItemLock], ctx: &WriteContext) -> Result<Vec<WriteOp>> {
    locks.iter().map(|lock| lock.commit_op(ctx)).collect()
}

pub fn rollback_ops(locks: &[ItemLock], ctx: &WriteContext) -> Result<Vec<WriteOp>> {
    locks.iter().map(|lock| lock.rollback_op(ctx)).collect()
}
