use super::lock::ItemLock;
use crate::bundle::BundleEntryResponse;
use crate::core::{DocumentStatus, Operation, PersistenceError, ResourceKey, Result};
use crate::storage::item::{clean_item, prep_item_for_insert};
use crate::storage::params::{put_new_item, transition};
use crate::storage::{ItemKey, StoredItem, WriteContext, WriteOp};
use serde_json::Value;

/// A bundle entry after the lock phase, ready to be staged.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEntry {
    /// Position in the original bundle
    pub position: usize,
    pub operation: Operation,
    pub key: ResourceKey,
    pub resource: Value,
    /// Version this entry builds on: the locked row, the deleted row an
    /// upsert replaces, or 0 for a brand new resource
    pub base_vid: u64,
}

impl PlannedEntry {
    /// Version this entry writes or, for reads and deletes, touches.
    pub fn target_vid(&self) -> u64 {
        match self.operation {
            Operation::Create | Operation::Update => self.base_vid + 1,
            Operation::Read | Operation::Delete => self.base_vid,
        }
    }

    pub fn writes_new_version(&self) -> bool {
        matches!(self.operation, Operation::Create | Operation::Update)
    }
}

/// Point-fetch queued for a locked read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadSlot {
    pub position: usize,
    pub key: ItemKey,
}

/// Everything the stage phase writes, plus the responses it will report.
#[derive(Debug, Default)]
pub struct StagingPlan {
    /// Deletes, then creates, then updates
    pub writes: Vec<WriteOp>,
    /// Row each write introduces, aligned with `writes`
    pub staged: Vec<Option<ItemLock>>,
    pub reads: Vec<ReadSlot>,
    responses: Vec<Option<BundleEntryResponse>>,
}

impl StagingPlan {
    /// New rows written by the writes at `positions`.
    pub fn staged_locks(&self, positions: &[usize]) -> Vec<ItemLock> {
        positions
            .iter()
            .filter_map(|&position| self.staged.get(position).cloned().flatten())
            .collect()
    }

    pub fn read_keys(&self) -> Vec<ItemKey> {
        self.reads.iter().map(|slot| slot.key.clone()).collect()
    }

    /// Attach fetched rows to their read responses. Every queued read must
    /// have found its row.
    pub fn fill_reads(&mut self, items: Vec<Option<StoredItem>>) -> Result<()> {
        for (slot, item) in self.reads.iter().zip(items) {
            let item = item.ok_or_else(|| {
                PersistenceError::BadRequest(format!("locked version {} vanished", slot.key))
            })?;
            let response = BundleEntryResponse::new(
                Operation::Read,
                item.resource_type.clone(),
                item.id.clone(),
                item.vid,
            )
            .last_modified(item.last_updated())
            .resource(clean_item(&item));
            if let Some(entry) = self.responses.get_mut(slot.position) {
                *entry = Some(response);
            }
        }
        Ok(())
    }

    /// Responses in original bundle order.
    pub fn into_responses(self) -> Vec<BundleEntryResponse> {
        self.responses.into_iter().flatten().collect()
    }
}

/// Turns planned entries into the write set of the stage phase.
pub struct StagingPlanner<'a> {
    ctx: &'a WriteContext,
}

impl<'a> StagingPlanner<'a> {
    pub fn new(ctx: &'a WriteContext) -> Self {
        Self { ctx }
    }

    pub fn plan(&self, entries: &[PlannedEntry]) -> Result<StagingPlan> {
        let slots = entries
            .iter()
            .map(|entry| entry.position + 1)
            .max()
            .unwrap_or_default();
        let mut plan = StagingPlan {
            responses: vec![None; slots],
            ..StagingPlan::default()
        };

        let mut deletes = Vec::new();
        let mut creates = Vec::new();
        let mut updates = Vec::new();

        for entry in entries {
            match entry.operation {
                Operation::Delete => {
                    let op = transition(
                        &entry.key.resource_type,
                        &entry.key.id,
                        entry.base_vid,
                        DocumentStatus::Locked,
                        DocumentStatus::PendingDelete,
                        self.ctx,
                    )?;
                    deletes.push((WriteOp::UpdateStatus(op), None));
                    plan.responses[entry.position] = Some(
                        BundleEntryResponse::new(
                            Operation::Delete,
                            entry.key.resource_type.clone(),
                            entry.key.id.clone(),
                            entry.base_vid,
                        )
                        .last_modified(self.ctx.timestamp()),
                    );
                }
                Operation::Create | Operation::Update => {
                    let vid = entry.target_vid();
                    let item = prep_item_for_insert(
                        &entry.resource,
                        &entry.key.resource_type,
                        &entry.key.id,
                        vid,
                        DocumentStatus::Pending,
                        self.ctx,
                    )?;
                    plan.responses[entry.position] = Some(
                        BundleEntryResponse::new(
                            entry.operation,
                            entry.key.resource_type.clone(),
                            entry.key.id.clone(),
                            vid,
                        )
                        .last_modified(item.last_updated())
                        .resource(clean_item(&item)),
                    );
                    let staged = Some(ItemLock::staged(&entry.key, vid, entry.operation));
                    let bucket = if entry.operation == Operation::Create {
                        &mut creates
                    } else {
                        &mut updates
                    };
                    bucket.push((put_new_item(item), staged));
                }
                Operation::Read => {
                    plan.reads.push(ReadSlot {
                        position: entry.position,
                        key: self.ctx.item_key(&entry.key.id, entry.base_vid)?,
                    });
                }
            }
        }

        for (op, staged) in deletes.into_iter().chain(creates).chain(updates) {
            plan.writes.push(op);
            plan.staged.push(staged);
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(position: usize, operation: Operation, id: &str, base_vid: u64) -> PlannedEntry {
        PlannedEntry {
            position,
            operation,
            key: ResourceKey::new("Patient", id),
            resource: json!({"active": true}),
            base_vid,
        }
    }

    #[test]
    fn test_plan_orders_deletes_creates_updates() {
        let ctx = WriteContext::new(None, 35_000);
        let entries = vec![
            entry(0, Operation::Update, "u1", 3),
            entry(1, Operation::Create, "c1", 0),
            entry(2, Operation::Read, "r1", 7),
            entry(3, Operation::Delete, "d1", 2),
        ];
        let plan = StagingPlanner::new(&ctx).plan(&entries).unwrap();

        let keys: Vec<String> = plan.writes.iter().map(|op| op.key().to_string()).collect();
        assert_eq!(keys, vec!["d1_2", "c1_1", "u1_4"]);
        assert!(plan.staged[0].is_none());
        assert_eq!(plan.staged[2].as_ref().map(|lock| lock.vid), Some(4));
        assert_eq!(plan.read_keys(), vec![ItemKey::new("r1", 7)]);
    }

    #[test]
    fn test_responses_follow_request_order() {
        let ctx = WriteContext::new(None, 35_000);
        let entries = vec![
            entry(0, Operation::Read, "r1", 2),
            entry(1, Operation::Create, "c1", 0),
        ];
        let mut plan = StagingPlanner::new(&ctx).plan(&entries).unwrap();
        let fetched = StoredItem {
            hash_key: "r1".into(),
            id: "r1".into(),
            vid: 2,
            resource_type: "Patient".into(),
            document_status: DocumentStatus::Locked,
            lock_end_ts: 0,
            references: Vec::new(),
            tenant_id: None,
            subscription_status: None,
            resource: json!({"id": "r1", "meta": {"lastUpdated": "2024-01-01T00:00:00.000Z"}}),
        };
        plan.fill_reads(vec![Some(fetched)]).unwrap();

        let responses = plan.into_responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].operation, Operation::Read);
        assert_eq!(responses[0].vid, 2);
        assert_eq!(responses[1].operation, Operation::Create);
        assert_eq!(responses[1].resource["meta"]["versionId"], json!("1"));
    }

    #[test]
    fn test_missing_read_row_fails_the_stage() {
        let ctx = WriteContext::new(None, 35_000);
        let mut plan = StagingPlanner::new(&ctx)
            .plan(&[entry(0, Operation::Read, "r1", 2)])
            .unwrap();
        assert!(plan.fill_reads(vec![None]).is_err());
    }
}
