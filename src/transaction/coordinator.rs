use super::lock::{ItemLock, LockRole, commit_ops, rollback_ops};
use super::references::ReferenceResolver;
use super::staging::{PlannedEntry, StagingPlanner};
use crate::bundle::{BundleEntryResponse, BundleRequest, BundleResponse};
use crate::config::PersistenceConfig;
use crate::core::{DocumentStatus, Operation, PersistenceError, ResourceKey, Result};
use crate::storage::chunk::{applied_positions, first_error, get_in_chunks, write_in_chunks};
use crate::storage::params::lock_update;
use crate::storage::{ResourceReader, StoredItem, VersionedStore, WriteContext};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

const BUDGET_EXCEEDED: &str = "Transaction time is greater than max allowed code execution time. Please reduce your bundle size by sending fewer Bundle entries.";

/// Wall-clock budget of one transaction, measured from the caller's start.
struct Budget {
    started: Instant,
    limit: Duration,
}

impl Budget {
    fn exceeded(&self) -> bool {
        self.started.elapsed() > self.limit
    }
}

/// Bundle entry with its target id settled.
#[derive(Debug)]
struct ValidatedEntry {
    position: usize,
    operation: Operation,
    key: ResourceKey,
    resource: Value,
}

/// Applies a bundle atomically: every entry is committed or none is.
///
/// The store has no multi-call transactions, so atomicity is built from
/// per-row status transitions:
///
/// 1. lock: AVAILABLE -> LOCKED on the latest version of every touched resource
/// 2. resolve versioned references (optional)
/// 3. stage: new PENDING rows, LOCKED -> PENDING_DELETE for deletes
/// 4. commit, or roll every step back
///
/// Locks expire after the configured TTL, so a coordinator that dies
/// mid-flight only blocks its resources until then.
pub struct TransactionCoordinator {
    store: Arc<dyn VersionedStore>,
    reader: ResourceReader,
    config: PersistenceConfig,
}

impl TransactionCoordinator {
    pub fn new(store: Arc<dyn VersionedStore>, config: PersistenceConfig) -> Self {
        Self {
            reader: ResourceReader::new(store.clone()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Run `request` as one transaction.
    ///
    /// Only a tenancy mismatch is returned as `Err`; every other failure is
    /// reported through the response's error type.
    pub async fn transaction(&self, request: BundleRequest) -> Result<BundleResponse> {
        self.config.assert_tenancy(request.tenant_id.as_deref())?;
        let span = info_span!(
            "bundle.transaction",
            entries = request.len(),
            tenant = request.tenant_id.as_deref().unwrap_or("-")
        );
        Ok(self.run(request).instrument(span).await)
    }

    async fn run(&self, request: BundleRequest) -> BundleResponse {
        if request.is_empty() {
            return BundleResponse::success("No requests to process", Vec::new());
        }
        if request.len() > self.config.max_transaction_items {
            let message = format!(
                "Cannot lock more than {} items",
                self.config.max_transaction_items
            );
            event!(Level::ERROR, "{message}");
            return BundleResponse::system_error(message);
        }

        let ctx = WriteContext::new(request.tenant_id.as_deref(), self.config.lock_duration_ms());
        let budget = Budget {
            started: request.start_time,
            limit: self.config.max_execution_time,
        };

        let entries = match self.validate(&request, &ctx) {
            Ok(entries) => entries,
            Err(err) => {
                event!(Level::WARN, error = %err, "transaction rejected");
                return BundleResponse::user_error(err.to_string());
            }
        };

        event!(Level::INFO, "locking begins");
        let (mut planned, mut locks) = match self.lock(entries, &ctx).await {
            Ok(locked) => locked,
            // a failed lock phase has already released what it acquired
            Err(response) => return self.abort(&[], &ctx, &budget, response).await,
        };
        event!(Level::INFO, locked = locks.len(), "finished locking");
        if budget.exceeded() {
            return self.abort_over_budget(&locks, &ctx).await;
        }

        if let Some(links) = &self.config.versioned_links {
            let resolver = ReferenceResolver::new(links, &self.reader, ctx.tenant_id.as_deref());
            if let Err(err) = resolver.resolve(&mut planned).await {
                event!(Level::WARN, error = %err, "failed to resolve versioned references");
                let response =
                    BundleResponse::user_error("Failed to find some resource versions for transaction");
                return self.abort(&locks, &ctx, &budget, response).await;
            }
            if budget.exceeded() {
                return self.abort_over_budget(&locks, &ctx).await;
            }
        }

        let stage_ctx = ctx.refreshed();
        let responses = match self.stage(&planned, &stage_ctx, &mut locks).await {
            Ok(responses) => responses,
            Err(err) => {
                event!(Level::ERROR, error = %err, "failed to stage items");
                let response =
                    BundleResponse::system_error("Failed to stage resources for transaction");
                return self.abort(&locks, &ctx, &budget, response).await;
            }
        };
        if budget.exceeded() {
            return self.abort_over_budget(&locks, &ctx).await;
        }

        self.commit(&locks, &ctx).await;
        BundleResponse::success("Successfully committed requests to DB", responses)
    }

    fn validate(&self, request: &BundleRequest, ctx: &WriteContext) -> Result<Vec<ValidatedEntry>> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(request.len());

        for (position, entry) in request.entries.iter().enumerate() {
            let id = match entry.operation {
                Operation::Create => entry
                    .id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                operation => entry.target_id().map(str::to_string).ok_or_else(|| {
                    PersistenceError::BadRequest(format!(
                        "{operation} entry {position} for {} has no id",
                        entry.resource_type
                    ))
                })?,
            };
            ctx.hash_key(&id)?;

            let key = ResourceKey::new(entry.resource_type.clone(), id);
            let resource = entry.payload();
            if matches!(entry.operation, Operation::Create | Operation::Update)
                && !resource.is_object()
            {
                return Err(PersistenceError::InvalidResource(format!(
                    "{key} must be a JSON object"
                )));
            }
            if !seen.insert(key.clone()) {
                return Err(PersistenceError::BadRequest(format!(
                    "{key} is targeted by more than one bundle entry"
                )));
            }

            entries.push(ValidatedEntry {
                position,
                operation: entry.operation,
                key,
                resource,
            });
        }
        Ok(entries)
    }

    fn may_create_on_update(&self, entry: &ValidatedEntry) -> bool {
        entry.operation == Operation::Update && self.config.update_create_supported
    }

    fn lock_failure(&self, conflict: bool) -> BundleResponse {
        let seconds = self.config.lock_duration.as_secs();
        if conflict {
            BundleResponse::conflict(
                format!(
                    "Failed to lock resources for transaction due to conflict. Please try again after {seconds} seconds."
                ),
                self.config.lock_duration,
            )
        } else {
            BundleResponse::system_error(format!(
                "Failed to lock resources for transaction. Please try again after {seconds} seconds."
            ))
        }
    }

    /// Reserve the latest version of every non-create entry.
    ///
    /// On failure nothing stays locked and the response to return is handed
    /// back as the error.
    async fn lock(
        &self,
        entries: Vec<ValidatedEntry>,
        ctx: &WriteContext,
    ) -> std::result::Result<(Vec<PlannedEntry>, Vec<ItemLock>), BundleResponse> {
        let tenant_id = ctx.tenant_id.as_deref();
        let lookups = entries.iter().map(|entry| async move {
            if entry.operation == Operation::Create {
                return None;
            }
            Some(
                self.reader
                    .get_latest_committed(&entry.key.resource_type, &entry.key.id, tenant_id)
                    .await,
            )
        });
        let latest: Vec<Option<Result<StoredItem>>> = join_all(lookups).await;

        let mut planned = Vec::with_capacity(entries.len());
        let mut locks = Vec::new();
        let mut lock_ops = Vec::new();
        let mut missing = Vec::new();

        for (entry, found) in entries.into_iter().zip(latest) {
            let base_vid = match found {
                None => 0,
                Some(Ok(item)) if item.document_status != DocumentStatus::Deleted => {
                    let op = lock_update(&entry.key.resource_type, &entry.key.id, item.vid, ctx)
                        .map_err(|err| {
                            event!(Level::ERROR, error = %err, "failed to build lock");
                            self.lock_failure(false)
                        })?;
                    lock_ops.push(op);
                    locks.push(ItemLock::reserved(&entry.key, item.vid, entry.operation));
                    item.vid
                }
                Some(Ok(deleted)) if self.may_create_on_update(&entry) => deleted.vid,
                Some(Err(err)) if err.is_not_found() && self.may_create_on_update(&entry) => 0,
                Some(Ok(_)) => {
                    missing.push(entry.key.to_string());
                    continue;
                }
                Some(Err(err)) if err.is_not_found() => {
                    missing.push(entry.key.to_string());
                    continue;
                }
                Some(Err(err)) => {
                    event!(Level::ERROR, error = %err, "failed to read versions to lock");
                    return Err(self.lock_failure(false));
                }
            };
            planned.push(PlannedEntry {
                position: entry.position,
                operation: entry.operation,
                key: entry.key,
                resource: entry.resource,
                base_vid,
            });
        }

        if !missing.is_empty() {
            return Err(BundleResponse::user_error(format!(
                "Failed to find resources: {}",
                missing.join(",")
            )));
        }
        if lock_ops.is_empty() {
            return Ok((planned, locks));
        }

        let outcomes = write_in_chunks(
            self.store.as_ref(),
            &lock_ops,
            self.config.transaction_chunk_size,
        )
        .await;
        if let Some(err) = first_error(&outcomes) {
            event!(Level::ERROR, error = %err, "failed to lock");
            let response = self.lock_failure(err.is_conditional_failure());
            let acquired: Vec<ItemLock> = applied_positions(&outcomes)
                .into_iter()
                .filter_map(|position| locks.get(position).cloned())
                .collect();
            self.rollback(&acquired, ctx).await;
            return Err(response);
        }
        Ok((planned, locks))
    }

    /// Write every PENDING row and PENDING_DELETE transition, then fetch
    /// locked reads. Rows that made it to the store are appended to `locks`
    /// even when a later chunk fails.
    async fn stage(
        &self,
        planned: &[PlannedEntry],
        ctx: &WriteContext,
        locks: &mut Vec<ItemLock>,
    ) -> Result<Vec<BundleEntryResponse>> {
        let mut plan = StagingPlanner::new(ctx).plan(planned)?;

        let outcomes = write_in_chunks(
            self.store.as_ref(),
            &plan.writes,
            self.config.transaction_chunk_size,
        )
        .await;
        locks.extend(plan.staged_locks(&applied_positions(&outcomes)));
        if let Some(err) = first_error(&outcomes) {
            return Err(err.clone().into());
        }

        if !plan.reads.is_empty() {
            let items = get_in_chunks(
                self.store.as_ref(),
                &plan.read_keys(),
                self.config.transaction_chunk_size,
            )
            .await?;
            plan.fill_reads(items)?;
        }
        event!(Level::INFO, writes = plan.writes.len(), reads = plan.reads.len(), "finished staging");
        Ok(plan.into_responses())
    }

    async fn commit(&self, locks: &[ItemLock], ctx: &WriteContext) {
        let ops = match commit_ops(locks, &ctx.refreshed()) {
            Ok(ops) => ops,
            Err(err) => {
                event!(Level::ERROR, error = %err, "failed to build commit");
                return;
            }
        };
        let outcomes =
            write_in_chunks(self.store.as_ref(), &ops, self.config.transaction_chunk_size).await;
        match first_error(&outcomes) {
            Some(err) => event!(
                Level::ERROR,
                error = %err,
                "commit incomplete; unsettled rows recover once their locks expire"
            ),
            None => event!(Level::INFO, rows = ops.len(), "transaction committed"),
        }
    }

    /// Best-effort undo of `locks`. Failures are logged only.
    ///
    /// Staged rows are removed before reserved rows are released, each in
    /// their own calls, so a release that fails its guard never cancels the
    /// removal of a staged row.
    async fn rollback(&self, locks: &[ItemLock], ctx: &WriteContext) {
        if locks.is_empty() {
            return;
        }
        let (staged, reserved): (Vec<ItemLock>, Vec<ItemLock>) = locks
            .iter()
            .cloned()
            .partition(|lock| lock.role == LockRole::Staged);
        let ctx = ctx.refreshed();
        let removed = self.undo(&staged, &ctx, "remove staged rows").await;
        let released = self.undo(&reserved, &ctx, "release locks").await;
        if removed && released {
            event!(Level::WARN, rows = locks.len(), "transaction rolled back");
        }
    }

    async fn undo(&self, locks: &[ItemLock], ctx: &WriteContext, step: &str) -> bool {
        if locks.is_empty() {
            return true;
        }
        let ops = match rollback_ops(locks, ctx) {
            Ok(ops) => ops,
            Err(err) => {
                event!(Level::ERROR, error = %err, step, "failed to build rollback");
                return false;
            }
        };
        let outcomes =
            write_in_chunks(self.store.as_ref(), &ops, self.config.transaction_chunk_size).await;
        match first_error(&outcomes) {
            Some(err) => {
                event!(
                    Level::ERROR,
                    error = %err,
                    step,
                    "rollback incomplete; remaining rows recover once their locks expire"
                );
                false
            }
            None => true,
        }
    }

    /// Roll back, then report `response` unless the time budget ran out
    /// first.
    async fn abort(
        &self,
        locks: &[ItemLock],
        ctx: &WriteContext,
        budget: &Budget,
        response: BundleResponse,
    ) -> BundleResponse {
        self.rollback(locks, ctx).await;
        if budget.exceeded() {
            event!(Level::WARN, "transaction exceeded its time budget");
            return BundleResponse::user_error(BUDGET_EXCEEDED);
        }
        response
    }

    async fn abort_over_budget(&self, locks: &[ItemLock], ctx: &WriteContext) -> BundleResponse {
        event!(Level::WARN, "transaction exceeded its time budget");
        self.rollback(locks, ctx).await;
        BundleResponse::user_error(BUDGET_EXCEEDED)
    }
}
