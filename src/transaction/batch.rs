use crate::bundle::{BundleEntryRequest, BundleEntryResponse, BundleRequest, BundleResponse};
use crate::config::PersistenceConfig;
use crate::core::{DocumentStatus, Operation, Result};
use crate::storage::item::{clean_item, prep_item_for_insert};
use crate::storage::{ResourceReader, StatusStatement, StoredItem, VersionedStore, WriteContext};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

const NOT_FOUND: &str = "404 Not Found";
const BAD_REQUEST: &str = "400 Bad Request";
const INTERNAL_ERROR: &str = "500 Internal Server Error";

/// What the lookup phase found for one entry.
enum Lookup {
    /// Creates need no lookup
    Skipped,
    Readable(StoredItem),
    /// Nothing readable; carries the newest version number for upserts
    Missing { latest_vid: Option<u64> },
    Failed,
}

/// Applies bundle entries independently; one entry failing never affects
/// another.
pub struct BatchCoordinator {
    store: Arc<dyn VersionedStore>,
    reader: ResourceReader,
    config: PersistenceConfig,
}

impl BatchCoordinator {
    pub fn new(store: Arc<dyn VersionedStore>, config: PersistenceConfig) -> Self {
        Self {
            reader: ResourceReader::new(store.clone()),
            store,
            config,
        }
    }

    pub async fn batch(&self, request: BundleRequest) -> Result<BundleResponse> {
        self.config.assert_tenancy(request.tenant_id.as_deref())?;
        let span = info_span!(
            "bundle.batch",
            entries = request.len(),
            tenant = request.tenant_id.as_deref().unwrap_or("-")
        );
        Ok(self.run(request).instrument(span).await)
    }

    async fn run(&self, request: BundleRequest) -> BundleResponse {
        if request.is_empty() {
            return BundleResponse::success("No requests to process", Vec::new());
        }
        if request.len() > self.config.max_batch_size {
            return BundleResponse::user_error(format!(
                "The number of requests exceeds the maximum allowed number of requests ({}). This limit can be configured in the deployment package.",
                self.config.max_batch_size
            ));
        }

        let ctx = WriteContext::new(request.tenant_id.as_deref(), self.config.lock_duration_ms());
        let lookups = join_all(
            request
                .entries
                .iter()
                .map(|entry| self.lookup(entry, ctx.tenant_id.as_deref())),
        )
        .await;

        let mut responses = Vec::with_capacity(request.len());
        let mut deletes: Vec<(usize, StatusStatement)> = Vec::new();
        let mut puts: Vec<(usize, StoredItem)> = Vec::new();

        for (position, (entry, lookup)) in request.entries.iter().zip(lookups).enumerate() {
            let id = match entry.operation {
                Operation::Create => entry.id.clone(),
                _ => entry.target_id().map(str::to_string),
            }
            .unwrap_or_else(|| Uuid::new_v4().to_string());
            let base =
                BundleEntryResponse::new(entry.operation, entry.resource_type.clone(), id.clone(), 0);

            let (response, write) = match (entry.operation, lookup) {
                (Operation::Create, _) => self.prepare_put(base, &entry.payload(), 1, &ctx),
                (Operation::Update, Lookup::Readable(current)) => {
                    let merged = shallow_merge(clean_item(&current), entry.payload());
                    self.prepare_put(base, &merged, current.vid + 1, &ctx)
                }
                (Operation::Update, Lookup::Missing { latest_vid })
                    if self.config.update_create_supported =>
                {
                    let vid = latest_vid.unwrap_or_default() + 1;
                    self.prepare_put(base, &entry.payload(), vid, &ctx)
                }
                (Operation::Delete, Lookup::Readable(current)) => {
                    deletes.push((
                        position,
                        StatusStatement {
                            key: current.key(),
                            new_status: DocumentStatus::Deleted,
                        },
                    ));
                    let response = BundleEntryResponse {
                        vid: current.vid,
                        ..base
                    }
                    .last_modified(ctx.timestamp());
                    (response, None)
                }
                (Operation::Read, Lookup::Readable(current)) => {
                    let response = BundleEntryResponse {
                        vid: current.vid,
                        ..base
                    }
                    .last_modified(current.last_updated())
                    .resource(clean_item(&current));
                    (response, None)
                }
                (_, Lookup::Failed) => (base.error(INTERNAL_ERROR), None),
                _ => {
                    event!(Level::DEBUG, resource_type = %entry.resource_type, id = %id, "failed to find resource");
                    (base.error(NOT_FOUND), None)
                }
            };

            if let Some(item) = write {
                puts.push((position, item));
            }
            responses.push(response);
        }

        self.execute_deletes(deletes, &mut responses).await;
        self.execute_puts(puts, &mut responses).await;

        event!(Level::INFO, "successfully completed batch items");
        BundleResponse::success("Successfully processed bundle", responses)
    }

    async fn lookup(&self, entry: &BundleEntryRequest, tenant_id: Option<&str>) -> Lookup {
        if entry.operation == Operation::Create {
            return Lookup::Skipped;
        }
        let Some(id) = entry.target_id() else {
            return Lookup::Missing { latest_vid: None };
        };
        match self
            .reader
            .get_user_readable(&entry.resource_type, id, tenant_id)
            .await
        {
            Ok(item) => Lookup::Readable(item),
            Err(err) if err.is_not_found() => {
                if entry.operation != Operation::Update || !self.config.update_create_supported {
                    return Lookup::Missing { latest_vid: None };
                }
                match self.reader.latest_vid(&entry.resource_type, id, tenant_id).await {
                    Ok(latest_vid) => Lookup::Missing { latest_vid },
                    Err(err) => {
                        event!(Level::ERROR, error = %err, "failed to read latest version");
                        Lookup::Failed
                    }
                }
            }
            Err(err) => {
                event!(Level::ERROR, error = %err, "failed to read resource");
                Lookup::Failed
            }
        }
    }

    fn prepare_put(
        &self,
        base: BundleEntryResponse,
        payload: &Value,
        vid: u64,
        ctx: &WriteContext,
    ) -> (BundleEntryResponse, Option<StoredItem>) {
        match prep_item_for_insert(
            payload,
            &base.resource_type,
            &base.id,
            vid,
            DocumentStatus::Available,
            ctx,
        ) {
            Ok(item) => {
                let response = BundleEntryResponse { vid, ..base }
                    .last_modified(item.last_updated())
                    .resource(clean_item(&item));
                (response, Some(item))
            }
            Err(err) => {
                event!(Level::WARN, error = %err, "rejected batch entry");
                (base.error(BAD_REQUEST), None)
            }
        }
    }

    async fn execute_deletes(
        &self,
        deletes: Vec<(usize, StatusStatement)>,
        responses: &mut [BundleEntryResponse],
    ) {
        let chunks: Vec<&[(usize, StatusStatement)]> =
            deletes.chunks(self.config.batch_chunk_size.max(1)).collect();
        let calls = chunks.iter().map(|chunk| {
            let statements = chunk.iter().map(|(_, statement)| statement.clone()).collect();
            self.store.batch_execute(statements)
        });

        for (chunk, result) in chunks.iter().zip(join_all(calls).await) {
            match result {
                Ok(errors) => {
                    for ((position, _), error) in chunk.iter().zip(errors) {
                        if let Some(error) = error {
                            event!(Level::WARN, error = %error, "batch delete statement failed");
                            responses[*position].error = Some(error.to_string());
                        }
                    }
                }
                Err(err) => {
                    event!(Level::ERROR, error = %err, "batch delete chunk failed");
                    for (position, _) in chunk.iter() {
                        responses[*position].error = Some(INTERNAL_ERROR.to_string());
                    }
                }
            }
        }
    }

    async fn execute_puts(
        &self,
        puts: Vec<(usize, StoredItem)>,
        responses: &mut [BundleEntryResponse],
    ) {
        let chunks: Vec<&[(usize, StoredItem)]> =
            puts.chunks(self.config.batch_chunk_size.max(1)).collect();
        let calls = chunks.iter().map(|chunk| {
            let items = chunk.iter().map(|(_, item)| item.clone()).collect();
            self.store.batch_write(items)
        });

        for (chunk, result) in chunks.iter().zip(join_all(calls).await) {
            match result {
                Ok(unprocessed) => {
                    for leftover in unprocessed {
                        let key = leftover.key();
                        if let Some((position, _)) = chunk.iter().find(|(_, item)| item.key() == key) {
                            event!(Level::WARN, item = %key, "unable to process request");
                            responses[*position].error = Some(BAD_REQUEST.to_string());
                        }
                    }
                }
                Err(err) => {
                    event!(Level::ERROR, error = %err, "batch write chunk failed");
                    for (position, _) in chunk.iter() {
                        responses[*position].error = Some(INTERNAL_ERROR.to_string());
                    }
                }
            }
        }
    }
}

/// Top-level fields of `patch` replace those of `current`.
fn shallow_merge(mut current: Value, patch: Value) -> Value {
    match (current.as_object_mut(), patch) {
        (Some(fields), Value::Object(patch)) => {
            fields.extend(patch);
            current
        }
        (_, patch) => patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shallow_merge_replaces_top_level_fields() {
        let merged = shallow_merge(
            json!({"id": "p1", "name": [{"family": "Old"}], "active": true}),
            json!({"name": [{"family": "New"}]}),
        );
        assert_eq!(
            merged,
            json!({"id": "p1", "name": [{"family": "New"}], "active": true})
        );
    }
}
