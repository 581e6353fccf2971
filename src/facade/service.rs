use crate::bundle::{BundleEntryRequest, BundleRequest, BundleResponse, ErrorType};
use crate::config::PersistenceConfig;
use crate::core::{DocumentStatus, PersistenceError, Result};
use crate::storage::item::{clean_item, prep_item_for_insert};
use crate::storage::params::status_update;
use crate::storage::{
    PutCondition, ResourceReader, StatusGuard, StoreError, VersionedStore, WriteContext,
};
use crate::transaction::{BatchCoordinator, TransactionCoordinator};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{Level, event};
use uuid::Uuid;

lazy_static! {
    static ref RESOURCE_ID_PATTERN: Regex = Regex::new(r"^[a-zA-Z0-9\-.]{1,64}$").unwrap();
}

/// A single resource handed back by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceResponse {
    pub message: String,
    pub resource: Value,
}

impl ResourceResponse {
    fn new(message: impl Into<String>, resource: Value) -> Self {
        Self {
            message: message.into(),
            resource,
        }
    }
}

/// Entry point for resource-level and bundle-level persistence calls.
///
/// # Examples
///
/// ```no_run
/// use bundledb::{DataService, InMemoryStore, PersistenceConfig};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn demo() -> bundledb::Result<()> {
/// let service = DataService::new(Arc::new(InMemoryStore::new()), PersistenceConfig::new());
/// let created = service
///     .create_resource("Patient", json!({"active": true}), None)
///     .await?;
/// let id = created.resource["id"].as_str().unwrap_or_default().to_string();
/// let read = service.read_resource("Patient", &id, None).await?;
/// assert_eq!(read.resource["meta"]["versionId"], json!("1"));
/// # Ok(())
/// # }
/// ```
pub struct DataService {
    store: Arc<dyn VersionedStore>,
    reader: ResourceReader,
    transactions: TransactionCoordinator,
    batches: BatchCoordinator,
    config: PersistenceConfig,
}

impl DataService {
    pub fn new(store: Arc<dyn VersionedStore>, config: PersistenceConfig) -> Self {
        Self {
            reader: ResourceReader::new(store.clone()),
            transactions: TransactionCoordinator::new(store.clone(), config.clone()),
            batches: BatchCoordinator::new(store.clone(), config.clone()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn reader(&self) -> &ResourceReader {
        &self.reader
    }

    pub async fn read_resource(
        &self,
        resource_type: &str,
        id: &str,
        tenant_id: Option<&str>,
    ) -> Result<ResourceResponse> {
        self.config.assert_tenancy(tenant_id)?;
        let item = self
            .reader
            .get_user_readable(resource_type, id, tenant_id)
            .await?;
        Ok(ResourceResponse::new("Resource found", clean_item(&item)))
    }

    pub async fn vread_resource(
        &self,
        resource_type: &str,
        id: &str,
        vid: u64,
        tenant_id: Option<&str>,
    ) -> Result<ResourceResponse> {
        self.config.assert_tenancy(tenant_id)?;
        let item = self
            .reader
            .get_version(resource_type, id, vid, tenant_id)
            .await?;
        Ok(ResourceResponse::new("Resource found", clean_item(&item)))
    }

    /// Create a resource under a server-assigned id.
    pub async fn create_resource(
        &self,
        resource_type: &str,
        resource: Value,
        tenant_id: Option<&str>,
    ) -> Result<ResourceResponse> {
        self.config.assert_tenancy(tenant_id)?;
        let id = Uuid::new_v4().to_string();
        self.create_resource_with_id(resource_type, &id, resource, tenant_id)
            .await
    }

    /// Create version 1 of `resource_type/id`; fails if the id is taken.
    pub async fn create_resource_with_id(
        &self,
        resource_type: &str,
        id: &str,
        resource: Value,
        tenant_id: Option<&str>,
    ) -> Result<ResourceResponse> {
        self.config.assert_tenancy(tenant_id)?;
        if !RESOURCE_ID_PATTERN.is_match(id) {
            return Err(PersistenceError::InvalidResource(
                "Resource creation failed, id is not valid".into(),
            ));
        }

        let ctx = WriteContext::new(tenant_id, self.config.lock_duration_ms());
        let item = prep_item_for_insert(
            &resource,
            resource_type,
            id,
            1,
            DocumentStatus::Available,
            &ctx,
        )?;
        let created = clean_item(&item);
        match self.store.put_item(item, PutCondition::IfAbsent).await {
            Ok(()) => Ok(ResourceResponse::new("Resource created", created)),
            Err(err) if err.is_conditional_failure() => Err(PersistenceError::Conflict(
                "Resource creation failed, id matches an existing resource".into(),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Write a new version through a one-entry transaction.
    pub async fn update_resource(
        &self,
        resource_type: &str,
        id: &str,
        resource: Value,
        tenant_id: Option<&str>,
    ) -> Result<ResourceResponse> {
        self.config.assert_tenancy(tenant_id)?;
        if let Err(err) = self
            .reader
            .get_user_readable(resource_type, id, tenant_id)
            .await
        {
            if !(err.is_not_found() && self.config.update_create_supported) {
                return Err(err);
            }
            // A resource with deleted history is recreated above its last
            // version, which the transaction path handles.
            if self.reader.latest_vid(resource_type, id, tenant_id).await?.is_none() {
                return self
                    .create_resource_with_id(resource_type, id, resource, tenant_id)
                    .await;
            }
        }

        let mut request =
            BundleRequest::new(vec![BundleEntryRequest::update(resource_type, id, resource)]);
        request.tenant_id = tenant_id.map(str::to_string);
        let response = self.transactions.transaction(request).await?;
        if !response.success {
            return Err(bundle_error(response));
        }

        let updated = response
            .entries
            .into_iter()
            .next()
            .map(|entry| entry.resource)
            .unwrap_or_default();
        Ok(ResourceResponse::new("Resource updated", updated))
    }

    /// Mark the current version DELETED.
    pub async fn delete_resource(
        &self,
        resource_type: &str,
        id: &str,
        tenant_id: Option<&str>,
    ) -> Result<String> {
        self.config.assert_tenancy(tenant_id)?;
        let current = self
            .reader
            .get_user_readable(resource_type, id, tenant_id)
            .await?;

        let ctx = WriteContext::new(tenant_id, self.config.lock_duration_ms());
        let update = status_update(
            resource_type,
            id,
            current.vid,
            DocumentStatus::Deleted,
            StatusGuard::AnyOf(vec![DocumentStatus::Available]),
            &ctx,
        )?;
        match self.store.update_status(update).await {
            Ok(()) => Ok(format!(
                "Successfully deleted ResourceType: {resource_type}, Id: {id}, VersionId: {}",
                current.vid
            )),
            Err(StoreError::ConditionalCheckFailed) => {
                event!(Level::WARN, resource_type, id, vid = current.vid, "delete lost a race");
                Err(PersistenceError::Conflict(format!(
                    "{resource_type}/{id} is being modified by another request"
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn transaction(&self, request: BundleRequest) -> Result<BundleResponse> {
        self.transactions.transaction(request).await
    }

    pub async fn batch(&self, request: BundleRequest) -> Result<BundleResponse> {
        self.batches.batch(request).await
    }
}

fn bundle_error(response: BundleResponse) -> PersistenceError {
    match response.error_type {
        Some(ErrorType::ConflictError) => PersistenceError::Conflict(response.message),
        error_type => PersistenceError::BundleFailed {
            error_type: error_type.unwrap_or(ErrorType::SystemError),
            message: response.message,
        },
    }
}
