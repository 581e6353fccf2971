use super::engine::{ItemKey, VersionedStore};
use super::item::{StoredItem, build_hash_key};
use crate::core::{DocumentStatus, PersistenceError, Result};
use std::sync::Arc;
use tracing::{Level, event};

/// Version-aware reads over a [`VersionedStore`].
#[derive(Clone)]
pub struct ResourceReader {
    store: Arc<dyn VersionedStore>,
}

impl ResourceReader {
    pub fn new(store: Arc<dyn VersionedStore>) -> Self {
        Self { store }
    }

    /// Newest row of the resource regardless of its status.
    pub async fn get_latest_committed(
        &self,
        resource_type: &str,
        id: &str,
        tenant_id: Option<&str>,
    ) -> Result<StoredItem> {
        let hash_key = build_hash_key(id, tenant_id)?;
        self.store
            .query_versions(&hash_key, resource_type, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PersistenceError::not_found(resource_type, id))
    }

    /// Newest version a reader is allowed to see.
    ///
    /// A resource whose latest row is PENDING falls back to the version
    /// before it; a deleted resource is not found.
    pub async fn get_user_readable(
        &self,
        resource_type: &str,
        id: &str,
        tenant_id: Option<&str>,
    ) -> Result<StoredItem> {
        let hash_key = build_hash_key(id, tenant_id)?;
        let mut recent = self
            .store
            .query_versions(&hash_key, resource_type, 2)
            .await?
            .into_iter();

        let Some(latest) = recent.next() else {
            return Err(PersistenceError::not_found(resource_type, id));
        };
        if latest.document_status.is_readable() {
            return Ok(latest);
        }
        if latest.document_status == DocumentStatus::Pending {
            if let Some(previous) = recent.next() {
                return Ok(previous);
            }
        }
        event!(
            Level::DEBUG,
            resource_type,
            id,
            status = %latest.document_status,
            "latest version is not readable"
        );
        Err(PersistenceError::not_found(resource_type, id))
    }

    /// One specific version, independent of its status.
    pub async fn get_version(
        &self,
        resource_type: &str,
        id: &str,
        vid: u64,
        tenant_id: Option<&str>,
    ) -> Result<StoredItem> {
        let key = ItemKey::new(build_hash_key(id, tenant_id)?, vid);
        match self.store.get_item(&key).await? {
            Some(item) if item.resource_type == resource_type => Ok(item),
            _ => Err(PersistenceError::ResourceVersionNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                vid,
            }),
        }
    }

    /// Version number of the newest row, if the resource has any.
    pub async fn latest_vid(
        &self,
        resource_type: &str,
        id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<u64>> {
        match self.get_latest_committed(resource_type, id, tenant_id).await {
            Ok(item) => Ok(Some(item.vid)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}
