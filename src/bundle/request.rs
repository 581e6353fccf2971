use crate::core::{Operation, ResourceKey};
use serde_json::Value;
use std::time::Instant;

/// One entry of a transaction or batch bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleEntryRequest {
    pub operation: Operation,
    pub resource_type: String,
    /// Target id. Optional for creates; for updates it falls back to the
    /// payload's own `id`.
    pub id: Option<String>,
    pub resource: Option<Value>,
}

impl BundleEntryRequest {
    pub fn create(resource_type: impl Into<String>, resource: Value) -> Self {
        Self {
            operation: Operation::Create,
            resource_type: resource_type.into(),
            id: None,
            resource: Some(resource),
        }
    }

    pub fn create_with_id(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        resource: Value,
    ) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::create(resource_type, resource)
        }
    }

    pub fn read(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            operation: Operation::Read,
            resource_type: resource_type.into(),
            id: Some(id.into()),
            resource: None,
        }
    }

    pub fn update(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        resource: Value,
    ) -> Self {
        Self {
            operation: Operation::Update,
            resource_type: resource_type.into(),
            id: Some(id.into()),
            resource: Some(resource),
        }
    }

    pub fn delete(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            operation: Operation::Delete,
            resource_type: resource_type.into(),
            id: Some(id.into()),
            resource: None,
        }
    }

    /// Id this entry acts on, if one is known yet.
    pub fn target_id(&self) -> Option<&str> {
        self.id.as_deref().or_else(|| {
            self.resource
                .as_ref()
                .and_then(|resource| resource.get("id"))
                .and_then(Value::as_str)
        })
    }

    pub fn key(&self) -> Option<ResourceKey> {
        self.target_id()
            .map(|id| ResourceKey::new(self.resource_type.clone(), id))
    }

    /// Payload to store, or an empty object for entries that carry none.
    pub fn payload(&self) -> Value {
        self.resource
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }
}

/// A bundle as handed over by the API layer.
#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub entries: Vec<BundleEntryRequest>,
    pub tenant_id: Option<String>,
    /// Start of the caller's request; the time budget is measured from here.
    pub start_time: Instant,
}

impl BundleRequest {
    pub fn new(entries: Vec<BundleEntryRequest>) -> Self {
        Self {
            entries,
            tenant_id: None,
            start_time: Instant::now(),
        }
    }

    /// Set the tenant the bundle runs under
    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set the instant the time budget is measured from
    pub fn started_at(mut self, start_time: Instant) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
