use super::engine::ItemKey;
use super::params::WriteContext;
use crate::core::{DocumentStatus, PersistenceError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const HASH_KEY_SEPARATOR: char = '|';
const HASH_KEY_MAX_LENGTH: usize = 100;
pub(crate) const SUBSCRIPTION_TYPE: &str = "Subscription";
const SUBSCRIPTION_ACTIVE: &str = "active";

/// One physical version row as kept by the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredItem {
    /// Tenant-qualified partition key
    pub hash_key: String,
    /// Tenant-less resource id
    pub id: String,
    pub vid: u64,
    pub resource_type: String,
    pub document_status: DocumentStatus,
    /// Epoch millis after which a transitional status may be stolen
    pub lock_end_ts: i64,
    /// Every outbound `*.reference` value of the payload
    pub references: Vec<String>,
    pub tenant_id: Option<String>,
    pub subscription_status: Option<String>,
    pub resource: Value,
}

impl StoredItem {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.hash_key.clone(), self.vid)
    }

    pub fn last_updated(&self) -> String {
        self.resource
            .pointer("/meta/lastUpdated")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

/// Partition key for `id`, qualified by tenant when one is given.
pub fn build_hash_key(id: &str, tenant_id: Option<&str>) -> Result<String> {
    let hash_key = match tenant_id {
        Some(tenant) => format!("{tenant}{HASH_KEY_SEPARATOR}{id}"),
        None => id.to_string(),
    };
    if hash_key.len() >= HASH_KEY_MAX_LENGTH {
        return Err(PersistenceError::BadRequest("id length is too long".into()));
    }
    Ok(hash_key)
}

/// Build the row for a new version of `resource`.
///
/// The payload gets its id, resource type and a system-generated
/// `meta.versionId` / `meta.lastUpdated`; any other meta fields the caller
/// supplied are kept.
pub fn prep_item_for_insert(
    resource: &Value,
    resource_type: &str,
    id: &str,
    vid: u64,
    status: DocumentStatus,
    ctx: &WriteContext,
) -> Result<StoredItem> {
    let hash_key = build_hash_key(id, ctx.tenant_id.as_deref())?;

    let mut payload = resource.clone();
    let fields = payload.as_object_mut().ok_or_else(|| {
        PersistenceError::InvalidResource(format!(
            "{resource_type}/{id} payload must be a JSON object"
        ))
    })?;
    fields.insert("id".into(), Value::String(id.to_string()));
    fields.insert("resourceType".into(), Value::String(resource_type.to_string()));

    let mut meta = match fields.remove("meta") {
        Some(Value::Object(existing)) => existing,
        _ => Map::new(),
    };
    meta.insert("versionId".into(), Value::String(vid.to_string()));
    meta.insert("lastUpdated".into(), Value::String(ctx.timestamp()));
    fields.insert("meta".into(), Value::Object(meta));

    let mut subscription_status = None;
    if resource_type == SUBSCRIPTION_TYPE
        && matches!(status, DocumentStatus::Available | DocumentStatus::Pending)
        && matches!(
            fields.get("status").and_then(Value::as_str),
            Some("active") | Some("requested")
        )
    {
        subscription_status = Some(SUBSCRIPTION_ACTIVE.to_string());
        fields.insert("status".into(), Value::String(SUBSCRIPTION_ACTIVE.to_string()));
    }

    let references = extract_references(&payload);

    Ok(StoredItem {
        hash_key,
        id: id.to_string(),
        vid,
        resource_type: resource_type.to_string(),
        document_status: status,
        lock_end_ts: ctx.lock_end_for(status),
        references,
        tenant_id: ctx.tenant_id.clone(),
        subscription_status,
        resource: payload,
    })
}

/// User-visible payload of a row; bookkeeping stays in the row.
pub fn clean_item(item: &StoredItem) -> Value {
    let mut payload = item.resource.clone();
    if let Some(fields) = payload.as_object_mut() {
        fields.insert("id".into(), Value::String(item.id.clone()));
    }
    payload
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A string leaf whose path ends in `.reference`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceField {
    pub path: Vec<PathSegment>,
    pub value: String,
}

impl ReferenceField {
    /// Flattened form, e.g. `contact.0.organization.reference`.
    pub fn dotted_path(&self) -> String {
        self.path
            .iter()
            .map(|segment| match segment {
                PathSegment::Key(key) => key.clone(),
                PathSegment::Index(index) => index.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

pub fn reference_fields(resource: &Value) -> Vec<ReferenceField> {
    let mut found = Vec::new();
    let mut path = Vec::new();
    collect_reference_fields(resource, &mut path, &mut found);
    found
}

fn collect_reference_fields(
    value: &Value,
    path: &mut Vec<PathSegment>,
    found: &mut Vec<ReferenceField>,
) {
    match value {
        Value::Object(fields) => {
            for (key, child) in fields {
                path.push(PathSegment::Key(key.clone()));
                collect_reference_fields(child, path, found);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                path.push(PathSegment::Index(index));
                collect_reference_fields(child, path, found);
                path.pop();
            }
        }
        Value::String(text) => {
            let is_reference =
                path.len() > 1 && matches!(path.last(), Some(PathSegment::Key(k)) if k == "reference");
            if is_reference {
                found.push(ReferenceField {
                    path: path.clone(),
                    value: text.clone(),
                });
            }
        }
        _ => {}
    }
}

pub fn extract_references(resource: &Value) -> Vec<String> {
    reference_fields(resource)
        .into_iter()
        .map(|field| field.value)
        .collect()
}

/// Overwrite the string at `path`. Returns false if the path does not exist.
pub fn set_at_path(resource: &mut Value, path: &[PathSegment], replacement: String) -> bool {
    let mut cursor = resource;
    for segment in path {
        let next = match segment {
            PathSegment::Key(key) => cursor.get_mut(key.as_str()),
            PathSegment::Index(index) => cursor.get_mut(*index),
        };
        match next {
            Some(child) => cursor = child,
            None => return false,
        }
    }
    *cursor = Value::String(replacement);
    true
}
