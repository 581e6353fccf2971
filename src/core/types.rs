use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one physical resource version.
///
/// ```text
///              lock                 stage delete
/// AVAILABLE ────────> LOCKED ─────────────────> PENDING_DELETE
///     ^                 │  │                          │
///     └──── rollback ───┘  └── commit (update) ──┐    │ commit
///                                                v    v
/// (new row) ──> PENDING ──── commit ──> AVAILABLE  DELETED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Locked,
    Available,
    PendingDelete,
    Deleted,
}

impl DocumentStatus {
    /// States held by an in-flight writer; these carry a lock expiry.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Pending | DocumentStatus::Locked | DocumentStatus::PendingDelete
        )
    }

    /// Latest-version states whose payload is safe to hand to readers.
    pub fn is_readable(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Available | DocumentStatus::Locked | DocumentStatus::PendingDelete
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentStatus::Pending => write!(f, "PENDING"),
            DocumentStatus::Locked => write!(f, "LOCKED"),
            DocumentStatus::Available => write!(f, "AVAILABLE"),
            DocumentStatus::PendingDelete => write!(f, "PENDING_DELETE"),
            DocumentStatus::Deleted => write!(f, "DELETED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Read => write!(f, "read"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Logical identity of a resource within one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub resource_type: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}
