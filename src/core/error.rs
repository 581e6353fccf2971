use crate::bundle::ErrorType;
use crate::storage::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Resource {resource_type}/{id} is not known")]
    ResourceNotFound { resource_type: String, id: String },

    #[error("Version {vid} of resource {resource_type}/{id} is not known")]
    ResourceVersionNotFound {
        resource_type: String,
        id: String,
        vid: u64,
    },

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid tenancy mode: {0}")]
    InvalidTenancy(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{error_type} bundle failure: {message}")]
    BundleFailed {
        error_type: ErrorType,
        message: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl PersistenceError {
    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
