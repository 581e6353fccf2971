use crate::core::Operation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Failure classification surfaced to the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    /// Bad input, unknown resources, size limits, time budget advisories
    UserError,
    /// Unexpected store failures
    SystemError,
    /// Lost a lock race; retry once the lock TTL has passed
    ConflictError,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorType::UserError => write!(f, "USER_ERROR"),
            ErrorType::SystemError => write!(f, "SYSTEM_ERROR"),
            ErrorType::ConflictError => write!(f, "CONFLICT_ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntryResponse {
    pub id: String,
    pub vid: u64,
    pub operation: Operation,
    pub resource_type: String,
    pub last_modified: String,
    pub resource: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BundleEntryResponse {
    pub fn new(
        operation: Operation,
        resource_type: impl Into<String>,
        id: impl Into<String>,
        vid: u64,
    ) -> Self {
        Self {
            id: id.into(),
            vid,
            operation,
            resource_type: resource_type.into(),
            last_modified: String::new(),
            resource: Value::Object(Default::default()),
            error: None,
        }
    }

    pub fn last_modified(mut self, last_modified: impl Into<String>) -> Self {
        self.last_modified = last_modified.into();
        self
    }

    pub fn resource(mut self, resource: Value) -> Self {
        self.resource = resource;
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    pub entries: Vec<BundleEntryResponse>,
}

impl BundleResponse {
    pub fn success(message: impl Into<String>, entries: Vec<BundleEntryResponse>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_type: None,
            retry_after: None,
            entries,
        }
    }

    pub fn failure(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error_type: Some(error_type),
            retry_after: None,
            entries: Vec::new(),
        }
    }

    pub fn user_error(message: impl Into<String>) -> Self {
        Self::failure(ErrorType::UserError, message)
    }

    pub fn system_error(message: impl Into<String>) -> Self {
        Self::failure(ErrorType::SystemError, message)
    }

    pub fn conflict(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::failure(ErrorType::ConflictError, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_conflict_carries_retry_hint() {
        let response = BundleResponse::conflict("busy", Duration::from_secs(35));
        assert!(!response.success);
        assert_eq!(response.error_type, Some(ErrorType::ConflictError));
        assert_eq!(response.retry_after, Some(Duration::from_secs(35)));
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let entry = BundleEntryResponse::new(Operation::Read, "Patient", "p1", 2)
            .last_modified("2024-01-01T00:00:00.000Z");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["resourceType"], json!("Patient"));
        assert_eq!(value["lastModified"], json!("2024-01-01T00:00:00.000Z"));
        assert_eq!(value["operation"], json!("read"));
        assert!(value.get("error").is_none());
    }
}
