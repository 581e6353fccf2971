use crate::core::{PersistenceError, Result};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Reference paths that must be pinned to a concrete version at commit time.
///
/// Keys are resource types, values are dotted JSON paths ending in
/// `.reference`, e.g. `"ExplanationOfBenefit" -> {"careTeam.provider.reference"}`.
/// Array indices in a resource's actual path are ignored when matching, so
/// `careTeam.provider.reference` also covers `careTeam.2.provider.reference`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionedLinks {
    links: HashMap<String, HashSet<String>>,
}

impl VersionedLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register reference paths for a resource type
    pub fn with_paths<I, S>(mut self, resource_type: &str, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.links
            .entry(resource_type.to_string())
            .or_default()
            .extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn covers_type(&self, resource_type: &str) -> bool {
        self.links.contains_key(resource_type)
    }

    /// Whether `path` (as found in a payload) is registered for `resource_type`.
    pub fn matches(&self, resource_type: &str, path: &str) -> bool {
        let Some(paths) = self.links.get(resource_type) else {
            return false;
        };
        if paths.contains(path) {
            return true;
        }
        let without_indices = path
            .split('.')
            .filter(|segment| segment.parse::<usize>().is_err())
            .collect::<Vec<_>>()
            .join(".");
        paths.contains(&without_indices)
    }
}

/// Persistence core configuration
///
/// Every limit the coordinators enforce lives here and is handed to them at
/// construction time.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Treat an update of an unknown resource as a create
    pub update_create_supported: bool,

    /// Require a tenant on every call (and reject tenants when disabled)
    pub enable_multi_tenancy: bool,

    /// Wall-clock budget for one transaction, measured from its start time
    pub max_execution_time: Duration,

    /// How long a transitional row stays reserved before others may steal it
    pub lock_duration: Duration,

    /// Absolute ceiling on entries in one transaction bundle
    pub max_transaction_items: usize,

    /// Items per multi-item conditional transaction call
    pub transaction_chunk_size: usize,

    /// Items per best-effort batch call
    pub batch_chunk_size: usize,

    /// Ceiling on entries in one batch bundle
    pub max_batch_size: usize,

    /// Reference paths rewritten to versioned references
    pub versioned_links: Option<VersionedLinks>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceConfig {
    pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(35);
    pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(26);

    /// Create a configuration with the stock limits
    pub fn new() -> Self {
        Self {
            update_create_supported: false,
            enable_multi_tenancy: false,
            max_execution_time: Self::DEFAULT_MAX_EXECUTION_TIME,
            lock_duration: Self::DEFAULT_LOCK_DURATION,
            max_transaction_items: 100,
            transaction_chunk_size: 25,
            batch_chunk_size: 25,
            max_batch_size: 750,
            versioned_links: None,
        }
    }

    /// Enable or disable update-as-create
    pub fn update_create_supported(mut self, enabled: bool) -> Self {
        self.update_create_supported = enabled;
        self
    }

    /// Enable or disable multi-tenancy
    pub fn enable_multi_tenancy(mut self, enabled: bool) -> Self {
        self.enable_multi_tenancy = enabled;
        self
    }

    /// Set the transaction time budget
    pub fn max_execution_time(mut self, budget: Duration) -> Self {
        self.max_execution_time = budget;
        self
    }

    /// Set the lock TTL
    pub fn lock_duration(mut self, ttl: Duration) -> Self {
        self.lock_duration = ttl;
        self
    }

    /// Set the transaction entry ceiling
    pub fn max_transaction_items(mut self, max: usize) -> Self {
        self.max_transaction_items = max;
        self
    }

    /// Set the per-call transaction chunk size
    pub fn transaction_chunk_size(mut self, size: usize) -> Self {
        self.transaction_chunk_size = size;
        self
    }

    /// Set the per-call batch chunk size
    pub fn batch_chunk_size(mut self, size: usize) -> Self {
        self.batch_chunk_size = size;
        self
    }

    /// Set the batch entry ceiling
    pub fn max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    /// Set the versioned reference policy
    pub fn versioned_links(mut self, links: VersionedLinks) -> Self {
        self.versioned_links = Some(links);
        self
    }

    pub fn lock_duration_ms(&self) -> i64 {
        i64::try_from(self.lock_duration.as_millis()).unwrap_or(i64::MAX)
    }

    /// Reject calls whose tenant presence disagrees with the tenancy mode.
    pub fn assert_tenancy(&self, tenant_id: Option<&str>) -> Result<()> {
        match (self.enable_multi_tenancy, tenant_id) {
            (true, None) => Err(PersistenceError::InvalidTenancy(
                "This instance has multi-tenancy enabled, but the incoming request is missing tenantId"
                    .into(),
            )),
            (false, Some(_)) => Err(PersistenceError::InvalidTenancy(
                "This instance has multi-tenancy disabled, but the incoming request has a tenantId"
                    .into(),
            )),
            _ => Ok(()),
        }
    }
}
