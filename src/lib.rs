// ============================================================================
// BundleDB Library
// ============================================================================
//
// Versioned resource persistence with multi-resource bundles over a document
// store that only offers conditional single-row writes and small
// transactional item groups.
//
// ============================================================================

pub mod bundle;
pub mod config;
pub mod core;
pub mod facade;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use bundle::{BundleEntryRequest, BundleEntryResponse, BundleRequest, BundleResponse, ErrorType};
pub use config::{PersistenceConfig, VersionedLinks};
pub use crate::core::{DocumentStatus, Operation, PersistenceError, ResourceKey, Result};
pub use facade::{DataService, ResourceResponse};
pub use storage::{InMemoryStore, ResourceReader, StoreError, StoredItem, VersionedStore};
pub use transaction::{BatchCoordinator, TransactionCoordinator};
