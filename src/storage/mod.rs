// ============================================================================
// Versioned Document Storage
// ============================================================================
//
// Every write of a resource creates a new physical row keyed by
// (hash key, vid). Rows carry a status and a lock expiry; writers coordinate
// purely through conditional status transitions on those rows.
//
// ============================================================================

pub mod chunk;
pub mod engine;
pub mod item;
pub mod memory;
pub mod params;
pub mod reader;

pub use engine::{
    CancellationReason, ItemKey, PutCondition, StatementError, StatusGuard, StatusStatement,
    StatusUpdate, StoreError, StoreResult, VersionedStore, WriteOp,
};
pub use item::{StoredItem, build_hash_key, clean_item, prep_item_for_insert};
pub use memory::{CallCounts, InMemoryStore};
pub use params::WriteContext;
pub use reader::ResourceReader;
