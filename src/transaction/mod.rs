// ============================================================================
// Bundle Transactions
// ============================================================================
//
// Multi-resource writes on top of a store that only guarantees atomicity per
// call and per small item group.
//
// - Transaction: lock -> resolve references -> stage -> commit / rollback,
//   driven by conditional status transitions (optimistic locking with TTL)
// - Batch: independent best-effort entries, no locking
//
// ============================================================================

pub mod batch;
pub mod coordinator;
pub mod lock;
pub mod references;
pub mod staging;

pub use batch::BatchCoordinator;
pub use coordinator::TransactionCoordinator;
pub use lock::{ItemLock, LockRole};
pub use references::{ParsedReference, ReferenceResolver, parse_reference};
pub use staging::{PlannedEntry, StagingPlan, StagingPlanner};
