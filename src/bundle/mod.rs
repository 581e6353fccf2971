// ============================================================================
// Bundle Model
// ============================================================================
//
// Request and response shapes exchanged with the API layer. A bundle is an
// ordered list of create/read/update/delete entries, applied either
// atomically (transaction) or independently (batch).
//
// ============================================================================

pub mod request;
pub mod response;

pub use request::{BundleEntryRequest, BundleRequest};
pub use response::{BundleEntryResponse, BundleResponse, ErrorType};
