// ============================================================================
// Data Service Facade
// ============================================================================
//
// One handle over the reader and both bundle coordinators, built from an
// explicit store and configuration.
//
// ============================================================================

pub mod service;

pub use service::{DataService, ResourceResponse};
