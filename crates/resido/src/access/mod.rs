//! Tenant-scoped data access and row-level access filtering.

pub mod rla;
pub mod store;

pub use rla::{AccessLevel, AccessScope, LocationPath, RowFilter, RowScoped};
pub use store::{require_tenant, AccessError, Partitioned};
