//! Tenant directory and scoped tenant bindings.

pub mod binding;
pub mod directory;
pub mod domain;

pub use binding::{TenantContext, TenantScope};
pub use directory::{TenantDirectory, TenantResolver, VERSIONS_PATH};
pub use domain::{NewTenant, SchemaName, Tenant, TenantState, TenancyError, PUBLIC_SCHEMA};
