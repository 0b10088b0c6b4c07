//! Subscription plans, the feature gate and the role permission lattice.

pub mod gate;
pub mod permissions;
pub mod plan;

pub use gate::FeatureGate;
pub use permissions::{Action, AttributePermission, ModulePermission, PermissionCatalog, PermissionError};
pub use plan::{Module, Plan, PlanCatalog, PlanModuleComposition, SubModule, TenantSubscription};

/// Module codes the engine's own routes are gated on.
pub mod codes {
    pub const PAYMENTS: &str = "payments";
    pub const BILLING: &str = "billing";
    pub const PROCESSES: &str = "processes";
}
